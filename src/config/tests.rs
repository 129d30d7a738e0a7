//! Configuration tests

use super::*;
use std::collections::HashMap;

const SAMPLE: &str = r#"
listen: "127.0.0.1:9090"
healthCheckTimeout: 60
startPort: 6000
models:
  llama:
    cmd: |
      # local build
      llama-server --port ${PORT} \
        -m /models/llama.gguf
    ttl: 120
    aliases: ["gpt-4o-mini"]
    env: ["CUDA_VISIBLE_DEVICES=0"]
  embed:
    cmd: "embed-server --port ${PORT}"
    proxy: "http://127.0.0.1:${PORT}"
    concurrencyLimit: 4
    sleepMode: enable
    sleepEndpoints:
      - path: /sleep
    wakeEndpoints:
      - path: /wake
        method: POST
        timeout: 30
groups:
  g1:
    swap: true
    exclusive: false
    members: [llama]
"#;

#[test]
fn parses_sample_config() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.listen, "127.0.0.1:9090");
    assert_eq!(config.health_check_timeout, 60);
    assert_eq!(config.start_port, 6000);
    assert_eq!(config.models.len(), 2);

    let llama = &config.models["llama"];
    assert_eq!(llama.ttl, 120);
    assert_eq!(llama.aliases, vec!["gpt-4o-mini"]);
    assert_eq!(llama.check_endpoint, "/health");
    assert!(!llama.sleep_configured());

    let embed = &config.models["embed"];
    assert_eq!(embed.concurrency_limit, 4);
    assert!(embed.sleep_configured());
    assert_eq!(embed.wake_endpoints[0].timeout, Some(30));
    assert_eq!(embed.sleep_endpoints[0].method, "POST");
}

#[test]
fn defaults_apply() {
    let config = Config::from_yaml("models: {}").unwrap();
    assert_eq!(config.listen, "127.0.0.1:8080");
    assert_eq!(config.health_check_timeout, 120);
    assert_eq!(config.sleep_request_timeout, 10);
    assert_eq!(config.wake_request_timeout, 10);
    assert_eq!(config.start_port, 5800);
    assert_eq!(config.metrics_max_in_memory, 1000);
    assert!(config.api_keys.is_empty());
}

#[test]
fn group_defaults_are_swap_exclusive() {
    let config = Config::from_yaml(
        r#"
models:
  a:
    cmd: "srv --port ${PORT}"
groups:
  g:
    members: [a]
"#,
    )
    .unwrap();
    let g = &config.groups["g"];
    assert!(g.swap);
    assert!(g.exclusive);
    assert!(!g.persistent);
}

#[test]
fn rejects_empty_cmd() {
    let err = Config::from_yaml("models:\n  a:\n    cmd: \"  \"\n").unwrap_err();
    assert!(err.to_string().contains("cmd"));
}

#[test]
fn rejects_short_health_check_timeout() {
    let err = Config::from_yaml("healthCheckTimeout: 5\n").unwrap_err();
    assert!(err.to_string().contains("healthCheckTimeout"));
}

#[test]
fn rejects_unknown_group_member() {
    let err = Config::from_yaml(
        r#"
models:
  a:
    cmd: "srv"
groups:
  g:
    members: [missing]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown member"));
}

#[test]
fn rejects_model_in_two_groups() {
    let err = Config::from_yaml(
        r#"
models:
  a:
    cmd: "srv"
groups:
  g1:
    members: [a]
  g2:
    members: [a]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("more than one group"));
}

#[test]
fn rejects_alias_collision() {
    let err = Config::from_yaml(
        r#"
models:
  a:
    cmd: "srv"
  b:
    cmd: "srv"
    aliases: ["a"]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("collides"));
}

#[test]
fn rejects_malformed_env_entry() {
    let err = Config::from_yaml(
        r#"
models:
  a:
    cmd: "srv"
    env: ["JUST_A_NAME"]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("NAME=value"));
}

#[test]
fn resolve_prefers_canonical_id_over_alias() {
    let config = Config::from_yaml(
        r#"
models:
  real:
    cmd: "srv"
    aliases: ["shared"]
  shared:
    cmd: "srv"
"#,
    );
    // "shared" is both a model id and an alias of "real"; validation rejects it
    assert!(config.is_err());

    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.resolve_model("llama"), Some("llama"));
    assert_eq!(config.resolve_model("gpt-4o-mini"), Some("llama"));
    assert_eq!(config.resolve_model("LLAMA"), None);
    assert_eq!(config.resolve_model("nope"), None);
}

#[test]
fn load_reads_file() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.models.len(), 2);
}

#[test]
fn substitute_macros_replaces_known_vars() {
    let mut vars = HashMap::new();
    vars.insert("PORT", "5801".to_string());
    vars.insert("MODEL_ID", "llama".to_string());
    let out = substitute_macros("srv --port ${PORT} --name ${MODEL_ID}", &vars);
    assert_eq!(out, "srv --port 5801 --name llama");
}

#[test]
fn substitute_macros_falls_back_to_env() {
    std::env::set_var("LLMSNAP_TEST_MACRO", "from-env");
    let out = substitute_macros("x=${LLMSNAP_TEST_MACRO}", &HashMap::new());
    assert_eq!(out, "x=from-env");
}

#[test]
fn substitute_macros_leaves_unknown_untouched() {
    let out = substitute_macros("x=${NO_SUCH_MACRO_HERE_42}", &HashMap::new());
    assert_eq!(out, "x=${NO_SUCH_MACRO_HERE_42}");
}

#[test]
fn split_command_strips_comments_and_continuations() {
    let argv = split_command("# note\nllama-server --port 1 \\\n  -m model.gguf\n");
    assert_eq!(argv, vec!["llama-server", "--port", "1", "-m", "model.gguf"]);
}

#[test]
fn split_command_handles_single_line() {
    assert_eq!(split_command("a b  c"), vec!["a", "b", "c"]);
    assert!(split_command("").is_empty());
    assert!(split_command("# only a comment").is_empty());
}

#[test]
fn proxy_template_defaults_to_localhost_port_macro() {
    let config = Config::from_yaml("models:\n  a:\n    cmd: srv\n").unwrap();
    assert_eq!(config.models["a"].proxy_template(), "http://localhost:${PORT}");
}
