//! Per-model configuration pieces: filters, sleep/wake endpoints, and the
//! macro substitution applied to commands and upstream URLs.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Whether a backend supports the sleep/wake endpoint protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepMode {
    Enable,
    #[default]
    Disable,
}

/// One HTTP call in a sleep or wake sequence
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EndpointConfig {
    /// Path on the upstream, e.g. `/sleep`
    pub path: String,

    /// HTTP method; defaults to POST
    #[serde(default = "EndpointConfig::default_method")]
    pub method: String,

    /// Optional request body sent verbatim
    #[serde(default)]
    pub body: Option<String>,

    /// Overall request timeout in seconds; falls back to the Process default
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl EndpointConfig {
    fn default_method() -> String {
        "POST".to_string()
    }
}

/// Request body filters applied before forwarding
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterConfig {
    /// Top-level JSON keys removed from the request body.
    /// The `model` key is protected and never stripped.
    #[serde(default)]
    pub strip_params: Vec<String>,

    /// Top-level JSON keys overridden in the request body
    #[serde(default)]
    pub set_params: HashMap<String, serde_json::Value>,
}

static MACRO_RE: OnceLock<Regex> = OnceLock::new();

/// Replace `${NAME}` references in a configured string.
///
/// Names found in `vars` win; anything else falls back to the process
/// environment; unknown names are left untouched so typos surface in logs
/// rather than vanishing silently.
pub fn substitute_macros(input: &str, vars: &HashMap<&str, String>) -> String {
    let re = MACRO_RE
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
    re.replace_all(input, |caps: &regex::Captures| {
        let name = &caps[1];
        if let Some(value) = vars.get(name) {
            value.clone()
        } else if let Ok(value) = std::env::var(name) {
            value
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// Split a configured command string into argv.
///
/// Lines whose first non-space character is `#` are dropped, trailing `\`
/// continuations are joined, then the result splits on whitespace. Shell
/// quoting is not interpreted.
pub fn split_command(cmd: &str) -> Vec<String> {
    let mut joined = String::new();
    for line in cmd.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let line = line.strip_suffix('\\').unwrap_or(line);
        joined.push_str(line);
        joined.push(' ');
    }
    joined.split_whitespace().map(str::to_string).collect()
}
