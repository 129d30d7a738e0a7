//! Configuration for the proxy server
//!
//! Configuration is loaded from a YAML file given on the command line.
//! Every key the lifecycle core relies on lives here: global timeouts and
//! port assignment, per-model process definitions, and per-group scheduling
//! policy. An invalid configuration is a startup error (non-zero exit);
//! an unknown model at request time is a client error.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod model;

#[cfg(test)]
mod tests;

pub use model::{split_command, substitute_macros, EndpointConfig, FilterConfig, SleepMode};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lower bound for `healthCheckTimeout`; anything shorter races slow model loads
pub const MIN_HEALTH_CHECK_TIMEOUT: u64 = 15;

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_health_check_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    10
}

fn default_start_port() -> u16 {
    5800
}

fn default_metrics_max() -> usize {
    1000
}

fn default_max_capture_bytes() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Address to bind the proxy server to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Seconds a Starting/Waking process has to pass its health check
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// Default overall timeout for each sleep endpoint request (seconds)
    #[serde(default = "default_request_timeout")]
    pub sleep_request_timeout: u64,

    /// Default overall timeout for each wake endpoint request (seconds)
    #[serde(default = "default_request_timeout")]
    pub wake_request_timeout: u64,

    /// Base for sequentially assigned `${PORT}` values
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Capacity of the in-memory token metrics ring
    #[serde(default = "default_metrics_max")]
    pub metrics_max_in_memory: usize,

    /// Cap on response bytes tee'd aside for metrics parsing and captures
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,

    /// Accepted API keys; empty list disables authentication
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Log level when RUST_LOG is not set: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Managed backend processes, keyed by model ID
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,

    /// Scheduling groups, keyed by group ID
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            health_check_timeout: default_health_check_timeout(),
            sleep_request_timeout: default_request_timeout(),
            wake_request_timeout: default_request_timeout(),
            start_port: default_start_port(),
            metrics_max_in_memory: default_metrics_max(),
            max_capture_bytes: default_max_capture_bytes(),
            api_keys: Vec::new(),
            log_level: default_log_level(),
            models: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }
}

/// One managed backend process
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelConfig {
    /// Start command; `${PORT}`, `${MODEL_ID}` and environment references
    /// are interpolated before spawning. Lines starting with `#` are ignored.
    pub cmd: String,

    /// Optional stop command with `${PID}`; replaces the SIGTERM step
    #[serde(default)]
    pub cmd_stop: String,

    /// Upstream base URL; defaults to `http://localhost:${PORT}`
    #[serde(default)]
    pub proxy: String,

    /// Health check path on the upstream
    #[serde(default = "ModelConfig::default_check_endpoint")]
    pub check_endpoint: String,

    /// Idle seconds before the process is stopped; 0 disables
    #[serde(default)]
    pub ttl: u64,

    /// Max concurrent in-flight requests; 0 = unlimited
    #[serde(default)]
    pub concurrency_limit: usize,

    /// Extra environment entries, `NAME=value`
    #[serde(default)]
    pub env: Vec<String>,

    /// Alternate model names resolving to this process
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Rewrite the request's `model` field to this value before forwarding
    #[serde(default)]
    pub use_model_name: String,

    /// Request body filters applied before forwarding
    #[serde(default)]
    pub filters: FilterConfig,

    /// Whether the backend supports the sleep/wake endpoints
    #[serde(default)]
    pub sleep_mode: SleepMode,

    /// Ordered HTTP calls that put the backend to sleep
    #[serde(default)]
    pub sleep_endpoints: Vec<EndpointConfig>,

    /// Ordered HTTP calls that wake the backend
    #[serde(default)]
    pub wake_endpoints: Vec<EndpointConfig>,
}

impl ModelConfig {
    fn default_check_endpoint() -> String {
        "/health".to_string()
    }

    /// Effective upstream base URL template (before macro interpolation)
    pub fn proxy_template(&self) -> &str {
        if self.proxy.is_empty() {
            "http://localhost:${PORT}"
        } else {
            &self.proxy
        }
    }

    /// Whether sleep is usable: mode enabled and at least one endpoint
    pub fn sleep_configured(&self) -> bool {
        self.sleep_mode == SleepMode::Enable && !self.sleep_endpoints.is_empty()
    }
}

/// Scheduling policy for a set of models
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupConfig {
    /// Only one member may be active at a time
    #[serde(default = "default_true")]
    pub swap: bool,

    /// Activating this group idles other non-persistent groups
    #[serde(default = "default_true")]
    pub exclusive: bool,

    /// Immune to being idled by other groups' exclusivity
    #[serde(default)]
    pub persistent: bool,

    /// Member model IDs, in configuration order
    #[serde(default)]
    pub members: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            swap: true,
            exclusive: true,
            persistent: false,
            members: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading and validation
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Load a configuration file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a YAML string (tests and `config --check`)
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<SocketAddr>().is_err() {
            bail!("listen address {:?} is not a valid host:port", self.listen);
        }
        if self.health_check_timeout < MIN_HEALTH_CHECK_TIMEOUT {
            bail!(
                "healthCheckTimeout must be at least {} seconds, got {}",
                MIN_HEALTH_CHECK_TIMEOUT,
                self.health_check_timeout
            );
        }
        if self.start_port == 0 {
            bail!("startPort must be non-zero");
        }

        // Model IDs and aliases share one namespace and must be unique
        let mut names = std::collections::HashSet::new();
        for (id, model) in &self.models {
            if model.cmd.trim().is_empty() {
                bail!("model {:?}: cmd must not be empty", id);
            }
            if !model.check_endpoint.starts_with('/') {
                bail!(
                    "model {:?}: checkEndpoint {:?} must start with '/'",
                    id,
                    model.check_endpoint
                );
            }
            if !names.insert(id.as_str()) {
                bail!("duplicate model id {:?}", id);
            }
            for alias in &model.aliases {
                if !names.insert(alias.as_str()) {
                    bail!(
                        "alias {:?} of model {:?} collides with another name",
                        alias,
                        id
                    );
                }
            }
            for entry in &model.env {
                if !entry.contains('=') {
                    bail!("model {:?}: env entry {:?} is not NAME=value", id, entry);
                }
            }
        }

        // Group members must exist, and a model belongs to at most one group
        let mut grouped = std::collections::HashSet::new();
        for (gid, group) in &self.groups {
            for member in &group.members {
                if !self.models.contains_key(member) {
                    bail!("group {:?}: unknown member {:?}", gid, member);
                }
                if !grouped.insert(member.as_str()) {
                    bail!("model {:?} appears in more than one group", member);
                }
            }
        }

        Ok(())
    }

    /// Resolve a requested model name to its canonical ID.
    ///
    /// Canonical IDs match first, then aliases. Matching is case-sensitive
    /// and exact.
    pub fn resolve_model<'a>(&'a self, requested: &str) -> Option<&'a str> {
        if let Some((id, _)) = self.models.get_key_value(requested) {
            return Some(id.as_str());
        }
        for (id, model) in &self.models {
            if model.aliases.iter().any(|a| a == requested) {
                return Some(id.as_str());
            }
        }
        None
    }
}
