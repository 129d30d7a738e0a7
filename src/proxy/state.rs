//! Proxy state and the cross-group scheduler
//!
//! Built once at startup from the configuration: every model becomes a
//! Process with its own port, every configured group becomes a
//! ProcessGroup, and models left out of all groups are gathered into an
//! implicit default group with swap semantics. The scheduler mutex guards
//! only the displacement decision; idling and upstream I/O run outside it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{request, Response};
use bytes::Bytes;

use crate::config::Config;
use crate::events::EventBus;
use crate::logging::LogBuffer;
use crate::metrics::MetricsMonitor;
use crate::process::{Process, ProcessError, ProcessGroup, ProcessStatus, StopMode};

/// Group ID used for models not named in any configured group
const DEFAULT_GROUP: &str = "(default)";

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Config>,
    /// All groups, configuration order first, implicit default group last
    groups: Vec<Arc<ProcessGroup>>,
    /// Canonical model ID -> owning group
    group_by_model: HashMap<String, Arc<ProcessGroup>>,
    /// Serializes cross-group displacement decisions
    scheduler: Arc<tokio::sync::Mutex<()>>,
    pub metrics: Arc<MetricsMonitor>,
    pub events: EventBus,
    pub logs: LogBuffer,
}

impl ProxyState {
    pub fn new(config: Config, events: EventBus, logs: LogBuffer) -> Self {
        let metrics = Arc::new(MetricsMonitor::new(
            config.metrics_max_in_memory,
            events.clone(),
        ));

        // Ports are handed out sequentially and never reused
        let mut next_port = config.start_port;
        let mut processes: HashMap<String, Arc<Process>> = HashMap::new();
        for (id, model) in &config.models {
            let process = Process::new(
                id,
                model.clone(),
                &config,
                next_port,
                events.clone(),
                Arc::clone(&metrics),
            );
            next_port = next_port.wrapping_add(1);
            processes.insert(id.clone(), process);
        }

        let mut groups = Vec::new();
        let mut group_by_model = HashMap::new();
        let mut grouped: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for (gid, group_config) in &config.groups {
            let members: Vec<Arc<Process>> = group_config
                .members
                .iter()
                .filter_map(|m| processes.get(m).cloned())
                .collect();
            for member in &group_config.members {
                grouped.insert(member.as_str());
            }
            let group = ProcessGroup::new(
                gid,
                group_config.swap,
                group_config.exclusive,
                group_config.persistent,
                members,
            );
            for member in &group_config.members {
                group_by_model.insert(member.clone(), Arc::clone(&group));
            }
            groups.push(group);
        }

        // Ungrouped models share the implicit default group
        let ungrouped: Vec<Arc<Process>> = config
            .models
            .keys()
            .filter(|id| !grouped.contains(id.as_str()))
            .filter_map(|id| processes.get(id).cloned())
            .collect();
        if !ungrouped.is_empty() {
            let group = ProcessGroup::new(DEFAULT_GROUP, true, true, false, ungrouped);
            for process in group.members() {
                group_by_model.insert(process.model_id().to_string(), Arc::clone(&group));
            }
            groups.push(group);
        }

        Self {
            config: Arc::new(config),
            groups,
            group_by_model,
            scheduler: Arc::new(tokio::sync::Mutex::new(())),
            metrics,
            events,
            logs,
        }
    }

    /// Resolve a requested model name (ID or alias) to its canonical ID
    /// and owning group
    pub fn resolve(&self, requested: &str) -> Option<(String, Arc<ProcessGroup>)> {
        let canonical = self.config.resolve_model(requested)?.to_string();
        let group = self.group_by_model.get(&canonical)?.clone();
        Some((canonical, group))
    }

    pub fn groups(&self) -> &[Arc<ProcessGroup>] {
        &self.groups
    }

    pub fn process(&self, canonical: &str) -> Option<Arc<Process>> {
        self.group_by_model
            .get(canonical)
            .and_then(|g| g.member(canonical))
    }

    /// Status of every managed process, configuration order
    pub fn statuses(&self) -> Vec<ProcessStatus> {
        self.groups
            .iter()
            .flat_map(|g| g.members().iter().map(|p| p.status()))
            .collect()
    }

    /// Route one request: decide displacement under the scheduler lock,
    /// idle conflicting groups, then activate and proxy outside it.
    pub async fn dispatch(
        &self,
        canonical: &str,
        parts: request::Parts,
        body: Bytes,
    ) -> Result<Response<Body>, ProcessError> {
        let group = self
            .group_by_model
            .get(canonical)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownModel {
                model: canonical.to_string(),
            })?;

        // Decision under the lock; the displaced groups' actual idling and
        // the target's start/wake run after it is released so parallel
        // requests to already-activated groups are not serialized.
        let to_idle: Vec<Arc<ProcessGroup>> = {
            let _lock = self.scheduler.lock().await;
            if group.exclusive() {
                self.groups
                    .iter()
                    .filter(|other| {
                        other.id() != group.id()
                            && !other.persistent()
                            && other.has_active_member()
                    })
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            }
        };

        for other in &to_idle {
            tracing::info!(
                "idling group {} to make room for {} (group {})",
                other.id(),
                canonical,
                group.id()
            );
            other.make_idle_processes().await;
        }

        group.proxy_request(canonical, parts, body).await
    }

    /// Stop every process in every group
    pub async fn stop_all(&self, mode: StopMode) {
        futures::future::join_all(self.groups.iter().map(|g| g.stop_processes(mode))).await;
    }

    /// Terminal shutdown of everything
    pub async fn shutdown(&self) {
        futures::future::join_all(self.groups.iter().map(|g| g.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_from(yaml: &str) -> ProxyState {
        let config = Config::from_yaml(yaml).unwrap();
        ProxyState::new(config, EventBus::new(), LogBuffer::new())
    }

    #[test]
    fn ungrouped_models_land_in_default_group() {
        let state = state_from(
            r#"
models:
  a:
    cmd: srv
  b:
    cmd: srv
"#,
        );
        assert_eq!(state.groups().len(), 1);
        let group = &state.groups()[0];
        assert_eq!(group.id(), DEFAULT_GROUP);
        assert!(group.swap());
        assert!(group.exclusive());
        assert!(!group.persistent());
        assert!(group.has_member("a"));
        assert!(group.has_member("b"));
    }

    #[test]
    fn configured_groups_keep_their_members() {
        let state = state_from(
            r#"
models:
  a:
    cmd: srv
  b:
    cmd: srv
  c:
    cmd: srv
groups:
  g1:
    persistent: true
    members: [a, b]
"#,
        );
        assert_eq!(state.groups().len(), 2);
        let (canonical, group) = state.resolve("a").unwrap();
        assert_eq!(canonical, "a");
        assert_eq!(group.id(), "g1");
        assert!(group.persistent());

        let (_, group) = state.resolve("c").unwrap();
        assert_eq!(group.id(), DEFAULT_GROUP);
    }

    #[test]
    fn resolve_follows_aliases() {
        let state = state_from(
            r#"
models:
  a:
    cmd: srv
    aliases: ["alias-a"]
"#,
        );
        let (canonical, _) = state.resolve("alias-a").unwrap();
        assert_eq!(canonical, "a");
        assert!(state.resolve("missing").is_none());
    }

    #[test]
    fn ports_are_assigned_sequentially() {
        let state = state_from(
            r#"
startPort: 6100
models:
  a:
    cmd: srv
  b:
    cmd: srv
"#,
        );
        let a = state.process("a").unwrap();
        let b = state.process("b").unwrap();
        let mut ports = vec![a.port(), b.port()];
        ports.sort_unstable();
        assert_eq!(ports, vec![6100, 6101]);
        assert_eq!(a.upstream_url(), format!("http://localhost:{}", a.port()));
    }

    #[test]
    fn statuses_cover_all_models() {
        let state = state_from(
            r#"
models:
  a:
    cmd: srv
  b:
    cmd: srv
"#,
        );
        let statuses = state.statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !s.is_active()));
    }
}
