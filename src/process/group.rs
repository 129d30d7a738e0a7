// ProcessGroup - a policy-bearing cluster of processes
//
// Routes a request to the owning member and enforces the swap rule: in a
// swap group only one member may be active, so activating one first idles
// its siblings (sleep when configured, stop otherwise). The exclusive and
// persistent flags are exported to the outer scheduler, which handles
// displacement across groups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{request, Response};
use bytes::Bytes;

use crate::process::{Process, ProcessError, StopMode};

pub struct ProcessGroup {
    id: String,
    swap: bool,
    exclusive: bool,
    persistent: bool,
    /// Members in configuration order
    members: Vec<Arc<Process>>,
    by_id: HashMap<String, Arc<Process>>,
    /// Most recently activated member
    last_used: Mutex<Option<String>>,
    /// Serializes swap-group activation so two members cannot displace
    /// each other concurrently
    activation: tokio::sync::Mutex<()>,
}

impl ProcessGroup {
    pub fn new(
        id: &str,
        swap: bool,
        exclusive: bool,
        persistent: bool,
        members: Vec<Arc<Process>>,
    ) -> Arc<Self> {
        let by_id = members
            .iter()
            .map(|p| (p.model_id().to_string(), Arc::clone(p)))
            .collect();
        Arc::new(Self {
            id: id.to_string(),
            swap,
            exclusive,
            persistent,
            members,
            by_id,
            last_used: Mutex::new(None),
            activation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn swap(&self) -> bool {
        self.swap
    }

    pub fn has_member(&self, model_id: &str) -> bool {
        self.by_id.contains_key(model_id)
    }

    pub fn member(&self, model_id: &str) -> Option<Arc<Process>> {
        self.by_id.get(model_id).cloned()
    }

    pub fn members(&self) -> &[Arc<Process>] {
        &self.members
    }

    pub fn last_used(&self) -> Option<String> {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make the named member Ready, displacing siblings first in a swap
    /// group. Returns the member for the caller to proxy through.
    pub async fn activate(&self, model_id: &str) -> Result<Arc<Process>, ProcessError> {
        let target = self
            .member(model_id)
            .ok_or_else(|| ProcessError::UnknownModel {
                model: model_id.to_string(),
            })?;

        // Fast path: in a swap group a Ready member means its siblings are
        // already idle; in a non-swap group members never displace each
        // other at all.
        if target.current_state() == crate::process::ProcessState::Ready {
            self.touch(model_id);
            return Ok(target);
        }

        if self.swap {
            let _guard = self.activation.lock().await;
            for sibling in &self.members {
                if sibling.model_id() != model_id {
                    sibling.make_idle().await;
                }
            }
            target.ensure_ready().await?;
        } else {
            target.ensure_ready().await?;
        }

        self.touch(model_id);
        Ok(target)
    }

    fn touch(&self, model_id: &str) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Some(model_id.to_string());
    }

    /// Route one request through the owning member
    pub async fn proxy_request(
        &self,
        model_id: &str,
        parts: request::Parts,
        body: Bytes,
    ) -> Result<Response<Body>, ProcessError> {
        let target = self.activate(model_id).await?;
        target.proxy_request(parts, body).await
    }

    /// Stop every member
    pub async fn stop_processes(&self, mode: StopMode) {
        futures::future::join_all(self.members.iter().map(|p| p.stop(mode))).await;
    }

    /// Idle every member: sleep where configured, stop otherwise. Used by
    /// the outer scheduler when another exclusive group activates.
    pub async fn make_idle_processes(&self) {
        futures::future::join_all(self.members.iter().map(|p| p.make_idle())).await;
    }

    /// Terminal shutdown of every member
    pub async fn shutdown(&self) {
        futures::future::join_all(self.members.iter().map(|p| p.shutdown())).await;
    }

    /// Whether any member is currently non-idle
    pub fn has_active_member(&self) -> bool {
        self.members.iter().any(|p| p.status().is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::metrics::MetricsMonitor;

    fn test_process(id: &str) -> Arc<Process> {
        let config = Config::from_yaml(&format!(
            "models:\n  {id}:\n    cmd: \"sleep 30\"\n"
        ))
        .unwrap();
        let model = config.models[id].clone();
        let bus = EventBus::new();
        let metrics = Arc::new(MetricsMonitor::new(10, bus.clone()));
        Process::new(id, model, &config, 5800, bus, metrics)
    }

    #[test]
    fn membership_lookup() {
        let group = ProcessGroup::new(
            "g1",
            true,
            true,
            false,
            vec![test_process("a"), test_process("b")],
        );
        assert!(group.has_member("a"));
        assert!(group.has_member("b"));
        assert!(!group.has_member("c"));
        assert_eq!(group.member("a").unwrap().model_id(), "a");
        assert!(group.member("c").is_none());
    }

    #[test]
    fn flags_are_exported() {
        let group = ProcessGroup::new("g1", false, true, true, vec![]);
        assert!(!group.swap());
        assert!(group.exclusive());
        assert!(group.persistent());
        assert!(!group.has_active_member());
    }
}
