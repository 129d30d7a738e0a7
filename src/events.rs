// Events that fan out from the lifecycle core to SSE subscribers
//
// State changes, recorded metrics, and log lines all flow through one
// broadcast channel. Using an enum allows pattern matching and ensures
// type-safe communication between async tasks; slow subscribers lag and
// drop rather than back-pressuring the proxy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::metrics::TokenMetrics;
use crate::process::ProcessState;

/// Main event type that flows through the application
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")] // Creates JSON like {"type": "ProcessStateChanged", ...}
pub enum ProxyEvent {
    /// A managed process moved between lifecycle states
    ProcessStateChanged {
        timestamp: DateTime<Utc>,
        model: String,
        old_state: ProcessState,
        new_state: ProcessState,
    },

    /// A token metric was recorded for a completed upstream response
    MetricRecorded {
        timestamp: DateTime<Utc>,
        metric: TokenMetrics,
    },

    /// A log line was captured from the tracing pipeline
    LogLine {
        timestamp: DateTime<Utc>,
        level: String,
        target: String,
        message: String,
    },
}

impl ProxyEvent {
    /// Event name used for the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            ProxyEvent::ProcessStateChanged { .. } => "processStateChanged",
            ProxyEvent::MetricRecorded { .. } => "metricRecorded",
            ProxyEvent::LogLine { .. } => "logLine",
        }
    }
}

/// Capacity of the broadcast channel; laggy subscribers lose oldest events
const EVENT_BUS_CAPACITY: usize = 256;

/// Fan-out bus for state-change and metrics events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. No subscribers is not an error.
    pub fn publish(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    /// Emit a state-change event
    pub fn state_changed(&self, model: &str, old_state: ProcessState, new_state: ProcessState) {
        self.publish(ProxyEvent::ProcessStateChanged {
            timestamp: Utc::now(),
            model: model.to_string(),
            old_state,
            new_state,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (used by tests)
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.state_changed("llama", ProcessState::Stopped, ProcessState::Starting);
        match rx.recv().await.unwrap() {
            ProxyEvent::ProcessStateChanged {
                model,
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(model, "llama");
                assert_eq!(old_state, ProcessState::Stopped);
                assert_eq!(new_state, ProcessState::Starting);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.state_changed("llama", ProcessState::Ready, ProcessState::Stopping);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ProxyEvent::ProcessStateChanged {
            timestamp: Utc::now(),
            model: "m".into(),
            old_state: ProcessState::Stopped,
            new_state: ProcessState::Starting,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ProcessStateChanged");
        assert_eq!(json["new_state"], "starting");
        assert_eq!(event.event_type(), "processStateChanged");
    }
}
