//! Fire-and-forget event bus for live observers (GUI, notifications).
//!
//! Delivery is best-effort: publishing never blocks and never errors, and
//! lagging subscribers drop events. State of record lives in the store.

use chrono::{DateTime, Utc};
use coffer_protocol::{AgentId, JobId};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one event. Errors (no subscribers) are ignored.
    pub fn publish(&self, topic: String, kind: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Event {
            topic,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

pub fn agent_topic(id: AgentId) -> String {
    format!("agent:{}", id)
}

pub fn job_topic(id: JobId) -> String {
    format!("job:{}", id)
}
