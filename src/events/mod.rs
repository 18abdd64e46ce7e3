//! Lifecycle event envelope and subscription filters.
//!
//! Every state change produces one [`Envelope`]. The store writes the
//! envelope to the `events` audit table inside the same transaction as the
//! causing mutation; the bus assigns the per-process sequence and fans the
//! envelope out to sinks *after* that transaction commits. An event is
//! therefore never published for a mutation that did not commit, and never
//! lost between commit and publish (the audit row survives a crash).

pub mod bus;
pub mod hooks;
pub mod webhooks;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use bus::{EventBus, Subscription};

// ── Event types ──────────────────────────────────────────────────────────────

pub const TASK_CREATED: &str = "task.created";
pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_DELETED: &str = "task.deleted";
pub const TASK_STATUS_CHANGED: &str = "task.status_changed";
pub const TASK_QUEUED: &str = "task.queued";
pub const TASK_STARTED: &str = "task.started";
pub const TASK_PROCESSING: &str = "task.processing";
pub const TASK_BLOCKED: &str = "task.blocked";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_RETRIED: &str = "task.retried";
pub const TASK_INTERRUPTED: &str = "task.interrupted";
pub const TASK_SUSPENDED: &str = "task.suspended";
pub const TASK_PINNED: &str = "task.pinned";
pub const TASK_UNPINNED: &str = "task.unpinned";
pub const WORKTREE_READY: &str = "worktree.ready";
pub const WORKTREE_FAILED: &str = "worktree.failed";
pub const WORKTREE_INIT_FAILED: &str = "worktree.init_failed";
pub const AGENT_ITEM_STARTED: &str = "agent.item.started";
pub const AGENT_ITEM_DELTA: &str = "agent.item.delta";
pub const AGENT_ITEM_COMPLETED: &str = "agent.item.completed";
pub const AGENT_UNPARSED: &str = "agent.unparsed";

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The wire shape of one lifecycle event.
///
/// `sequence` is 0 until the bus publishes the envelope; delivered copies
/// carry a strictly increasing per-process sequence. Across restarts the
/// sequence resets — `timestamp` is the stable cross-restart ordering key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: Option<i64>,
    pub message: String,
    pub metadata: Value,
    /// RFC3339 with nanosecond precision.
    pub timestamp: String,
    #[serde(default)]
    pub sequence: u64,
}

impl Envelope {
    pub fn new(
        event_type: &str,
        task_id: Option<i64>,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            task_id,
            message: message.into(),
            metadata,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            sequence: 0,
        }
    }

    /// Project name carried in the metadata blob, when the publisher knew it.
    pub fn project(&self) -> Option<&str> {
        self.metadata.get("project").and_then(|v| v.as_str())
    }
}

// ── Filter ───────────────────────────────────────────────────────────────────

/// Subscriber-side filter. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Vec<String>,
    pub task_id: Option<i64>,
    pub project: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, env: &Envelope) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| t == &env.event_type) {
            return false;
        }
        if let Some(id) = self.task_id {
            if env.task_id != Some(id) {
                return false;
            }
        }
        if let Some(ref project) = self.project {
            if env.project() != Some(project.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serialises_with_type_key() {
        let env = Envelope::new(TASK_QUEUED, Some(7), "queued", json!({}));
        let v: Value = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(v["type"], "task.queued");
        assert_eq!(v["task_id"], 7);
        assert!(v["event_id"].as_str().is_some());
    }

    #[test]
    fn filter_by_type_and_task() {
        let env = Envelope::new(TASK_COMPLETED, Some(3), "done", json!({"project": "personal"}));

        assert!(EventFilter::default().matches(&env));
        assert!(EventFilter {
            types: vec![TASK_COMPLETED.into()],
            ..Default::default()
        }
        .matches(&env));
        assert!(!EventFilter {
            types: vec![TASK_QUEUED.into()],
            ..Default::default()
        }
        .matches(&env));
        assert!(!EventFilter {
            task_id: Some(4),
            ..Default::default()
        }
        .matches(&env));
        assert!(EventFilter {
            project: Some("personal".into()),
            ..Default::default()
        }
        .matches(&env));
        assert!(!EventFilter {
            project: Some("work".into()),
            ..Default::default()
        }
        .matches(&env));
    }
}
