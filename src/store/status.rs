//! Task lifecycle state machine.
//!
//! `check_transition` is the single validator for every status change; the
//! store calls it inside the same transaction that performs the UPDATE, so
//! the validator and the storage can never disagree.
//!
//! ```text
//! backlog  ── queue ──▶ queued
//! queued   ── dequeue ──▶ processing
//! processing ── complete ──▶ done
//! processing ── block / fail / interrupt ──▶ blocked
//! blocked  ── input / retry ──▶ processing | queued
//! done     ── reopen ──▶ queued
//! backlog | queued | blocked | done ── archive ──▶ archived
//! ```
//!
//! `processing → processing` (idempotent re-entry) is explicitly forbidden,
//! as is archiving a task with a live process — callers interrupt first.

use serde::{Deserialize, Serialize};

use crate::error::TaskdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Backlog,
    Queued,
    Processing,
    Blocked,
    Done,
    Archived,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Backlog => "backlog",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Blocked => "blocked",
            Status::Done => "done",
            Status::Archived => "archived",
        }
    }

    /// Terminal states release the task's port and worktree row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Archived)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = TaskdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Status::Backlog),
            "queued" => Ok(Status::Queued),
            "processing" => Ok(Status::Processing),
            "blocked" => Ok(Status::Blocked),
            "done" => Ok(Status::Done),
            "archived" => Ok(Status::Archived),
            other => Err(TaskdError::NotFound(format!("unknown status: {other}"))),
        }
    }
}

/// Total transition function: `true` iff `from → to` is a legal edge.
///
/// Self-loops are never legal — a repeated `update_status` with the same
/// status must surface `InvalidTransition` to the caller.
pub fn transition_allowed(from: Status, to: Status) -> bool {
    use Status::*;
    match (from, to) {
        (Backlog, Queued) => true,
        (Queued, Processing) => true,
        (Processing, Done) => true,
        (Processing, Blocked) => true,
        // Re-entry after input injection keeps the same session id.
        (Blocked, Processing) => true,
        (Blocked, Queued) => true,
        (Done, Queued) => true,
        // Archiving a live process would orphan it; interrupt first.
        (Backlog | Queued | Blocked | Done, Archived) => true,
        _ => false,
    }
}

pub fn check_transition(from: Status, to: Status) -> Result<(), TaskdError> {
    if transition_allowed(from, to) {
        Ok(())
    } else {
        Err(TaskdError::InvalidTransition { from, to })
    }
}

/// Event type published when a task *enters* `to`.
///
/// `interrupted`, `failed`, and `retried` carry more context than the bare
/// transition; the executor publishes those variants directly and this
/// default is used everywhere else.
pub fn event_type_for(to: Status) -> &'static str {
    match to {
        Status::Backlog => "task.status_changed",
        Status::Queued => "task.queued",
        Status::Processing => "task.started",
        Status::Blocked => "task.blocked",
        Status::Done => "task.completed",
        Status::Archived => "task.status_changed",
    }
}

pub const ALL_STATUSES: [Status; 6] = [
    Status::Backlog,
    Status::Queued,
    Status::Processing,
    Status::Blocked,
    Status::Done,
    Status::Archived,
];
