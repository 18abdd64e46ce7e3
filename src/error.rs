//! Error taxonomy surfaced by the store and the control surface.
//!
//! Everything recoverable is recovered locally inside the component that
//! raised it; the executor escalates only by transitioning the task to
//! `blocked` with a human-readable reason. The daemon never aborts on a
//! per-task error.

use crate::store::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum TaskdError {
    /// Referenced id or name does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation — worktree path, port, or branch already held.
    /// The attempted operation is aborted; state is left unchanged.
    #[error("conflict: {0}")]
    Conflict(String),

    /// State-machine rejection. Caller fault.
    #[error("invalid transition: {from} → {to}")]
    InvalidTransition { from: Status, to: Status },

    /// The agent CLI named by `task.executor` is not installed or not
    /// executable. The task is blocked with a remediation log; no retries.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Unparsable output from the agent CLI. The task continues; the
    /// terminal signal is derived from the process exit code.
    #[error("adapter protocol error: {0}")]
    AdapterProtocol(String),

    /// The VCS tool failed while provisioning a worktree.
    #[error("worktree failure: {0}")]
    WorktreeFailure(String),

    /// Init script failed or timed out. Non-fatal — surfaced as an event.
    #[error("init script failure: {0}")]
    InitScriptFailure(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TaskdError>;

impl TaskdError {
    /// Transient errors are retried with jittered backoff by the store;
    /// everything else surfaces to the caller on first occurrence.
    pub fn is_transient(&self) -> bool {
        match self {
            TaskdError::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY / SQLITE_LOCKED surface as database errors
                // with these codes when WAL writers contend.
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            TaskdError::Database(sqlx::Error::PoolTimedOut) => true,
            TaskdError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
