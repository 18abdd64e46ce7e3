//! Control surface — the local invocation API collaborators wrap.
//!
//! Transport-agnostic by design: the TUI, SSH front-end, and web layer all
//! call these methods directly (or over their own wire protocol). Every
//! mutation goes through the store, which writes the audit event in the
//! same transaction; this layer publishes the returned envelope to the bus
//! after the commit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::agent::AgentAdapter;
use crate::error::{Result, TaskdError};
use crate::events::hooks::HookContext;
use crate::events::{EventBus, EventFilter, Subscription};
use crate::executor::Executor;
use crate::store::{
    LogLine, NewTask, Status, Store, Task, TaskFilter, TaskPatch,
};

const TAIL_POLL: Duration = Duration::from_millis(500);
const TAIL_BUFFER: usize = 256;

#[derive(Clone)]
pub struct ControlSurface {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    executor: Arc<Executor>,
}

/// A live per-task log tail. Receives every `TaskLog` row with id ≥ the
/// requested anchor, in insertion order. The poller stops when this handle
/// is dropped.
pub struct LogTail {
    pub rx: mpsc::Receiver<LogLine>,
    poller: tokio::task::JoinHandle<()>,
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

impl ControlSurface {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, executor: Arc<Executor>) -> Self {
        Self {
            store,
            bus,
            executor,
        }
    }

    async fn publish(&self, change: crate::store::StatusChange) -> Task {
        self.bus
            .publish(
                change.event,
                Some(HookContext::from(&change.task)),
            )
            .await;
        change.task
    }

    // ─── Task lifecycle ──────────────────────────────────────────────────────

    /// Create a task in `backlog`, or queue it immediately when
    /// `execute` is set.
    pub async fn create_task(&self, new: NewTask, execute: bool) -> Result<Task> {
        let change = self.store.create_task(new).await?;
        let task = self.publish(change).await;
        if execute {
            return self.queue(task.id).await;
        }
        Ok(task)
    }

    pub async fn get_task(&self, id: i64) -> Result<Task> {
        self.store.get_task(id).await
    }

    /// Field updates only — the status column is out of reach by type.
    pub async fn update_task(&self, id: i64, patch: TaskPatch) -> Result<Task> {
        let change = self.store.update_fields(id, patch).await?;
        Ok(self.publish(change).await)
    }

    /// Delete a non-processing task; logs and attachments cascade, the
    /// port and worktree rows are released with the row.
    pub async fn delete_task(&self, id: i64) -> Result<()> {
        let env = self.store.delete_task(id).await?;
        self.bus.publish(env, None).await;
        Ok(())
    }

    /// Explicit transition; the store rejects anything the state machine
    /// does not allow.
    pub async fn set_status(&self, id: i64, status: Status) -> Result<Task> {
        let change = self.store.update_status(id, status).await?;
        Ok(self.publish(change).await)
    }

    /// Move a task into the queue (from backlog, blocked, or done).
    pub async fn queue(&self, id: i64) -> Result<Task> {
        self.set_status(id, Status::Queued).await
    }

    /// Requeue a blocked or done task, optionally saving feedback for the
    /// next agent run. A `processing` task is rejected — interrupt first.
    pub async fn retry(&self, id: i64, feedback: Option<&str>) -> Result<Task> {
        let task = self.store.get_task(id).await?;
        match task.status() {
            Status::Blocked | Status::Done => {}
            other => {
                return Err(TaskdError::InvalidTransition {
                    from: other,
                    to: Status::Queued,
                })
            }
        }
        if let Some(feedback) = feedback {
            self.store.set_feedback(id, feedback).await?;
        }
        let change = self
            .store
            .update_status_with(id, Status::Queued, Some(crate::events::TASK_RETRIED), None)
            .await?;
        Ok(self.publish(change).await)
    }

    /// Kill the running agent and block the task with reason
    /// `interrupted`.
    pub async fn interrupt(&self, id: i64) -> Result<Task> {
        self.executor.interrupt(id).await
    }

    /// Answer a blocked task. Requires a re-entrant adapter; equivalent to
    /// `retry(feedback = text)` so the worker pool resumes the same agent
    /// session. Also wakes an idle-suspended agent mid-run.
    pub async fn send_input(&self, id: i64, text: &str) -> Result<Task> {
        let task = self.store.get_task(id).await?;

        // Input to a suspended-but-processing agent resumes the process
        // and feeds the text straight to its stdin.
        if task.status() == Status::Processing
            && self.executor.running().is_suspended(id).await
        {
            self.executor.resume_suspended(id).await?;
            if let Some(adapter) = self.executor.registry().get(&task.executor) {
                adapter.send_input(id, text).await?;
            }
            return self.store.get_task(id).await;
        }

        if task.status() != Status::Blocked {
            return Err(TaskdError::InvalidTransition {
                from: task.status(),
                to: Status::Processing,
            });
        }
        let adapter = self
            .executor
            .registry()
            .get(&task.executor)
            .ok_or_else(|| {
                TaskdError::AdapterUnavailable(format!("unknown executor `{}`", task.executor))
            })?;
        if !adapter.supports_resume() {
            return Err(TaskdError::Conflict(format!(
                "adapter `{}` does not support input re-entry",
                adapter.id()
            )));
        }
        self.retry(id, Some(text)).await
    }

    /// Idempotent pin flag; an event fires only when the value changes.
    pub async fn pin(&self, id: i64, on: bool) -> Result<Task> {
        match self.store.pin_task(id, on).await? {
            Some(change) => Ok(self.publish(change).await),
            None => self.store.get_task(id).await,
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Task>> {
        self.store.search_tasks(query).await
    }

    // ─── Streams ─────────────────────────────────────────────────────────────

    /// Tail a task's log from a given log id. Rows already present are
    /// delivered immediately; new rows follow as the agent writes them.
    pub async fn tail_logs(&self, id: i64, from_seq: i64) -> Result<LogTail> {
        self.store.get_task(id).await?;
        let (tx, rx) = mpsc::channel(TAIL_BUFFER);
        let store = self.store.clone();

        let poller = tokio::spawn(async move {
            let mut cursor = from_seq;
            loop {
                match store.logs_since(id, cursor).await {
                    Ok(lines) => {
                        for line in lines {
                            cursor = line.id + 1;
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(task = id, err = %e, "log tail poll failed");
                    }
                }
                tokio::time::sleep(TAIL_POLL).await;
            }
        });

        Ok(LogTail { rx, poller })
    }

    /// Long-lived filtered event stream.
    pub async fn subscribe_events(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter).await
    }

    /// Persist and apply a new webhook URL list.
    pub async fn set_webhooks(&self, urls: Vec<String>) -> Result<()> {
        let serialized = serde_json::to_string(&urls)
            .map_err(|e| TaskdError::Other(e.into()))?;
        self.store.set_setting("event_webhooks", &serialized).await?;
        self.bus.set_webhook_urls(urls);
        Ok(())
    }

    /// Event stream primed with the last `replay` audited events
    /// (sequence numbers are reassigned; timestamps are original).
    pub async fn subscribe_events_with_replay(
        &self,
        filter: EventFilter,
        replay: i64,
    ) -> Result<Subscription> {
        let sub = self.bus.subscribe(filter).await;
        let records = self.store.recent_events(replay).await?;
        self.bus
            .replay_to(sub.id, records.iter().map(|r| r.to_envelope()).collect())
            .await;
        Ok(sub)
    }
}
