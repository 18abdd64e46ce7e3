//! Background sweepers: idle suspension and done-task auto-archive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use super::Executor;
use crate::agent::AgentAdapter;
use crate::events::hooks::HookContext;
use crate::events::{self, Envelope};
use crate::store::{LineType, Status};

/// Agents silent for this long get SIGSTOPped until input or retry.
pub const DEFAULT_IDLE_SUSPEND_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// `done` tasks untouched this long are archived when `auto_archive_done`
/// is enabled.
pub const ARCHIVE_AFTER: Duration = Duration::from_secs(30 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl Executor {
    pub(super) async fn run_idle_sweeper(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }
            self.sweep_idle().await;
        }
    }

    async fn sweep_idle(&self) {
        let cutoff = Utc::now().timestamp() - self.idle_suspend_timeout.as_secs() as i64;
        for snap in self.running.snapshot().await {
            if snap.suspended || snap.last_output > cutoff {
                continue;
            }
            let Some(adapter) = self.registry.get(&snap.executor) else {
                continue;
            };
            if let Err(e) = adapter.suspend(snap.task_id).await {
                warn!(task = snap.task_id, err = %e, "idle suspend failed");
                continue;
            }
            self.running.set_suspended(snap.task_id, true).await;
            info!(task = snap.task_id, "idle agent suspended");

            let _ = self
                .store
                .append_log(
                    snap.task_id,
                    LineType::System,
                    "agent suspended after idle timeout",
                )
                .await;
            let env = Envelope::new(
                events::TASK_SUSPENDED,
                Some(snap.task_id),
                "Agent suspended after idle timeout",
                serde_json::json!({ "executor": snap.executor }),
            );
            let _ = self.store.record_event(&env).await;
            let ctx = self
                .store
                .try_get_task(snap.task_id)
                .await
                .ok()
                .flatten()
                .map(|t| HookContext::from(&t));
            self.bus.publish(env, ctx).await;
        }
    }

    pub(super) async fn run_archive_sweeper(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.sweep_archive().await {
                warn!(err = %e, "archive sweep failed");
            }
        }
    }

    async fn sweep_archive(&self) -> crate::error::Result<()> {
        let enabled = self
            .store
            .get_setting("auto_archive_done")
            .await?
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        if !enabled {
            return Ok(());
        }

        let cutoff = (Utc::now() - chrono::Duration::from_std(ARCHIVE_AFTER).unwrap_or_default())
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        for task in self.store.done_tasks_untouched_since(&cutoff).await? {
            match self.store.update_status(task.id, Status::Archived).await {
                Ok(change) => {
                    info!(task = task.id, "done task auto-archived");
                    self.publish(change).await;
                }
                Err(e) => warn!(task = task.id, err = %e, "auto-archive failed"),
            }
        }
        Ok(())
    }
}
