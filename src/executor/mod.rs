//! The executor loop — owner of the task lifecycle.
//!
//! A dispatcher polls the atomic dequeue on a 1-second tick (and on every
//! `task.queued`/`task.retried` event) and hands each claimed task to a
//! worker slot from a bounded pool. The worker provisions the worktree,
//! builds the prompt, spawns the agent through its adapter, and translates
//! the adapter's terminal signal into a state-machine transition. One
//! worker per task, enforced by the dequeue guard plus the running map.

pub mod prompt;
pub mod running;
mod sweeper;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::agent::{AdapterRegistry, AgentAdapter, OutputSink, SpawnedAgent, TerminalSignal};
use crate::error::{Result, TaskdError};
use crate::events::hooks::HookContext;
use crate::events::{self, Envelope, EventBus, EventFilter};
use crate::store::{LineType, Status, StatusChange, Store, Task, TaskPatch};
use crate::worktree::WorktreeProvisioner;
use running::{CancelReason, RunningMap, RunningTask};

pub use sweeper::{ARCHIVE_AFTER, DEFAULT_IDLE_SUSPEND_TIMEOUT};

const DISPATCH_TICK: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Executor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<AdapterRegistry>,
    provisioner: Arc<WorktreeProvisioner>,
    running: Arc<RunningMap>,
    shutdown: watch::Receiver<bool>,
    max_workers: usize,
    idle_suspend_timeout: Duration,
    /// Fallback working directory for tasks whose project has no
    /// repository path (no worktree, no port).
    data_dir: PathBuf,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<AdapterRegistry>,
        provisioner: Arc<WorktreeProvisioner>,
        shutdown: watch::Receiver<bool>,
        max_workers: usize,
        idle_suspend_timeout: Duration,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            provisioner,
            running: RunningMap::new(),
            shutdown,
            max_workers: max_workers.max(1),
            idle_suspend_timeout,
            data_dir,
        })
    }

    pub fn running(&self) -> Arc<RunningMap> {
        self.running.clone()
    }

    pub fn registry(&self) -> Arc<AdapterRegistry> {
        self.registry.clone()
    }

    // ─── Dispatcher ──────────────────────────────────────────────────────────

    /// Run the dispatch loop until shutdown. Spawns the sweepers as side
    /// tasks. Returns once all workers have drained (or the grace period
    /// expired and stragglers were force-killed).
    pub async fn run(self: Arc<Self>) {
        self.recover_orphans().await;

        tokio::spawn(self.clone().run_idle_sweeper());
        tokio::spawn(self.clone().run_archive_sweeper());

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut wake = self
            .bus
            .subscribe(EventFilter {
                types: vec![
                    events::TASK_QUEUED.to_string(),
                    events::TASK_RETRIED.to_string(),
                ],
                ..Default::default()
            })
            .await;
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(DISPATCH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(workers = self.max_workers, "executor dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
                _ = wake.rx.recv() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            // Drain the queue into free worker slots.
            loop {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                match self.store.next_queued().await {
                    Ok(Some(change)) => {
                        let exec = self.clone();
                        tokio::spawn(async move {
                            exec.run_claimed(change).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(err = %e, "dequeue failed");
                        break;
                    }
                }
            }
        }

        info!("executor shutting down — cancelling workers");
        self.running.cancel_all(CancelReason::Shutdown).await;
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.running.is_empty().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.running.is_empty().await {
            let remaining = self.running.len().await;
            warn!(
                remaining,
                "workers did not drain in time — force-killing agents"
            );
            for snap in self.running.snapshot().await {
                if let Some(adapter) = self.registry.get(&snap.executor) {
                    let _ = adapter.kill(snap.task_id).await;
                }
            }
        }
    }

    /// Tasks stuck in `processing` from a previous daemon run have no
    /// process behind them; block them with a reason so a human can retry.
    async fn recover_orphans(&self) {
        let tasks = match self
            .store
            .list_tasks(&crate::store::TaskFilter {
                status: Some(Status::Processing),
                ..Default::default()
            })
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(err = %e, "orphan scan failed");
                return;
            }
        };
        for task in tasks {
            warn!(task = task.id, "recovering task orphaned by restart");
            let _ = self
                .store
                .append_log(task.id, LineType::System, "daemon restarted during processing")
                .await;
            match self
                .store
                .update_status_with(
                    task.id,
                    Status::Blocked,
                    None,
                    Some("daemon restarted during processing"),
                )
                .await
            {
                Ok(change) => {
                    self.publish(change).await;
                }
                Err(e) => warn!(task = task.id, err = %e, "orphan recovery failed"),
            }
        }
    }

    // ─── Worker ──────────────────────────────────────────────────────────────

    async fn run_claimed(&self, change: StatusChange) {
        let task = change.task.clone();
        self.publish(change).await;

        let (cancel_tx, cancel_rx) = mpsc::channel(4);
        let activity = Arc::new(std::sync::atomic::AtomicI64::new(Utc::now().timestamp()));
        self.running
            .insert(
                task.id,
                RunningTask {
                    pid: 0,
                    executor: task.executor.clone(),
                    cancel: cancel_tx,
                    suspended: false,
                    last_output: activity,
                },
            )
            .await;

        if let Err(e) = self.drive(task.clone(), cancel_rx).await {
            error!(task = task.id, err = %e, "worker failed — blocking task");
            let _ = self
                .store
                .append_log(task.id, LineType::Error, &e.to_string())
                .await;
            match self
                .store
                .update_status_with(task.id, Status::Blocked, None, Some(&e.to_string()))
                .await
            {
                Ok(change) => self.publish(change).await,
                Err(e) => warn!(task = task.id, err = %e, "block transition failed"),
            }
        }

        self.running.remove(task.id).await;
    }

    async fn drive(
        &self,
        task: Task,
        mut cancel_rx: mpsc::Receiver<CancelReason>,
    ) -> Result<()> {
        // Adapter resolution happens before any resource allocation: an
        // unknown or missing CLI blocks the task with no worktree and no
        // port.
        let Some(adapter) = self.registry.get(&task.executor) else {
            return self
                .block(
                    &task,
                    &format!(
                        "unknown executor `{}` — configure an installed adapter",
                        task.executor
                    ),
                )
                .await;
        };
        if !adapter.installed() {
            return self
                .block(
                    &task,
                    &format!(
                        "the `{}` CLI is not installed or not on PATH",
                        adapter.id()
                    ),
                )
                .await;
        }

        let workdir = match self.prepare_workspace(&task).await? {
            Some(dir) => dir,
            None => return Ok(()), // blocked inside prepare_workspace
        };

        // The worktree/port writes above changed the row.
        let task = self.store.get_task(task.id).await?;
        let prompt = prompt::build(&self.store, &task).await?;

        let sink = OutputSink::new(self.store.clone(), self.bus.clone(), &task);
        // Share the sink's activity clock with the idle sweeper.
        self.running
            .set_activity(task.id, sink.activity_handle())
            .await;

        let use_resume =
            !task.agent_session_id.is_empty() || !task.feedback.is_empty();
        let spawned: SpawnedAgent = if use_resume && adapter.supports_resume() {
            adapter
                .resume(&task, &workdir, &prompt, &task.feedback, sink)
                .await?
        } else {
            adapter.spawn(&task, &workdir, &prompt, sink).await?
        };
        self.running.set_pid(task.id, spawned.pid).await;
        if !task.feedback.is_empty() {
            self.store.set_feedback(task.id, "").await?;
        }

        let env = Envelope::new(
            events::TASK_PROCESSING,
            Some(task.id),
            format!("Agent running: {}", adapter.id()),
            serde_json::json!({ "project": task.project, "executor": adapter.id(), "pid": spawned.pid }),
        );
        let _ = self.store.record_event(&env).await;
        self.bus.publish(env, Some(HookContext::from(&task))).await;

        let mut done = spawned.done;
        tokio::select! {
            signal = &mut done => {
                let signal = signal.unwrap_or(TerminalSignal::Failed {
                    reason: "adapter stream ended unexpectedly".to_string(),
                });
                self.finish(&task, signal).await;
            }
            Some(reason) = cancel_rx.recv() => {
                let _ = adapter.kill(task.id).await;
                let (event_type, note) = match reason {
                    CancelReason::Interrupt => (Some(events::TASK_INTERRUPTED), "interrupted"),
                    CancelReason::Shutdown => (None, "daemon shutdown"),
                };
                let _ = self.store.append_log(task.id, LineType::System, note).await;
                match self
                    .store
                    .update_status_with(task.id, Status::Blocked, event_type, Some(note))
                    .await
                {
                    Ok(change) => self.publish(change).await,
                    Err(e) => warn!(task = task.id, err = %e, "cancel transition failed"),
                }
            }
        }
        Ok(())
    }

    /// Worktree + port provisioning. `Ok(None)` means the task was blocked
    /// here (worktree failure); `Ok(Some(dir))` is the agent's workdir.
    async fn prepare_workspace(&self, task: &Task) -> Result<Option<PathBuf>> {
        let project = self.store.get_project(&task.project).await?;

        if project.path.is_empty() {
            self.store
                .append_log(
                    task.id,
                    LineType::System,
                    "project has no repository path — running without a worktree",
                )
                .await?;
            return Ok(Some(self.data_dir.clone()));
        }

        if !task.worktree_path.is_empty() {
            return Ok(Some(PathBuf::from(&task.worktree_path)));
        }

        let info = match self.provisioner.provision(task, &project).await {
            Ok(info) => info,
            Err(e) => {
                let env = Envelope::new(
                    events::WORKTREE_FAILED,
                    Some(task.id),
                    format!("Worktree provisioning failed: {e}"),
                    serde_json::json!({ "project": task.project, "error": e.to_string() }),
                );
                let _ = self.store.record_event(&env).await;
                self.bus.publish(env, Some(HookContext::from(task))).await;
                self.block(task, &format!("worktree provisioning failed: {e}"))
                    .await?;
                return Ok(None);
            }
        };

        self.store
            .set_worktree(task.id, &info.path.to_string_lossy(), &info.branch)
            .await?;
        if task.port == 0 {
            self.store.allocate_port(task.id).await?;
        }

        let env = Envelope::new(
            events::WORKTREE_READY,
            Some(task.id),
            format!("Worktree ready on {}", info.branch),
            serde_json::json!({
                "project": task.project,
                "branch": info.branch,
                "path": info.path.to_string_lossy(),
            }),
        );
        let _ = self.store.record_event(&env).await;
        self.bus.publish(env, Some(HookContext::from(task))).await;

        // Init script failures are surfaced but never fail the task.
        let fresh = self.store.get_task(task.id).await?;
        if let Err(e) = self
            .provisioner
            .run_init_script(&project, &fresh, &info)
            .await
        {
            warn!(task = task.id, err = %e, "init script failed");
            let env = Envelope::new(
                events::WORKTREE_INIT_FAILED,
                Some(task.id),
                format!("Init script failed: {e}"),
                serde_json::json!({ "project": task.project, "error": e.to_string() }),
            );
            let _ = self.store.record_event(&env).await;
            self.bus.publish(env, Some(HookContext::from(task))).await;
        }

        Ok(Some(info.path))
    }

    async fn finish(&self, task: &Task, signal: TerminalSignal) {
        debug!(task = task.id, signal = ?signal, "terminal signal");
        match signal {
            TerminalSignal::Completed { summary } => {
                if !summary.is_empty() {
                    match self
                        .store
                        .update_fields(
                            task.id,
                            TaskPatch {
                                summary: Some(summary),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        Ok(change) => self.publish(change).await,
                        Err(e) => warn!(task = task.id, err = %e, "summary update failed"),
                    }
                }
                match self.store.update_status(task.id, Status::Done).await {
                    Ok(change) => {
                        self.publish(change).await;
                        self.reschedule_recurring(task).await;
                    }
                    Err(e) => warn!(task = task.id, err = %e, "done transition failed"),
                }
            }
            TerminalSignal::NeedsInput { question } => {
                let _ = self
                    .store
                    .append_log(
                        task.id,
                        LineType::System,
                        &format!("agent needs input: {question}"),
                    )
                    .await;
                match self
                    .store
                    .update_status_with(task.id, Status::Blocked, None, Some(&question))
                    .await
                {
                    Ok(change) => self.publish(change).await,
                    Err(e) => warn!(task = task.id, err = %e, "blocked transition failed"),
                }
            }
            TerminalSignal::Failed { reason } => {
                let _ = self
                    .store
                    .append_log(task.id, LineType::Error, &reason)
                    .await;
                match self
                    .store
                    .update_status_with(
                        task.id,
                        Status::Blocked,
                        Some(events::TASK_FAILED),
                        Some(&reason),
                    )
                    .await
                {
                    Ok(change) => self.publish(change).await,
                    Err(e) => warn!(task = task.id, err = %e, "failed transition failed"),
                }
            }
        }
    }

    /// A completed run of a recurring task goes straight back to the queue
    /// with its next due time.
    async fn reschedule_recurring(&self, task: &Task) {
        if task.recurrence.is_empty() {
            return;
        }
        let Some(next) = next_recurrence(&task.recurrence) else {
            warn!(task = task.id, rule = %task.recurrence, "unparsable recurrence — not requeued");
            return;
        };
        if let Err(e) = self.store.set_scheduled_at(task.id, Some(&next)).await {
            warn!(task = task.id, err = %e, "recurrence reschedule failed");
            return;
        }
        match self.store.update_status(task.id, Status::Queued).await {
            Ok(change) => {
                info!(task = task.id, next = %next, "recurring task requeued");
                self.publish(change).await;
            }
            Err(e) => warn!(task = task.id, err = %e, "recurrence requeue failed"),
        }
    }

    async fn block(&self, task: &Task, reason: &str) -> Result<()> {
        self.store
            .append_log(task.id, LineType::Error, reason)
            .await?;
        let change = self
            .store
            .update_status_with(task.id, Status::Blocked, None, Some(reason))
            .await?;
        self.publish(change).await;
        Ok(())
    }

    async fn publish(&self, change: StatusChange) {
        self.bus
            .publish(change.event, Some(HookContext::from(&change.task)))
            .await;
    }

    // ─── External entry points (interrupt / input) ───────────────────────────

    /// Kill the agent and move `processing → blocked` with reason
    /// `interrupted`. Waits for the owning worker to finish the transition.
    pub async fn interrupt(&self, id: i64) -> Result<Task> {
        let task = self.store.get_task(id).await?;
        if task.status() != Status::Processing {
            return Err(TaskdError::InvalidTransition {
                from: task.status(),
                to: Status::Blocked,
            });
        }

        if self
            .running
            .request_cancel(id, CancelReason::Interrupt)
            .await
        {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            while self.running.contains(id).await
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        } else {
            // No live worker (restart edge) — transition directly.
            let _ = self
                .store
                .append_log(id, LineType::System, "interrupted")
                .await;
            let change = self
                .store
                .update_status_with(
                    id,
                    Status::Blocked,
                    Some(events::TASK_INTERRUPTED),
                    Some("interrupted"),
                )
                .await?;
            self.publish(change).await;
        }
        self.store.get_task(id).await
    }

    /// Wake a process the idle sweeper put to sleep.
    pub async fn resume_suspended(&self, id: i64) -> Result<()> {
        let task = self.store.get_task(id).await?;
        if !self.running.is_suspended(id).await {
            return Ok(());
        }
        if let Some(adapter) = self.registry.get(&task.executor) {
            adapter.resume_process(id).await?;
        }
        self.running.set_suspended(id, false).await;
        Ok(())
    }
}

// ─── Recurrence ──────────────────────────────────────────────────────────────

/// Next due time for a recurrence rule, from now. Supported forms:
/// `@hourly`, `@daily`, `@weekly`, `every <n>m|h|d`.
pub fn next_recurrence(rule: &str) -> Option<String> {
    let now = Utc::now();
    let next = match rule.trim() {
        "@hourly" => now + ChronoDuration::hours(1),
        "@daily" => now + ChronoDuration::days(1),
        "@weekly" => now + ChronoDuration::weeks(1),
        other => {
            let spec = other.strip_prefix("every ")?.trim();
            let (idx, unit) = spec.char_indices().last()?;
            let n: i64 = spec[..idx].trim().parse().ok()?;
            if n <= 0 {
                return None;
            }
            match unit {
                'm' => now + ChronoDuration::minutes(n),
                'h' => now + ChronoDuration::hours(n),
                'd' => now + ChronoDuration::days(n),
                _ => return None,
            }
        }
    };
    Some(next.to_rfc3339_opts(SecondsFormat::Micros, true))
}
