//! Script-hook sink.
//!
//! If `<hooks_dir>/<event.type>` exists and is executable it is spawned
//! once per delivered event with the task context in its environment.
//! Hooks run on detached tasks with a hard timeout and are killed early
//! when the daemon shuts down.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::Envelope;

pub const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Task fields exposed to hook processes. Built by the publisher from the
/// task row it already holds; `None` for events with no task.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub title: String,
    pub status: String,
    pub project: String,
    pub task_type: String,
    pub executor: String,
}

impl From<&crate::store::Task> for HookContext {
    fn from(task: &crate::store::Task) -> Self {
        Self {
            title: task.title.clone(),
            status: task.status.clone(),
            project: task.project.clone(),
            task_type: task.task_type.clone(),
            executor: task.executor.clone(),
        }
    }
}

pub struct HookRunner {
    hooks_dir: PathBuf,
    /// Fire hooks for high-frequency `agent.item.*` events. Off by
    /// default — lifecycle events always fire.
    item_events: bool,
}

impl HookRunner {
    pub fn new(hooks_dir: PathBuf, item_events: bool) -> Self {
        Self {
            hooks_dir,
            item_events,
        }
    }

    /// Fire-and-forget. Spawns a detached task when a hook script exists
    /// for this event type; otherwise returns without touching the disk
    /// beyond one metadata lookup.
    pub fn fire(
        &self,
        env: &Envelope,
        ctx: Option<HookContext>,
        shutdown: watch::Receiver<bool>,
    ) {
        if env.event_type.starts_with("agent.item.") && !self.item_events {
            return;
        }
        let script = self.hooks_dir.join(&env.event_type);
        if !is_executable(&script) {
            return;
        }

        let env = env.clone();
        let ctx = ctx.unwrap_or_default();
        tokio::spawn(async move {
            run_hook(script, env, ctx, shutdown).await;
        });
    }
}

async fn run_hook(
    script: PathBuf,
    env: Envelope,
    ctx: HookContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cmd = Command::new(&script);
    cmd.env("TASK_ID", env.task_id.map(|i| i.to_string()).unwrap_or_default())
        .env("TASK_EVENT", &env.event_type)
        .env("TASK_MESSAGE", &env.message)
        .env("TASK_TIMESTAMP", &env.timestamp)
        .env("TASK_TITLE", &ctx.title)
        .env("TASK_STATUS", &ctx.status)
        .env("TASK_PROJECT", &ctx.project)
        .env("TASK_TYPE", &ctx.task_type)
        .env("TASK_EXECUTOR", &ctx.executor)
        .env("TASK_METADATA", env.metadata.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(script = %script.display(), err = %e, "hook spawn failed");
            return;
        }
    };

    tokio::select! {
        result = tokio::time::timeout(HOOK_TIMEOUT, child.wait()) => match result {
            Ok(Ok(status)) if status.success() => {
                debug!(script = %script.display(), event = %env.event_type, "hook completed");
            }
            Ok(Ok(status)) => {
                warn!(script = %script.display(), code = ?status.code(), "hook exited non-zero");
            }
            Ok(Err(e)) => {
                warn!(script = %script.display(), err = %e, "hook wait failed");
            }
            Err(_) => {
                warn!(script = %script.display(), "hook timed out — killing");
                let _ = child.kill().await;
            }
        },
        _ = shutdown.changed() => {
            debug!(script = %script.display(), "shutdown — killing hook");
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}
