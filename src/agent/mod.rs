//! Agent adapters — a uniform capability set over external agent CLIs.
//!
//! Each adapter knows how to spawn its CLI in a task's worktree, parse the
//! streaming output into typed log lines and item events, and deliver one
//! terminal signal when the process ends. The executor never touches a
//! `Child` directly; process-level operations (kill, suspend, input) go
//! through the adapter that owns the process.

pub mod claude;
pub mod codex;
pub mod mock;
pub mod stream;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, TaskdError};
use crate::events::hooks::HookContext;
use crate::events::{self, Envelope, EventBus};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::{LineType, Store, Task};
use stream::{ItemEvent, Normalised, Sentinel, MAX_LINE_BYTES};

pub use stream::normalise;

/// Grace period between the polite terminate and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

// ─── Terminal signal ─────────────────────────────────────────────────────────

/// How a run ended, as observed by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalSignal {
    Completed { summary: String },
    NeedsInput { question: String },
    Failed { reason: String },
}

/// A live agent process: its pid and the channel that resolves to the
/// terminal signal when the process ends.
pub struct SpawnedAgent {
    pub pid: u32,
    pub done: oneshot::Receiver<TerminalSignal>,
}

// ─── Adapter trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Executor slug this adapter answers to (`claude`, `codex`, `mock`).
    fn id(&self) -> &str;

    /// Whether the backing CLI is installed and executable.
    fn installed(&self) -> bool;

    /// Whether `resume` can re-enter a prior conversation.
    fn supports_resume(&self) -> bool {
        true
    }

    /// Start the agent in `workdir`. Returns promptly once the process is
    /// live; output flows through `out` until the terminal signal fires.
    async fn spawn(
        &self,
        task: &Task,
        workdir: &Path,
        prompt: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent>;

    /// Continue a prior conversation (`task.agent_session_id`) with
    /// user feedback appended to the prompt.
    async fn resume(
        &self,
        task: &Task,
        workdir: &Path,
        prompt: &str,
        feedback: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent>;

    /// Write a line to the running process's stdin.
    async fn send_input(&self, task_id: i64, input: &str) -> Result<()>;

    /// SIGSTOP the process (no-op off unix).
    async fn suspend(&self, task_id: i64) -> Result<()>;

    /// SIGCONT a suspended process (no-op off unix).
    async fn resume_process(&self, task_id: i64) -> Result<()>;

    /// Graceful terminate, hard kill after [`KILL_GRACE`].
    async fn kill(&self, task_id: i64) -> Result<()>;

    async fn pid(&self, task_id: i64) -> Option<u32>;
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    default_executor: String,
}

impl AdapterRegistry {
    pub fn new(default_executor: &str) -> Self {
        Self {
            adapters: HashMap::new(),
            default_executor: default_executor.to_string(),
        }
    }

    /// The standard set: claude + codex.
    pub fn standard(default_executor: &str) -> Self {
        let mut reg = Self::new(default_executor);
        reg.register(Arc::new(claude::ClaudeAdapter::new()));
        reg.register(Arc::new(codex::CodexAdapter::new()));
        reg
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Resolve the adapter for a task's executor slug. An empty slug means
    /// the configured default. `None` for an unknown slug — the executor
    /// blocks the task.
    pub fn get(&self, executor: &str) -> Option<Arc<dyn AgentAdapter>> {
        let slug = if executor.is_empty() {
            self.default_executor.as_str()
        } else {
            executor
        };
        self.adapters.get(slug).cloned()
    }
}

// ─── Output sink ─────────────────────────────────────────────────────────────

/// Where an adapter's parsed output goes: logs into the store
/// (authoritative — retried, never dropped) and item events onto the bus
/// (best-effort).
#[derive(Clone)]
pub struct OutputSink {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    task_id: i64,
    hook_ctx: HookContext,
    project: String,
    /// Unix seconds of the last output line; shared with the idle sweeper.
    activity: Arc<AtomicI64>,
}

impl OutputSink {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, task: &Task) -> Self {
        Self {
            store,
            bus,
            task_id: task.id,
            hook_ctx: HookContext::from(task),
            project: task.project.clone(),
            activity: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp())),
        }
    }

    /// Handle for the idle sweeper: updated on every output line.
    pub fn activity_handle(&self) -> Arc<AtomicI64> {
        self.activity.clone()
    }

    /// Append one log line. Logs are authoritative: transient store errors
    /// are retried with backoff and the adapter blocks until the line has
    /// committed.
    pub async fn log(&self, line_type: LineType, content: &str) {
        let result = retry_with_backoff(&RetryConfig::default(), || async {
            self.store.append_log(self.task_id, line_type, content).await
        })
        .await;
        if let Err(e) = result {
            warn!(task = self.task_id, err = %e, "log append failed after retries");
        }
        self.activity
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Apply one normalised line: log it, write back a captured session
    /// id, and publish its item events.
    pub async fn apply(&self, n: &Normalised) {
        self.log(n.line_type, &n.content).await;

        if let Some(ref sid) = n.session_id {
            if let Err(e) = self.store.set_agent_session(self.task_id, sid).await {
                warn!(task = self.task_id, err = %e, "session id write-back failed");
            }
        }

        for event in &n.events {
            self.publish_item(event).await;
        }
    }

    /// Best-effort: the audit row and bus publish may fail without
    /// affecting the already-committed log line.
    pub async fn publish_item(&self, item: &ItemEvent) {
        let (event_type, message, metadata) = match item {
            ItemEvent::Started { kind, detail } => (
                events::AGENT_ITEM_STARTED,
                format!("{kind} started"),
                json!({ "kind": kind, "detail": detail, "project": self.project }),
            ),
            ItemEvent::Delta { kind, detail } => (
                events::AGENT_ITEM_DELTA,
                format!("{kind} delta"),
                json!({ "kind": kind, "detail": detail, "project": self.project }),
            ),
            ItemEvent::Completed { kind, detail } => (
                events::AGENT_ITEM_COMPLETED,
                format!("{kind} completed"),
                json!({ "kind": kind, "detail": detail, "project": self.project }),
            ),
            ItemEvent::Unparsed { location, raw } => (
                events::AGENT_UNPARSED,
                format!("unparsed agent output at {location}"),
                json!({ "location": location, "raw": raw, "project": self.project }),
            ),
        };
        let env = Envelope::new(event_type, Some(self.task_id), message, metadata);
        if let Err(e) = self.store.record_event(&env).await {
            debug!(task = self.task_id, err = %e, "item event audit failed");
        }
        self.bus.publish(env, Some(self.hook_ctx.clone())).await;
    }
}

// ─── Subprocess bookkeeping (shared by claude + codex) ───────────────────────

pub(crate) struct ProcEntry {
    pid: u32,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

#[derive(Default)]
pub(crate) struct ProcessMap {
    entries: Mutex<HashMap<i64, ProcEntry>>,
}

impl ProcessMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) async fn pid(&self, task_id: i64) -> Option<u32> {
        self.entries.lock().await.get(&task_id).map(|e| e.pid)
    }

    async fn entry_handles(
        &self,
        task_id: i64,
    ) -> Option<(u32, Arc<Mutex<Option<Child>>>, Arc<Mutex<Option<ChildStdin>>>)> {
        self.entries
            .lock()
            .await
            .get(&task_id)
            .map(|e| (e.pid, e.child.clone(), e.stdin.clone()))
    }

    pub(crate) async fn send_input(&self, task_id: i64, input: &str) -> Result<()> {
        let (_, _, stdin) = self
            .entry_handles(task_id)
            .await
            .ok_or_else(|| TaskdError::NotFound(format!("no process for task {task_id}")))?;
        let mut guard = stdin.lock().await;
        let Some(pipe) = guard.as_mut() else {
            return Err(TaskdError::Conflict(format!(
                "task {task_id} process has no open stdin"
            )));
        };
        pipe.write_all(input.as_bytes()).await?;
        pipe.write_all(b"\n").await?;
        pipe.flush().await?;
        Ok(())
    }

    pub(crate) async fn suspend(&self, task_id: i64) -> Result<()> {
        let (pid, _, _) = self
            .entry_handles(task_id)
            .await
            .ok_or_else(|| TaskdError::NotFound(format!("no process for task {task_id}")))?;
        signal_pid(pid, SignalKind::Stop);
        Ok(())
    }

    pub(crate) async fn resume(&self, task_id: i64) -> Result<()> {
        let (pid, _, _) = self
            .entry_handles(task_id)
            .await
            .ok_or_else(|| TaskdError::NotFound(format!("no process for task {task_id}")))?;
        signal_pid(pid, SignalKind::Continue);
        Ok(())
    }

    /// Graceful terminate, then hard kill after `grace`. The child is
    /// never reaped here — the pump task owns the final `wait`.
    pub(crate) async fn kill(&self, task_id: i64, grace: Duration) -> Result<()> {
        let Some((pid, child, _)) = self.entry_handles(task_id).await else {
            return Ok(()); // already exited
        };

        // A stopped process cannot handle SIGTERM; wake it first.
        signal_pid(pid, SignalKind::Continue);
        signal_pid(pid, SignalKind::Terminate);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut guard = child.lock().await;
            match guard.as_mut() {
                None => return Ok(()), // pump reaped it
                Some(c) => match c.try_wait() {
                    Ok(Some(_)) => return Ok(()),
                    Ok(None) if tokio::time::Instant::now() >= deadline => {
                        debug!(task = task_id, pid, "grace expired — hard kill");
                        let _ = c.start_kill();
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(task = task_id, err = %e, "try_wait failed during kill");
                        let _ = c.start_kill();
                        return Ok(());
                    }
                },
            }
        }
    }
}

enum SignalKind {
    Stop,
    Continue,
    Terminate,
}

#[cfg(unix)]
fn signal_pid(pid: u32, kind: SignalKind) {
    let sig = match kind {
        SignalKind::Stop => libc::SIGSTOP,
        SignalKind::Continue => libc::SIGCONT,
        SignalKind::Terminate => libc::SIGTERM,
    };
    // Safety: pid refers to a child we spawned; worst case the signal
    // lands on a dead pid and errors with ESRCH.
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _kind: SignalKind) {}

/// Spawn a configured CLI command and pump its output through the sink.
///
/// Returns once the process is live. The pump task owns stdout draining,
/// sentinel tracking, and the final `wait`; it resolves the oneshot with
/// the terminal signal and removes the process-map entry.
pub(crate) async fn spawn_and_pump(
    adapter_id: &'static str,
    mut cmd: Command,
    task_id: i64,
    procs: Arc<ProcessMap>,
    out: OutputSink,
) -> Result<SpawnedAgent> {
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TaskdError::AdapterUnavailable(format!(
                "`{adapter_id}` is not on PATH — install it or change the task executor"
            ))
        } else {
            TaskdError::Io(e)
        }
    })?;

    let pid = child.id().unwrap_or(0);
    let stdout = child.stdout.take().ok_or_else(|| {
        TaskdError::AdapterProtocol(format!("{adapter_id}: no stdout pipe"))
    })?;
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    let child = Arc::new(Mutex::new(Some(child)));
    procs.entries.lock().await.insert(
        task_id,
        ProcEntry {
            pid,
            child: child.clone(),
            stdin: Arc::new(Mutex::new(stdin)),
        },
    );

    // Stderr is captured as error log lines.
    if let Some(stderr) = stderr {
        let err_out = out.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            while let Ok(Some((line, _))) = next_line_capped(&mut reader, MAX_LINE_BYTES).await
            {
                if !line.trim().is_empty() {
                    err_out.log(LineType::Error, &line).await;
                }
            }
        });
    }

    let (done_tx, done_rx) = oneshot::channel();
    let pump_procs = procs.clone();
    tokio::spawn(async move {
        let signal = pump(adapter_id, stdout, child, task_id, &out).await;
        pump_procs.entries.lock().await.remove(&task_id);
        let _ = done_tx.send(signal);
    });

    Ok(SpawnedAgent { pid, done: done_rx })
}

async fn pump(
    adapter_id: &str,
    stdout: tokio::process::ChildStdout,
    child: Arc<Mutex<Option<Child>>>,
    task_id: i64,
    out: &OutputSink,
) -> TerminalSignal {
    let mut reader = BufReader::new(stdout);
    let mut sentinel: Option<Sentinel> = None;

    loop {
        match next_line_capped(&mut reader, MAX_LINE_BYTES).await {
            Ok(Some((line, truncated))) => {
                if truncated {
                    out.log(LineType::System, &line).await;
                    out.publish_item(&ItemEvent::Unparsed {
                        location: format!("{adapter_id} stdout (line exceeded 1 MiB)"),
                        raw: stream::truncate(&line, 512).to_string(),
                    })
                    .await;
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let n = normalise(adapter_id, &line);
                if n.sentinel.is_some() {
                    sentinel = n.sentinel.clone();
                }
                out.apply(&n).await;
            }
            Ok(None) => break, // EOF
            Err(e) => {
                warn!(task = task_id, err = %e, "agent stdout read failed");
                break;
            }
        }
    }

    // Reap the child. `None` means kill() already won the race to observe
    // the exit; treat that as a plain failure unless a sentinel fired.
    let status = match child.lock().await.take() {
        Some(mut c) => c.wait().await.ok(),
        None => None,
    };

    match sentinel {
        Some(Sentinel::Complete { summary }) => TerminalSignal::Completed { summary },
        Some(Sentinel::NeedsInput { question }) => TerminalSignal::NeedsInput { question },
        None => match status {
            Some(s) if s.success() => TerminalSignal::Completed {
                summary: String::new(),
            },
            Some(s) => TerminalSignal::Failed {
                reason: match s.code() {
                    Some(code) => format!("agent exited with code {code}"),
                    None => "agent terminated by signal".to_string(),
                },
            },
            None => TerminalSignal::Failed {
                reason: "agent process killed".to_string(),
            },
        },
    }
}

/// Read one `\n`-terminated line, capping it at `cap` bytes. Returns the
/// (possibly truncated) line and whether truncation happened; `None` at
/// EOF.
pub(crate) async fn next_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<Option<(String, bool)>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() && !truncated {
                return Ok(None);
            }
            return Ok(Some((String::from_utf8_lossy(&buf).into_owned(), truncated)));
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            let take = pos.min(cap.saturating_sub(buf.len()));
            buf.extend_from_slice(&available[..take]);
            if take < pos {
                truncated = true;
            }
            reader.consume(pos + 1);
            return Ok(Some((String::from_utf8_lossy(&buf).into_owned(), truncated)));
        }

        let len = available.len();
        let room = cap.saturating_sub(buf.len());
        if room > 0 {
            buf.extend_from_slice(&available[..len.min(room)]);
        }
        if len > room {
            truncated = true;
        }
        reader.consume(len);
    }
}

/// Look for `name` as an executable file on PATH.
pub(crate) fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable_file(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
