//! Codex adapter — spawns `codex exec --json` per run.
//!
//! Codex calls its resumable conversation a thread; the thread id from
//! `thread.started` plays the role of the agent session id.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::claude::compose_with_feedback;
use super::{
    binary_on_path, spawn_and_pump, AgentAdapter, OutputSink, ProcessMap, SpawnedAgent,
    KILL_GRACE,
};
use crate::error::Result;
use crate::store::Task;

pub struct CodexAdapter {
    procs: Arc<ProcessMap>,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            procs: ProcessMap::new(),
        }
    }

    fn command(task: &Task, workdir: &Path, prompt: &str, resume: Option<&str>) -> Command {
        let mut cmd = Command::new("codex");
        cmd.arg("exec");
        if let Some(thread) = resume {
            cmd.args(["resume", thread]);
        }
        cmd.args(["--json", "--skip-git-repo-check"]);
        if task.dangerous_mode {
            cmd.arg("--dangerously-bypass-approvals-and-sandbox");
        }
        cmd.arg(prompt);
        cmd.current_dir(workdir);
        cmd
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    fn id(&self) -> &str {
        "codex"
    }

    fn installed(&self) -> bool {
        binary_on_path("codex")
    }

    async fn spawn(
        &self,
        task: &Task,
        workdir: &Path,
        prompt: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent> {
        let resume = (!task.agent_session_id.is_empty()).then_some(task.agent_session_id.as_str());
        let cmd = Self::command(task, workdir, prompt, resume);
        spawn_and_pump("codex", cmd, task.id, self.procs.clone(), out).await
    }

    async fn resume(
        &self,
        task: &Task,
        workdir: &Path,
        prompt: &str,
        feedback: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent> {
        let (text, resume) = if task.agent_session_id.is_empty() {
            (compose_with_feedback(prompt, feedback), None)
        } else {
            let text = if feedback.is_empty() {
                "Continue the task.".to_string()
            } else {
                feedback.to_string()
            };
            (text, Some(task.agent_session_id.as_str()))
        };
        let cmd = Self::command(task, workdir, &text, resume);
        spawn_and_pump("codex", cmd, task.id, self.procs.clone(), out).await
    }

    async fn send_input(&self, task_id: i64, input: &str) -> Result<()> {
        self.procs.send_input(task_id, input).await
    }

    async fn suspend(&self, task_id: i64) -> Result<()> {
        self.procs.suspend(task_id).await
    }

    async fn resume_process(&self, task_id: i64) -> Result<()> {
        self.procs.resume(task_id).await
    }

    async fn kill(&self, task_id: i64) -> Result<()> {
        self.procs.kill(task_id, KILL_GRACE).await
    }

    async fn pid(&self, task_id: i64) -> Option<u32> {
        self.procs.pid(task_id).await
    }
}
