//! Claude Code adapter — spawns the `claude` CLI with stream-json output.
//!
//! First runs go out without `--resume`; the session id captured from the
//! init event is written back to the task so later runs reload the
//! conversation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    binary_on_path, spawn_and_pump, AgentAdapter, OutputSink, ProcessMap, SpawnedAgent,
    KILL_GRACE,
};
use crate::error::Result;
use crate::store::Task;

pub struct ClaudeAdapter {
    procs: Arc<ProcessMap>,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            procs: ProcessMap::new(),
        }
    }

    fn command(task: &Task, workdir: &Path, prompt: &str, resume: Option<&str>) -> Command {
        let mut cmd = Command::new("claude");
        cmd.arg("--print")
            .arg(prompt)
            .args(["--output-format", "stream-json", "--verbose"]);
        if task.dangerous_mode {
            cmd.arg("--dangerously-skip-permissions");
        }
        if let Some(sid) = resume {
            cmd.args(["--resume", sid]);
        }
        cmd.current_dir(workdir);
        cmd
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentAdapter for ClaudeAdapter {
    fn id(&self) -> &str {
        "claude"
    }

    fn installed(&self) -> bool {
        binary_on_path("claude")
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
        spawn_and_pump("claude", cmd, task.id, self.procs.clone(), out).await
    }

    async fn resume(
        &self,
        task: &Task,
        workdir: &Path,
        prompt: &str,
        feedback: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent> {
        // With a prior session the feedback alone is the new turn; the full
        // prompt is only needed when the conversation cannot be reloaded.
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
        spawn_and_pump("claude", cmd, task.id, self.procs.clone(), out).await
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

pub(super) fn compose_with_feedback(prompt: &str, feedback: &str) -> String {
    if feedback.is_empty() {
        prompt.to_string()
    } else {
        format!("{prompt}\n\n# User feedback\n\n{feedback}")
    }
}
