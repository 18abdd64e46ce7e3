//! In-process mock adapter for tests and dry runs. No subprocess is
//! spawned; a driver task emits a scripted stream shaped like a real
//! agent's, steered by `mock:` directives in the task body:
//!
//! - `mock:needs-input` — first run blocks asking for input; the resumed
//!   run completes.
//! - `mock:fail` — the run fails.
//! - `mock:hang` — the run never ends until killed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};

use super::stream::{ItemEvent, Normalised, Sentinel};
use super::{AgentAdapter, OutputSink, SpawnedAgent, TerminalSignal};
use crate::error::Result;
use crate::store::LineType;

#[derive(Default)]
pub struct MockAdapter {
    cancels: Arc<Mutex<HashMap<i64, oneshot::Sender<()>>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(
        &self,
        task_id: i64,
        body: String,
        feedback: Option<String>,
        out: OutputSink,
    ) -> SpawnedAgent {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().await.insert(task_id, cancel_tx);

        let (done_tx, done_rx) = oneshot::channel();
        let cancels = self.cancels.clone();
        tokio::spawn(async move {
            let signal = drive(task_id, &body, feedback.as_deref(), &out, cancel_rx).await;
            cancels.lock().await.remove(&task_id);
            let _ = done_tx.send(signal);
        });

        SpawnedAgent { pid: 0, done: done_rx }
    }
}

async fn drive(
    task_id: i64,
    body: &str,
    feedback: Option<&str>,
    out: &OutputSink,
    mut cancel_rx: oneshot::Receiver<()>,
) -> TerminalSignal {
    out.apply(&Normalised {
        line_type: LineType::System,
        content: "agent session: init".into(),
        events: Vec::new(),
        session_id: Some(format!("mock-session-{task_id}")),
        sentinel: None,
    })
    .await;

    if let Some(feedback) = feedback {
        out.apply(&Normalised {
            line_type: LineType::Text,
            content: format!("continuing with feedback: {feedback}"),
            events: vec![ItemEvent::Delta {
                kind: "message".into(),
                detail: json!({ "text": feedback }),
            }],
            session_id: None,
            sentinel: None,
        })
        .await;
        return complete(out).await;
    }

    out.apply(&Normalised {
        line_type: LineType::Text,
        content: "working on the task".into(),
        events: vec![ItemEvent::Delta {
            kind: "message".into(),
            detail: json!({ "text": "working on the task" }),
        }],
        session_id: None,
        sentinel: None,
    })
    .await;

    if body.contains("mock:hang") {
        // Runs until killed.
        let _ = (&mut cancel_rx).await;
        out.log(LineType::System, "mock agent killed").await;
        return TerminalSignal::Failed {
            reason: "agent process killed".into(),
        };
    }

    // Give interleaving tests a scheduling point.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    if cancel_rx.try_recv().is_ok() {
        out.log(LineType::System, "mock agent killed").await;
        return TerminalSignal::Failed {
            reason: "agent process killed".into(),
        };
    }

    if body.contains("mock:fail") {
        out.log(LineType::Error, "mock failure injected").await;
        return TerminalSignal::Failed {
            reason: "mock failure injected".into(),
        };
    }

    if body.contains("mock:needs-input") {
        let question = "choose an option".to_string();
        out.apply(&Normalised {
            line_type: LineType::Tool,
            content: "tool call: workflow_needs_input".into(),
            events: vec![ItemEvent::Started {
                kind: "tool_call".into(),
                detail: json!({ "name": "workflow_needs_input", "arguments": { "question": question } }),
            }],
            session_id: None,
            sentinel: Some(Sentinel::NeedsInput {
                question: question.clone(),
            }),
        })
        .await;
        return TerminalSignal::NeedsInput { question };
    }

    complete(out).await
}

async fn complete(out: &OutputSink) -> TerminalSignal {
    let summary = "mock run complete".to_string();
    out.apply(&Normalised {
        line_type: LineType::Tool,
        content: "tool call: workflow_complete".into(),
        events: vec![ItemEvent::Completed {
            kind: "tool_call".into(),
            detail: json!({ "name": "workflow_complete", "output": { "summary": summary } }),
        }],
        session_id: None,
        sentinel: Some(Sentinel::Complete {
            summary: summary.clone(),
        }),
    })
    .await;
    TerminalSignal::Completed { summary }
}

#[async_trait]
impl AgentAdapter for MockAdapter {
    fn id(&self) -> &str {
        "mock"
    }

    fn installed(&self) -> bool {
        true
    }

    async fn spawn(
        &self,
        task: &crate::store::Task,
        _workdir: &Path,
        _prompt: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent> {
        Ok(self.run(task.id, task.body.clone(), None, out).await)
    }

    async fn resume(
        &self,
        task: &crate::store::Task,
        _workdir: &Path,
        _prompt: &str,
        feedback: &str,
        out: OutputSink,
    ) -> Result<SpawnedAgent> {
        Ok(self
            .run(task.id, task.body.clone(), Some(feedback.to_string()), out)
            .await)
    }

    async fn send_input(&self, _task_id: i64, _input: &str) -> Result<()> {
        Ok(())
    }

    async fn suspend(&self, _task_id: i64) -> Result<()> {
        Ok(())
    }

    async fn resume_process(&self, _task_id: i64) -> Result<()> {
        Ok(())
    }

    async fn kill(&self, task_id: i64) -> Result<()> {
        if let Some(tx) = self.cancels.lock().await.remove(&task_id) {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn pid(&self, task_id: i64) -> Option<u32> {
        self.cancels.lock().await.contains_key(&task_id).then_some(0)
    }
}
