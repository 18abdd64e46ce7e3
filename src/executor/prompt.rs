//! Prompt assembly — fills a task type's instruction template with the
//! task, project instructions, memories, attachments, and recent history.

use std::sync::Arc;

use crate::error::Result;
use crate::store::{Store, Task};

const HISTORY_LINES: i64 = 20;

#[derive(Debug, Default)]
pub struct PromptContext {
    pub project: String,
    pub title: String,
    pub body: String,
    pub project_instructions: String,
    pub memories: String,
    pub attachments: String,
    pub history: String,
}

/// Pure substitution of the `{{placeholder}}` variables.
pub fn render(template: &str, ctx: &PromptContext) -> String {
    template
        .replace("{{project}}", &ctx.project)
        .replace("{{title}}", &ctx.title)
        .replace("{{body}}", &ctx.body)
        .replace("{{project_instructions}}", &ctx.project_instructions)
        .replace("{{memories}}", &ctx.memories)
        .replace("{{attachments}}", &ctx.attachments)
        .replace("{{history}}", &ctx.history)
}

/// Assemble the spawn prompt for a task from the store.
pub async fn build(store: &Arc<Store>, task: &Task) -> Result<String> {
    let task_type = store.get_task_type(&task.task_type).await?;
    let project = store.get_project(&task.project).await?;

    let memories = store.memories_for(&task.project).await?;
    let mut memories_text = String::new();
    let mut current_category = "";
    for m in &memories {
        if m.category != current_category {
            if !memories_text.is_empty() {
                memories_text.push('\n');
            }
            memories_text.push_str(&format!("## {}\n", m.category));
            current_category = &m.category;
        }
        memories_text.push_str(&format!("- {}\n", m.content));
    }
    if memories_text.is_empty() {
        memories_text.push_str("(none)");
    }

    let attachments = store.attachments_for(task.id).await?;
    let attachments_text = if attachments.is_empty() {
        "(none)".to_string()
    } else {
        attachments
            .iter()
            .map(|(name, content)| format!("### {name}\n\n{content}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let history = store.recent_logs(task.id, HISTORY_LINES).await?;
    let history_text = if history.is_empty() {
        "(first run)".to_string()
    } else {
        history
            .iter()
            .map(|l| format!("[{}] {}", l.line_type, l.content))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let ctx = PromptContext {
        project: task.project.clone(),
        title: task.title.clone(),
        body: task.body.clone(),
        project_instructions: project.instructions,
        memories: memories_text,
        attachments: attachments_text,
        history: history_text,
    };
    Ok(render(&task_type.instructions_template, &ctx))
}
