//! Projects, per-project memories, and task-type prompt templates.
//!
//! First open seeds the `personal` project and the three built-in task
//! types. Seeding is idempotent — existing rows are never overwritten, so
//! user edits to the templates survive restarts.

use serde::{Deserialize, Serialize};

use super::{now_rfc3339, Store};
use crate::error::{Result, TaskdError};

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub path: String,
    pub aliases: String,
    pub instructions: String,
    pub color: String,
    pub init_script: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TaskType {
    pub name: String,
    pub instructions_template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    General,
    Context,
    Patterns,
    Decisions,
    Gotchas,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::General => "general",
            MemoryCategory::Context => "context",
            MemoryCategory::Patterns => "patterns",
            MemoryCategory::Decisions => "decisions",
            MemoryCategory::Gotchas => "gotchas",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub project: String,
    pub category: String,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

const CODE_TEMPLATE: &str = "\
You are working on the {{project}} project.

{{project_instructions}}

# Task: {{title}}

{{body}}

# Project memory

{{memories}}

# Attachments

{{attachments}}

# Recent activity

{{history}}

When the work is finished, call the workflow_complete tool with a short
summary. If you need a decision or more information from the user, call
workflow_needs_input with your question instead of guessing.";

const WRITING_TEMPLATE: &str = "\
You are drafting a piece of writing for the {{project}} project.

{{project_instructions}}

# Brief: {{title}}

{{body}}

# Notes and prior context

{{memories}}

{{attachments}}

Write the full draft, then call workflow_complete with a one-line summary.
Call workflow_needs_input if the brief is ambiguous.";

const THINKING_TEMPLATE: &str = "\
Think through the following question for the {{project}} project and write
up your conclusions.

# Question: {{title}}

{{body}}

Relevant context:

{{memories}}

{{history}}

Finish with workflow_complete; use workflow_needs_input if you cannot
proceed without an answer from the user.";

impl Store {
    /// Seed the `personal` project and the built-in task types. Idempotent.
    pub(super) async fn seed(&self) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO projects (name, created_at) VALUES ('personal', ?)",
        )
        .bind(now_rfc3339())
        .execute(self.pool())
        .await?;

        for (name, template) in [
            ("code", CODE_TEMPLATE),
            ("writing", WRITING_TEMPLATE),
            ("thinking", THINKING_TEMPLATE),
        ] {
            sqlx::query(
                "INSERT OR IGNORE INTO task_types (name, instructions_template) VALUES (?, ?)",
            )
            .bind(name)
            .bind(template)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    // ─── Projects ────────────────────────────────────────────────────────────

    pub async fn create_project(&self, name: &str, path: &str) -> Result<Project> {
        let result = sqlx::query_as(
            "INSERT INTO projects (name, path, created_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(name)
        .bind(path)
        .bind(now_rfc3339())
        .fetch_one(self.pool())
        .await;
        match result {
            Ok(p) => Ok(p),
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => Err(
                TaskdError::Conflict(format!("project already exists: {name}")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_project(&self, name: &str) -> Result<Project> {
        sqlx::query_as("SELECT * FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| TaskdError::NotFound(format!("project {name}")))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(sqlx::query_as("SELECT * FROM projects ORDER BY name")
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn update_project(
        &self,
        name: &str,
        path: Option<&str>,
        instructions: Option<&str>,
        init_script: Option<&str>,
        color: Option<&str>,
    ) -> Result<Project> {
        sqlx::query_as(
            "UPDATE projects SET
               path = COALESCE(?, path),
               instructions = COALESCE(?, instructions),
               init_script = COALESCE(?, init_script),
               color = COALESCE(?, color)
             WHERE name = ? RETURNING *",
        )
        .bind(path)
        .bind(instructions)
        .bind(init_script)
        .bind(color)
        .bind(name)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| TaskdError::NotFound(format!("project {name}")))
    }

    /// Delete a project. The seeded `personal` project cannot be removed.
    pub async fn delete_project(&self, name: &str) -> Result<()> {
        if name == "personal" {
            return Err(TaskdError::Conflict(
                "the personal project cannot be deleted".into(),
            ));
        }
        let result = sqlx::query("DELETE FROM projects WHERE name = ?")
            .bind(name)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskdError::NotFound(format!("project {name}")));
        }
        Ok(())
    }

    /// Resolve a project by name or alias (aliases is a comma list).
    pub async fn resolve_project(&self, name_or_alias: &str) -> Result<Project> {
        if let Ok(p) = self.get_project(name_or_alias).await {
            return Ok(p);
        }
        let all = self.list_projects().await?;
        all.into_iter()
            .find(|p| {
                p.aliases
                    .split(',')
                    .map(str::trim)
                    .any(|a| !a.is_empty() && a == name_or_alias)
            })
            .ok_or_else(|| TaskdError::NotFound(format!("project {name_or_alias}")))
    }

    // ─── Task types ──────────────────────────────────────────────────────────

    pub async fn get_task_type(&self, name: &str) -> Result<TaskType> {
        sqlx::query_as("SELECT * FROM task_types WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| TaskdError::NotFound(format!("task type {name}")))
    }

    pub async fn list_task_types(&self) -> Result<Vec<TaskType>> {
        Ok(sqlx::query_as("SELECT * FROM task_types ORDER BY name")
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn upsert_task_type(&self, name: &str, template: &str) -> Result<TaskType> {
        Ok(sqlx::query_as(
            "INSERT INTO task_types (name, instructions_template) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET instructions_template = excluded.instructions_template
             RETURNING *",
        )
        .bind(name)
        .bind(template)
        .fetch_one(self.pool())
        .await?)
    }

    // ─── Memories ────────────────────────────────────────────────────────────

    pub async fn add_memory(
        &self,
        project: &str,
        category: MemoryCategory,
        content: &str,
    ) -> Result<Memory> {
        self.get_project(project).await?;
        let now = now_rfc3339();
        Ok(sqlx::query_as(
            "INSERT INTO memories (project, category, content, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(project)
        .bind(category.as_str())
        .bind(content)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await?)
    }

    pub async fn memories_for(&self, project: &str) -> Result<Vec<Memory>> {
        Ok(sqlx::query_as(
            "SELECT * FROM memories WHERE project = ? ORDER BY category, id",
        )
        .bind(project)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn delete_memory(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskdError::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    // ─── Attachments ─────────────────────────────────────────────────────────

    pub async fn add_attachment(
        &self,
        task_id: i64,
        filename: &str,
        content: &str,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO attachments (task_id, filename, content, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(task_id)
        .bind(filename)
        .bind(content)
        .bind(now_rfc3339())
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    pub async fn attachments_for(&self, task_id: i64) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT filename, content FROM attachments WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
