//! Task CRUD, the atomic dequeue, and the status writer.
//!
//! `update_status` is the only path that changes `tasks.status`. It
//! validates the transition, stamps timestamps, releases the port and
//! worktree row on terminal entry, and inserts the matching audit event in
//! the same transaction. Callers publish the returned envelope to the bus
//! after the transaction has committed.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::status::{check_transition, event_type_for, Status};
use super::{event, now_rfc3339, Store};
use crate::error::{Result, TaskdError};
use crate::events::{self, Envelope};

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub status: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub executor: String,
    pub project: String,
    pub priority: i64,
    pub pinned: bool,
    pub dangerous_mode: bool,
    pub worktree_path: String,
    pub branch_name: String,
    pub port: i64,
    pub agent_session_id: String,
    /// Feedback saved by `retry(feedback)` / `send_input`, consumed by the
    /// next `resume` call.
    pub feedback: String,
    pub recurrence: String,
    pub scheduled_at: Option<String>,
    pub last_run_at: Option<String>,
    pub parent_task_id: Option<i64>,
    pub summary: String,
    pub pr_url: String,
    pub pr_number: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Task {
    pub fn status(&self) -> Status {
        // The CHECK constraint guarantees the column parses.
        self.status.parse().unwrap_or(Status::Backlog)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub body: String,
    pub task_type: Option<String>,
    pub executor: Option<String>,
    pub project: Option<String>,
    pub priority: i64,
    pub pinned: bool,
    pub dangerous_mode: bool,
    pub recurrence: Option<String>,
    pub scheduled_at: Option<String>,
    pub parent_task_id: Option<i64>,
}

/// Field-wise update; `None` leaves the column untouched. Status is
/// deliberately absent — `update_status` is the only status writer.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub task_type: Option<String>,
    pub executor: Option<String>,
    pub project: Option<String>,
    pub priority: Option<i64>,
    pub dangerous_mode: Option<bool>,
    pub recurrence: Option<String>,
    pub scheduled_at: Option<String>,
    pub summary: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub parent_task_id: Option<i64>,
}

impl TaskPatch {
    /// Names of the fields this patch touches, for the `task.updated` event.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        macro_rules! touch {
            ($field:ident) => {
                if self.$field.is_some() {
                    out.push(stringify!($field));
                }
            };
        }
        touch!(title);
        touch!(body);
        touch!(task_type);
        touch!(executor);
        touch!(project);
        touch!(priority);
        touch!(dangerous_mode);
        touch!(recurrence);
        touch!(scheduled_at);
        touch!(summary);
        touch!(pr_url);
        touch!(pr_number);
        touch!(parent_task_id);
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<Status>,
    pub project: Option<String>,
    pub task_type: Option<String>,
    /// Include archived tasks when no status filter is given.
    pub all: bool,
}

/// A committed status change plus the audit envelope to publish.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub task: Task,
    pub event: Envelope,
}

// ─── CRUD ─────────────────────────────────────────────────────────────────────

impl Store {
    pub async fn create_task(&self, new: NewTask) -> Result<StatusChange> {
        if new.title.trim().is_empty() {
            return Err(TaskdError::Conflict("task title must not be empty".into()));
        }
        let project = new.project.unwrap_or_else(|| "personal".to_string());
        // Referenced project must exist.
        self.get_project(&project).await?;

        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;
        let task: Task = sqlx::query_as(
            "INSERT INTO tasks
             (title, body, type, executor, project, priority, pinned, dangerous_mode,
              recurrence, scheduled_at, parent_task_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&new.title)
        .bind(&new.body)
        .bind(new.task_type.as_deref().unwrap_or("code"))
        .bind(new.executor.as_deref().unwrap_or("claude"))
        .bind(&project)
        .bind(new.priority)
        .bind(new.pinned)
        .bind(new.dangerous_mode)
        .bind(new.recurrence.as_deref().unwrap_or(""))
        .bind(&new.scheduled_at)
        .bind(new.parent_task_id)
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        let env = Envelope::new(
            events::TASK_CREATED,
            Some(task.id),
            format!("Task created: {}", task.title),
            json!({ "project": task.project, "type": task.task_type }),
        );
        event::insert_tx(&mut tx, &env).await?;
        tx.commit().await?;
        Ok(StatusChange { task, event: env })
    }

    pub async fn get_task(&self, id: i64) -> Result<Task> {
        self.try_get_task(id)
            .await?
            .ok_or_else(|| TaskdError::NotFound(format!("task {id}")))
    }

    pub async fn try_get_task(&self, id: i64) -> Result<Option<Task>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut rows: Vec<Task> = sqlx::query_as(
            "SELECT * FROM tasks ORDER BY pinned DESC, updated_at DESC, id DESC",
        )
        .fetch_all(self.pool())
        .await?;

        if let Some(status) = filter.status {
            rows.retain(|t| t.status() == status);
        } else if !filter.all {
            rows.retain(|t| t.status() != Status::Archived);
        }
        if let Some(ref project) = filter.project {
            rows.retain(|t| &t.project == project);
        }
        if let Some(ref ty) = filter.task_type {
            rows.retain(|t| &t.task_type == ty);
        }
        Ok(rows)
    }

    /// Substring search over title + body, same ordering as `list_tasks`.
    pub async fn search_tasks(&self, query: &str) -> Result<Vec<Task>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        Ok(sqlx::query_as(
            "SELECT * FROM tasks
             WHERE (title LIKE ? ESCAPE '\\' OR body LIKE ? ESCAPE '\\')
               AND status != 'archived'
             ORDER BY pinned DESC, updated_at DESC, id DESC",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn update_fields(&self, id: i64, patch: TaskPatch) -> Result<StatusChange> {
        let changed = patch.changed_fields();
        let old = self.get_task(id).await?;
        if let Some(ref project) = patch.project {
            self.get_project(project).await?;
        }

        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;
        let task: Task = sqlx::query_as(
            "UPDATE tasks SET
               title = COALESCE(?, title),
               body = COALESCE(?, body),
               type = COALESCE(?, type),
               executor = COALESCE(?, executor),
               project = COALESCE(?, project),
               priority = COALESCE(?, priority),
               dangerous_mode = COALESCE(?, dangerous_mode),
               recurrence = COALESCE(?, recurrence),
               scheduled_at = COALESCE(?, scheduled_at),
               summary = COALESCE(?, summary),
               pr_url = COALESCE(?, pr_url),
               pr_number = COALESCE(?, pr_number),
               parent_task_id = COALESCE(?, parent_task_id),
               updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(&patch.title)
        .bind(&patch.body)
        .bind(&patch.task_type)
        .bind(&patch.executor)
        .bind(&patch.project)
        .bind(patch.priority)
        .bind(patch.dangerous_mode)
        .bind(&patch.recurrence)
        .bind(&patch.scheduled_at)
        .bind(&patch.summary)
        .bind(&patch.pr_url)
        .bind(patch.pr_number)
        .bind(patch.parent_task_id)
        .bind(&now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| TaskdError::NotFound(format!("task {id}")))?;

        let env = Envelope::new(
            events::TASK_UPDATED,
            Some(task.id),
            format!("Task updated: {}", task.title),
            json!({ "project": old.project, "changed_fields": changed }),
        );
        event::insert_tx(&mut tx, &env).await?;
        tx.commit().await?;
        Ok(StatusChange { task, event: env })
    }

    /// Delete a task and cascade its logs and attachments. Rejected while
    /// the task is `processing` — interrupt first.
    pub async fn delete_task(&self, id: i64) -> Result<Envelope> {
        let task = self.get_task(id).await?;
        if task.status() == Status::Processing {
            return Err(TaskdError::Conflict(format!(
                "task {id} is processing; interrupt it before deleting"
            )));
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let env = Envelope::new(
            events::TASK_DELETED,
            Some(id),
            format!("Task deleted: {}", task.title),
            json!({ "project": task.project }),
        );
        event::insert_tx(&mut tx, &env).await?;
        tx.commit().await?;
        Ok(env)
    }

    // ─── Status writer ───────────────────────────────────────────────────────

    pub async fn update_status(&self, id: i64, new: Status) -> Result<StatusChange> {
        self.update_status_with(id, new, None, None).await
    }

    /// Status change with an overridden event type (`task.failed`,
    /// `task.interrupted`, `task.retried`) and an optional reason recorded
    /// in the event metadata.
    pub async fn update_status_with(
        &self,
        id: i64,
        new: Status,
        event_type: Option<&str>,
        reason: Option<&str>,
    ) -> Result<StatusChange> {
        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;

        let old: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| TaskdError::NotFound(format!("task {id}")))?;
        check_transition(old.status(), new)?;

        let completed_at = if new.is_terminal() {
            Some(now.clone())
        } else {
            None
        };
        // Terminal entry releases the port and the worktree uniqueness row.
        let task: Task = if new.is_terminal() {
            sqlx::query_as(
                "UPDATE tasks SET status = ?, completed_at = COALESCE(?, completed_at),
                        port = 0, worktree_path = '', updated_at = ?
                 WHERE id = ? RETURNING *",
            )
            .bind(new.as_str())
            .bind(&completed_at)
            .bind(&now)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        } else if new == Status::Processing {
            sqlx::query_as(
                "UPDATE tasks SET status = ?, started_at = COALESCE(started_at, ?),
                        last_run_at = ?, updated_at = ? WHERE id = ? RETURNING *",
            )
            .bind(new.as_str())
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        } else if old.status() == Status::Done && new == Status::Queued {
            // Reopen: completed_at no longer applies.
            sqlx::query_as(
                "UPDATE tasks SET status = ?, completed_at = NULL, started_at = NULL,
                        updated_at = ? WHERE id = ? RETURNING *",
            )
            .bind(new.as_str())
            .bind(&now)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as(
                "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? RETURNING *",
            )
            .bind(new.as_str())
            .bind(&now)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        };

        let mut metadata = json!({
            "old_status": old.status().as_str(),
            "new_status": new.as_str(),
            "project": task.project,
        });
        if let Some(reason) = reason {
            metadata["reason"] = json!(reason);
        }
        let env = Envelope::new(
            event_type.unwrap_or_else(|| event_type_for(new)),
            Some(task.id),
            format!("Status changed: {} → {}", old.status(), new),
            metadata,
        );
        event::insert_tx(&mut tx, &env).await?;
        tx.commit().await?;
        Ok(StatusChange { task, event: env })
    }

    // ─── Dequeue ─────────────────────────────────────────────────────────────

    /// Atomically pick the best `queued` task and flip it to `processing`,
    /// stamping `started_at` in the same statement. Concurrent callers
    /// observe disjoint results — the `status = 'queued'` guard means the
    /// second caller's UPDATE matches nothing.
    pub async fn next_queued(&self) -> Result<Option<StatusChange>> {
        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;

        let task: Option<Task> = sqlx::query_as(
            "UPDATE tasks
             SET status = 'processing', started_at = ?, last_run_at = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'queued'
                   AND (scheduled_at IS NULL OR scheduled_at <= ?)
                 ORDER BY pinned DESC, priority DESC,
                          COALESCE(scheduled_at, created_at) ASC, created_at ASC
                 LIMIT 1
             ) AND status = 'queued'
             RETURNING *",
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(task) = task else {
            tx.commit().await?;
            return Ok(None);
        };

        let env = Envelope::new(
            events::TASK_STARTED,
            Some(task.id),
            "Status changed: queued → processing",
            json!({
                "old_status": "queued",
                "new_status": "processing",
                "project": task.project,
            }),
        );
        event::insert_tx(&mut tx, &env).await?;
        tx.commit().await?;
        Ok(Some(StatusChange { task, event: env }))
    }

    /// Earliest future `scheduled_at` among queued tasks, for the scheduler
    /// wake-up.
    pub async fn next_scheduled_at(&self) -> Result<Option<String>> {
        let now = now_rfc3339();
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT MIN(scheduled_at) FROM tasks
             WHERE status = 'queued' AND scheduled_at > ?",
        )
        .bind(&now)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(v,)| v))
    }

    // ─── Pin ─────────────────────────────────────────────────────────────────

    /// Set the pinned flag. Idempotent: a repeated call with the same value
    /// changes nothing and emits no event.
    pub async fn pin_task(&self, id: i64, on: bool) -> Result<Option<StatusChange>> {
        let task = self.get_task(id).await?;
        if task.pinned == on {
            return Ok(None);
        }

        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;
        let task: Task = sqlx::query_as(
            "UPDATE tasks SET pinned = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(on)
        .bind(&now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let env = Envelope::new(
            if on { events::TASK_PINNED } else { events::TASK_UNPINNED },
            Some(task.id),
            format!("Task {}: {}", if on { "pinned" } else { "unpinned" }, task.title),
            json!({ "project": task.project }),
        );
        event::insert_tx(&mut tx, &env).await?;
        tx.commit().await?;
        Ok(Some(StatusChange { task, event: env }))
    }

    // ─── Single-field updates used by the executor ───────────────────────────

    /// Record the worktree path and branch once provisioning succeeds.
    /// A duplicate path surfaces as `Conflict` via the unique index.
    pub async fn set_worktree(&self, id: i64, path: &str, branch: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET worktree_path = ?, branch_name = ?, updated_at = ? WHERE id = ?",
        )
        .bind(path)
        .bind(branch)
        .bind(now_rfc3339())
        .bind(id)
        .execute(self.pool())
        .await;
        match result {
            Ok(r) if r.rows_affected() == 0 => {
                Err(TaskdError::NotFound(format!("task {id}")))
            }
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(TaskdError::Conflict(format!(
                "worktree path already in use: {path}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Write back the agent's session id. Single-field update; no status
    /// change, no event.
    pub async fn set_agent_session(&self, id: i64, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET agent_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(session_id)
            .bind(now_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_feedback(&self, id: i64, feedback: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET feedback = ?, updated_at = ? WHERE id = ?")
            .bind(feedback)
            .bind(now_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Reschedule a recurring task after a run. Clears nothing else.
    pub async fn set_scheduled_at(&self, id: i64, scheduled_at: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE tasks SET scheduled_at = ?, updated_at = ? WHERE id = ?")
            .bind(scheduled_at)
            .bind(now_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// `done` tasks whose updated_at is older than the cutoff — candidates
    /// for the auto-archive sweeper.
    pub async fn done_tasks_untouched_since(&self, cutoff: &str) -> Result<Vec<Task>> {
        Ok(sqlx::query_as(
            "SELECT * FROM tasks WHERE status = 'done' AND updated_at < ?",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            body: "do the thing".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_fields_verbatim() {
        let (_dir, store) = test_store().await;
        let created = store.create_task(new_task("A")).await.unwrap().task;
        let got = store.get_task(created.id).await.unwrap();
        assert_eq!(got.title, "A");
        assert_eq!(got.body, "do the thing");
        assert_eq!(got.status(), Status::Backlog);
        assert_eq!(got.executor, "claude");
        assert_eq!(got.project, "personal");
        assert_eq!(got.port, 0);
        assert!(got.completed_at.is_none());
    }

    #[tokio::test]
    async fn empty_title_rejected() {
        let (_dir, store) = test_store().await;
        assert!(store.create_task(new_task("  ")).await.is_err());
    }

    #[tokio::test]
    async fn unknown_project_rejected() {
        let (_dir, store) = test_store().await;
        let result = store
            .create_task(NewTask {
                title: "x".into(),
                project: Some("nope".into()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(TaskdError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_self_loop_rejected() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        store.update_status(id, Status::Queued).await.unwrap();
        let err = store.update_status(id, Status::Queued).await.unwrap_err();
        assert!(matches!(err, TaskdError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn terminal_entry_releases_port_and_worktree() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        store.update_status(id, Status::Queued).await.unwrap();
        store.next_queued().await.unwrap().unwrap();
        store.set_worktree(id, "/tmp/wt/task-1", "task/1-a").await.unwrap();
        store.allocate_port(id).await.unwrap();

        let change = store.update_status(id, Status::Done).await.unwrap();
        assert_eq!(change.task.port, 0);
        assert_eq!(change.task.worktree_path, "");
        assert!(change.task.completed_at.is_some());
        assert_eq!(change.event.event_type, "task.completed");
    }

    #[tokio::test]
    async fn reopen_resets_completed_at() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        store.update_status(id, Status::Queued).await.unwrap();
        store.next_queued().await.unwrap().unwrap();
        store.update_status(id, Status::Done).await.unwrap();

        let change = store.update_status(id, Status::Queued).await.unwrap();
        assert!(change.task.completed_at.is_none());
        assert!(change.task.started_at.is_none());
    }

    #[tokio::test]
    async fn dequeue_orders_pinned_then_priority_then_age() {
        let (_dir, store) = test_store().await;
        let plain = store.create_task(new_task("plain")).await.unwrap().task.id;
        let urgent = store
            .create_task(NewTask {
                title: "urgent".into(),
                priority: 5,
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        let pinned = store
            .create_task(NewTask {
                title: "pinned".into(),
                pinned: true,
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        for id in [plain, urgent, pinned] {
            store.update_status(id, Status::Queued).await.unwrap();
        }

        let order: Vec<i64> = [
            store.next_queued().await.unwrap().unwrap().task.id,
            store.next_queued().await.unwrap().unwrap().task.id,
            store.next_queued().await.unwrap().unwrap().task.id,
        ]
        .into();
        assert_eq!(order, vec![pinned, urgent, plain]);
        assert!(store.next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_skips_future_scheduled() {
        let (_dir, store) = test_store().await;
        let future = (chrono::Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let id = store
            .create_task(NewTask {
                title: "later".into(),
                scheduled_at: Some(future.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        store.update_status(id, Status::Queued).await.unwrap();

        assert!(store.next_queued().await.unwrap().is_none());
        assert_eq!(store.next_scheduled_at().await.unwrap(), Some(future));
    }

    #[tokio::test]
    async fn dequeue_stamps_started_at() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        store.update_status(id, Status::Queued).await.unwrap();
        let change = store.next_queued().await.unwrap().unwrap();
        assert_eq!(change.task.status(), Status::Processing);
        assert!(change.task.started_at.is_some());
        assert_eq!(change.event.event_type, "task.started");
    }

    #[tokio::test]
    async fn concurrent_dequeue_is_disjoint() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("only")).await.unwrap().task.id;
        store.update_status(id, Status::Queued).await.unwrap();

        let (a, b) = tokio::join!(store.next_queued(), store.next_queued());
        let winners = [a.unwrap(), b.unwrap()];
        let taken: Vec<_> = winners.iter().flatten().collect();
        assert_eq!(taken.len(), 1, "exactly one caller must win the dequeue");
        assert_eq!(taken[0].task.id, id);
    }

    #[tokio::test]
    async fn pin_twice_emits_once() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        assert!(store.pin_task(id, true).await.unwrap().is_some());
        assert!(store.pin_task(id, true).await.unwrap().is_none());
        assert!(store.pin_task(id, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_cascades_and_then_not_found() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        store
            .append_log(id, crate::store::LineType::System, "hello")
            .await
            .unwrap();
        store.delete_task(id).await.unwrap();
        assert!(matches!(
            store.get_task(id).await,
            Err(TaskdError::NotFound(_))
        ));
        assert!(store
            .list_tasks(&TaskFilter::default())
            .await
            .unwrap()
            .iter()
            .all(|t| t.id != id));
        let logs = store.recent_logs(id, 10).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn delete_processing_rejected() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        store.update_status(id, Status::Queued).await.unwrap();
        store.next_queued().await.unwrap();
        assert!(matches!(
            store.delete_task(id).await,
            Err(TaskdError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn worktree_path_uniqueness() {
        let (_dir, store) = test_store().await;
        let a = store.create_task(new_task("A")).await.unwrap().task.id;
        let b = store.create_task(new_task("B")).await.unwrap().task.id;
        store.set_worktree(a, "/tmp/wt/x", "task/a").await.unwrap();
        let err = store.set_worktree(b, "/tmp/wt/x", "task/b").await.unwrap_err();
        assert!(matches!(err, TaskdError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_fields_reports_changes() {
        let (_dir, store) = test_store().await;
        let id = store.create_task(new_task("A")).await.unwrap().task.id;
        let change = store
            .update_fields(
                id,
                TaskPatch {
                    title: Some("B".into()),
                    priority: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(change.task.title, "B");
        assert_eq!(change.task.priority, 3);
        let fields = change.event.metadata["changed_fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
    }

    #[tokio::test]
    async fn search_matches_title_and_body() {
        let (_dir, store) = test_store().await;
        store.create_task(new_task("fix the parser")).await.unwrap();
        store
            .create_task(NewTask {
                title: "other".into(),
                body: "parser rewrite notes".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.create_task(new_task("unrelated")).await.unwrap();

        let hits = store.search_tasks("parser").await.unwrap();
        assert_eq!(hits.len(), 2);
    }
}
