//! Append-only per-task log lines. Logs are authoritative: the adapter
//! blocks on the append rather than dropping a line.

use serde::{Deserialize, Serialize};

use super::{now_rfc3339, Store};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    System,
    Text,
    Tool,
    Error,
    Output,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::System => "system",
            LineType::Text => "text",
            LineType::Tool => "tool",
            LineType::Error => "error",
            LineType::Output => "output",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct LogLine {
    pub id: i64,
    pub task_id: i64,
    pub line_type: String,
    pub content: String,
    pub created_at: String,
}

impl Store {
    pub async fn append_log(
        &self,
        task_id: i64,
        line_type: LineType,
        content: &str,
    ) -> Result<LogLine> {
        Ok(sqlx::query_as(
            "INSERT INTO task_logs (task_id, line_type, content, created_at)
             VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(task_id)
        .bind(line_type.as_str())
        .bind(content)
        .bind(now_rfc3339())
        .fetch_one(self.pool())
        .await?)
    }

    /// Last `n` log lines for a task, oldest first.
    pub async fn recent_logs(&self, task_id: i64, n: i64) -> Result<Vec<LogLine>> {
        let mut rows: Vec<LogLine> = sqlx::query_as(
            "SELECT * FROM task_logs WHERE task_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(n)
        .fetch_all(self.pool())
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// All log lines with id ≥ `from_seq`, in insertion order. The tail
    /// anchor for `tail_logs`.
    pub async fn logs_since(&self, task_id: i64, from_seq: i64) -> Result<Vec<LogLine>> {
        Ok(sqlx::query_as(
            "SELECT * FROM task_logs WHERE task_id = ? AND id >= ? ORDER BY id ASC",
        )
        .bind(task_id)
        .bind(from_seq)
        .fetch_all(self.pool())
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_store, NewTask};

    #[tokio::test]
    async fn log_ids_strictly_increase() {
        let (_dir, store) = test_store().await;
        let id = store
            .create_task(NewTask {
                title: "t".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;

        for i in 0..5 {
            store
                .append_log(id, LineType::Text, &format!("line {i}"))
                .await
                .unwrap();
        }
        let logs = store.recent_logs(id, 100).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert!(logs.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(logs[0].content, "line 0");
    }

    #[tokio::test]
    async fn logs_since_is_inclusive() {
        let (_dir, store) = test_store().await;
        let id = store
            .create_task(NewTask {
                title: "t".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                store
                    .append_log(id, LineType::Output, &format!("l{i}"))
                    .await
                    .unwrap()
                    .id,
            );
        }
        let tail = store.logs_since(id, ids[1]).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, ids[1]);
    }

    #[tokio::test]
    async fn recent_logs_caps_at_n() {
        let (_dir, store) = test_store().await;
        let id = store
            .create_task(NewTask {
                title: "t".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        for i in 0..10 {
            store
                .append_log(id, LineType::Text, &format!("{i}"))
                .await
                .unwrap();
        }
        let logs = store.recent_logs(id, 3).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[2].content, "9");
    }
}
