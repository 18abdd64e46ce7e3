//! Task port allocation.
//!
//! Ports come from a fixed range (3000..=3999). Allocation scans for the
//! lowest port not held by a non-terminal task; the partial unique index on
//! `tasks.port` backstops races between concurrent allocators.

use super::{now_rfc3339, Store};
use crate::error::{Result, TaskdError};

pub const PORT_RANGE_START: i64 = 3000;
pub const PORT_RANGE_END: i64 = 3999;

impl Store {
    /// Allocate the lowest free port in the range to `task_id`. Returns the
    /// port. `Conflict` when the range is exhausted.
    pub async fn allocate_port(&self, task_id: i64) -> Result<i64> {
        let mut tx = self.pool().begin().await?;

        let held: Vec<(i64,)> = sqlx::query_as(
            "SELECT port FROM tasks
             WHERE port != 0 AND status NOT IN ('done','archived')",
        )
        .fetch_all(&mut *tx)
        .await?;
        let held: std::collections::HashSet<i64> = held.into_iter().map(|(p,)| p).collect();

        let Some(port) = (PORT_RANGE_START..=PORT_RANGE_END).find(|p| !held.contains(p)) else {
            return Err(TaskdError::Conflict(format!(
                "port range {PORT_RANGE_START}..{PORT_RANGE_END} exhausted"
            )));
        };

        let updated = sqlx::query("UPDATE tasks SET port = ?, updated_at = ? WHERE id = ?")
            .bind(port)
            .bind(now_rfc3339())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(TaskdError::NotFound(format!("task {task_id}")));
        }
        tx.commit().await?;
        Ok(port)
    }

    pub async fn release_port(&self, task_id: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET port = 0, updated_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_store, NewTask, Status};

    async fn make(store: &crate::store::Store, title: &str) -> i64 {
        store
            .create_task(NewTask {
                title: title.into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id
    }

    #[tokio::test]
    async fn allocates_lowest_free() {
        let (_dir, store) = test_store().await;
        let a = make(&store, "a").await;
        let b = make(&store, "b").await;
        assert_eq!(store.allocate_port(a).await.unwrap(), 3000);
        assert_eq!(store.allocate_port(b).await.unwrap(), 3001);
    }

    #[tokio::test]
    async fn terminal_tasks_do_not_hold_ports() {
        let (_dir, store) = test_store().await;
        let a = make(&store, "a").await;
        store.update_status(a, Status::Queued).await.unwrap();
        store.next_queued().await.unwrap();
        store.allocate_port(a).await.unwrap();
        // Terminal entry zeroes the port column, freeing 3000.
        store.update_status(a, Status::Done).await.unwrap();

        let b = make(&store, "b").await;
        assert_eq!(store.allocate_port(b).await.unwrap(), 3000);
    }

    #[tokio::test]
    async fn release_then_reallocate() {
        let (_dir, store) = test_store().await;
        let a = make(&store, "a").await;
        let b = make(&store, "b").await;
        store.allocate_port(a).await.unwrap();
        store.release_port(a).await.unwrap();
        assert_eq!(store.allocate_port(b).await.unwrap(), 3000);
    }

    #[tokio::test]
    async fn skips_held_ports() {
        let (_dir, store) = test_store().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(make(&store, &format!("t{i}")).await);
        }
        for (i, id) in ids.iter().enumerate() {
            sqlx::query("UPDATE tasks SET port = ? WHERE id = ?")
                .bind(PORT_RANGE_START + i as i64)
                .bind(id)
                .execute(store.pool())
                .await
                .unwrap();
        }
        let extra = make(&store, "extra").await;
        assert_eq!(store.allocate_port(extra).await.unwrap(), 3003);
    }
}
