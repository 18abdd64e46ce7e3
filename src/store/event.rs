//! Event audit table. Every published envelope has a durable copy here,
//! written on the publisher side inside the transaction that caused it.

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};

use super::Store;
use crate::error::Result;
use crate::events::Envelope;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub event_id: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub event_type: String,
    pub task_id: Option<i64>,
    pub message: String,
    pub metadata: String,
    pub created_at: String,
}

impl EventRecord {
    /// Rebuild the envelope this record was written from. Sequence is
    /// reassigned at replay time; the timestamp is the original.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            task_id: self.task_id,
            message: self.message.clone(),
            metadata: serde_json::from_str(&self.metadata)
                .unwrap_or(serde_json::Value::Null),
            timestamp: self.created_at.clone(),
            sequence: 0,
        }
    }
}

/// Insert an audit row inside an open transaction. Used by every store
/// mutation that produces an event.
pub(crate) async fn insert_tx(
    tx: &mut Transaction<'_, Sqlite>,
    env: &Envelope,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (event_id, type, task_id, message, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&env.event_id)
    .bind(&env.event_type)
    .bind(env.task_id)
    .bind(&env.message)
    .bind(env.metadata.to_string())
    .bind(&env.timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Store {
    /// Record an event that accompanies no row mutation (adapter item
    /// events, worktree notices). Runs in its own transaction.
    pub async fn record_event(&self, env: &Envelope) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        insert_tx(&mut tx, env).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Last `n` audit records in publish order, for post-crash replay.
    pub async fn recent_events(&self, n: i64) -> Result<Vec<EventRecord>> {
        let mut rows: Vec<EventRecord> = sqlx::query_as(
            "SELECT * FROM events ORDER BY id DESC LIMIT ?",
        )
        .bind(n)
        .fetch_all(self.pool())
        .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn events_for_task(&self, task_id: i64) -> Result<Vec<EventRecord>> {
        Ok(sqlx::query_as(
            "SELECT * FROM events WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Prune audit rows older than the cutoff. Returns rows removed.
    pub async fn prune_events_before(&self, cutoff: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
