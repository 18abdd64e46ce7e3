//! Embedded relational store — the single source of truth for tasks, logs,
//! projects, memories, settings, and the event audit table.
//!
//! One `SqlitePool` in WAL mode; every multi-row mutation runs inside a
//! single transaction. Status changes go through [`Store::update_status`]
//! only, which validates against the state machine in [`status`] and writes
//! the matching audit event in the same transaction.

pub mod event;
pub mod log;
pub mod port;
pub mod project;
pub mod status;
pub mod task;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::error::Result;

pub use log::{LineType, LogLine};
pub use project::{Memory, MemoryCategory, Project, TaskType};
pub use status::Status;
pub use task::{NewTask, StatusChange, Task, TaskFilter, TaskPatch};

/// RFC3339 timestamp for row columns.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) `{data_dir}/tasks.db` and run migrations.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .context("failed to create data directory")?;
        Self::open_at(&data_dir.join("tasks.db")).await
    }

    /// Open a store at an explicit database path. Used by tests.
    pub async fn open_at(db_path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}?mode=rwc",
            db_path.display()
        ))
        .context("invalid sqlite path")?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5))
        .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .context("failed to open sqlite store")?;
        Self::migrate(&pool).await?;
        let store = Self { pool };
        store.seed().await?;
        Ok(store)
    }

    /// Return the underlying pool (cheap — Arc-backed).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Settings ────────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Webhook URLs from the `event_webhooks` setting (JSON list).
    pub async fn event_webhooks(&self) -> Result<Vec<String>> {
        match self.get_setting("event_webhooks").await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).await.unwrap();
    (dir, store)
}
