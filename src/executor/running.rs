//! The in-memory map of live task processes.
//!
//! One entry per `processing` task, inserted and removed only by the
//! owning worker. Other parties (interrupt, input injection, the idle
//! sweeper) interact with an entry exclusively through its cancel channel
//! and the shared activity/suspend flags — nobody but the worker ever
//! holds the process future.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Interrupt,
    Shutdown,
}

pub struct RunningTask {
    pub pid: u32,
    /// Adapter slug that owns the process, for routing kill/suspend.
    pub executor: String,
    pub cancel: mpsc::Sender<CancelReason>,
    pub suspended: bool,
    /// Unix seconds of the last adapter output; shared with the
    /// adapter's output sink.
    pub last_output: Arc<AtomicI64>,
}

#[derive(Default)]
pub struct RunningMap {
    inner: Mutex<HashMap<i64, RunningTask>>,
}

/// Sweeper-facing view of one running entry.
#[derive(Debug, Clone)]
pub struct RunningSnapshot {
    pub task_id: i64,
    pub executor: String,
    pub suspended: bool,
    pub last_output: i64,
}

impl RunningMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, task_id: i64, entry: RunningTask) {
        self.inner.lock().await.insert(task_id, entry);
    }

    pub async fn remove(&self, task_id: i64) {
        self.inner.lock().await.remove(&task_id);
    }

    pub async fn contains(&self, task_id: i64) -> bool {
        self.inner.lock().await.contains_key(&task_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn pid(&self, task_id: i64) -> Option<u32> {
        self.inner.lock().await.get(&task_id).map(|e| e.pid)
    }

    pub async fn set_pid(&self, task_id: i64, pid: u32) {
        if let Some(entry) = self.inner.lock().await.get_mut(&task_id) {
            entry.pid = pid;
        }
    }

    /// Swap in the adapter sink's activity clock so the idle sweeper sees
    /// real output times.
    pub async fn set_activity(&self, task_id: i64, handle: Arc<AtomicI64>) {
        if let Some(entry) = self.inner.lock().await.get_mut(&task_id) {
            entry.last_output = handle;
        }
    }

    pub async fn set_suspended(&self, task_id: i64, suspended: bool) {
        if let Some(entry) = self.inner.lock().await.get_mut(&task_id) {
            entry.suspended = suspended;
        }
    }

    pub async fn is_suspended(&self, task_id: i64) -> bool {
        self.inner
            .lock()
            .await
            .get(&task_id)
            .map(|e| e.suspended)
            .unwrap_or(false)
    }

    /// Ask the owning worker to stop. `false` when no process is running
    /// for the task or the worker already hung up.
    pub async fn request_cancel(&self, task_id: i64, reason: CancelReason) -> bool {
        let tx = self
            .inner
            .lock()
            .await
            .get(&task_id)
            .map(|e| e.cancel.clone());
        match tx {
            Some(tx) => tx.send(reason).await.is_ok(),
            None => false,
        }
    }

    /// Cancel every running task. Used once, at shutdown.
    pub async fn cancel_all(&self, reason: CancelReason) {
        let senders: Vec<_> = self
            .inner
            .lock()
            .await
            .values()
            .map(|e| e.cancel.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(reason).await;
        }
    }

    pub async fn snapshot(&self) -> Vec<RunningSnapshot> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(id, e)| RunningSnapshot {
                task_id: *id,
                executor: e.executor.clone(),
                suspended: e.suspended,
                last_output: e.last_output.load(Ordering::Relaxed),
            })
            .collect()
    }
}
