//! Shared harness for integration tests: a full daemon wired to the mock
//! adapter in a scratch data directory.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use taskd::config::DaemonConfig;
use taskd::store::{Status, Task};
use taskd::AppContext;

pub struct TestDaemon {
    pub ctx: AppContext,
    pub shutdown: watch::Sender<bool>,
    executor: Option<tokio::task::JoinHandle<()>>,
    _dir: TempDir,
}

impl TestDaemon {
    /// Build a daemon with the given data dir contents intact and start
    /// its executor loop.
    pub async fn start() -> Self {
        let dir = TempDir::new().expect("tempdir");
        Self::start_in(dir).await
    }

    pub async fn start_in(dir: TempDir) -> Self {
        let config = DaemonConfig::new(
            Some(dir.path().join("data")),
            None,
            Some("mock".to_string()),
            Some(4),
            None,
            Some("warn".to_string()),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = taskd::build_context(config, shutdown_rx)
            .await
            .expect("build context");
        let executor = tokio::spawn(ctx.executor.clone().run());
        Self {
            ctx,
            shutdown,
            executor: Some(executor),
            _dir: dir,
        }
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.executor.take() {
            let _ = tokio::time::timeout(Duration::from_secs(15), handle).await;
        }
    }
}

/// Poll until the task reaches `status` or the timeout expires.
pub async fn wait_for_status(ctx: &AppContext, id: i64, status: Status) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = ctx.store.get_task(id).await.expect("get task");
        if task.status() == status {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {} waiting for {status}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
