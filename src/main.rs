//! taskd — personal task-queue daemon driving AI coding agents.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskd::config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "taskd", version, about = "Personal task-queue daemon for AI coding agents")]
struct Cli {
    /// Data directory (database, worktrees, hooks, logs).
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Root directory project paths are resolved against.
    #[arg(long, env = "PROJECTS_DIR")]
    projects_dir: Option<PathBuf>,

    /// Default executor slug for tasks that do not name one.
    #[arg(long, env = "TASK_EXECUTOR")]
    executor: Option<String>,

    /// Worker-pool size — how many agents may run concurrently.
    #[arg(long, env = "MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Seconds of agent silence before idle suspension.
    #[arg(long, env = "IDLE_SUSPEND_TIMEOUT")]
    idle_suspend_timeout: Option<u64>,

    /// Log filter, e.g. "info" or "debug,sqlx=warn".
    #[arg(long)]
    log: Option<String>,
}

fn init_tracing(config: &DaemonConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender =
        tracing_appender::rolling::daily(config.data_dir.join("logs"), "taskd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_new(&config.log)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().json().with_writer(file_writer))
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::new(
        cli.data_dir,
        cli.projects_dir,
        cli.executor,
        cli.max_workers,
        cli.idle_suspend_timeout,
        cli.log,
    );

    std::fs::create_dir_all(config.data_dir.join("logs"))?;
    let _log_guard = init_tracing(&config);
    info!(data_dir = %config.data_dir.display(), workers = config.max_workers, "taskd starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = taskd::build_context(config, shutdown_rx).await?;

    let executor = tokio::spawn(ctx.executor.clone().run());

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // The executor drains its workers within its own grace period; give it
    // a little headroom before abandoning the wait.
    let drain = tokio::time::timeout(std::time::Duration::from_secs(15), executor).await;
    if drain.is_err() {
        tracing::warn!("executor did not stop in time — abandoning");
    }

    ctx.store.close().await;
    info!("taskd stopped");
    Ok(())
}
