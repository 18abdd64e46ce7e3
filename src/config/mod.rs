use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::executor::DEFAULT_IDLE_SUSPEND_TIMEOUT;

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_EXECUTOR: &str = "claude";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Default projects root.
    projects_dir: Option<PathBuf>,
    /// Default executor slug for new tasks (default: "claude").
    executor: Option<String>,
    /// Worker-pool size; how many agents may run at once (default: 4).
    max_workers: Option<usize>,
    /// Seconds of agent silence before the idle sweeper suspends the
    /// process (default: 21600 = 6 h).
    idle_suspend_timeout: Option<u64>,
    /// Log level filter string, e.g. "debug", "info,taskd=trace".
    log: Option<String>,
    /// Fire script hooks for high-frequency agent.item.* events.
    hook_item_events: Option<bool>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

/// Explicit configuration passed at daemon construction — no process-wide
/// singletons beyond the log sinks.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub default_executor: String,
    pub max_workers: usize,
    pub idle_suspend_timeout: Duration,
    pub log: String,
    pub hook_item_events: bool,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        data_dir: Option<PathBuf>,
        projects_dir: Option<PathBuf>,
        executor: Option<String>,
        max_workers: Option<usize>,
        idle_suspend_timeout_secs: Option<u64>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let projects_dir = projects_dir
            .or(toml.projects_dir)
            .unwrap_or_else(default_projects_dir);
        let default_executor = executor
            .or(toml.executor)
            .unwrap_or_else(|| DEFAULT_EXECUTOR.to_string());
        let max_workers = max_workers
            .or(toml.max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS)
            .max(1);
        let idle_suspend_timeout = idle_suspend_timeout_secs
            .or(toml.idle_suspend_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE_SUSPEND_TIMEOUT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let hook_item_events = toml.hook_item_events.unwrap_or(false);

        Self {
            data_dir,
            projects_dir,
            default_executor,
            max_workers,
            idle_suspend_timeout,
            log,
            hook_item_events,
        }
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.data_dir.join("hooks")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("taskd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("taskd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("taskd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("taskd");
        }
    }
    PathBuf::from(".taskd")
}

fn default_projects_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join("projects");
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::new(
            Some(dir.path().to_path_buf()),
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(cfg.default_executor, "claude");
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.idle_suspend_timeout, DEFAULT_IDLE_SUSPEND_TIMEOUT);
        assert!(!cfg.hook_item_events);
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "executor = \"codex\"\nmax_workers = 8\nidle_suspend_timeout = 60\n",
        )
        .unwrap();

        let cfg = DaemonConfig::new(
            Some(dir.path().to_path_buf()),
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(cfg.default_executor, "codex");
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.idle_suspend_timeout, Duration::from_secs(60));

        let cfg = DaemonConfig::new(
            Some(dir.path().to_path_buf()),
            None,
            Some("mock".to_string()),
            Some(2),
            None,
            None,
        );
        assert_eq!(cfg.default_executor, "mock");
        assert_eq!(cfg.max_workers, 2);
    }

    #[test]
    fn zero_workers_clamped_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::new(
            Some(dir.path().to_path_buf()),
            None,
            None,
            Some(0),
            None,
            None,
        );
        assert_eq!(cfg.max_workers, 1);
    }
}
