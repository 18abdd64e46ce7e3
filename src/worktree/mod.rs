//! Per-task git worktree provisioning.
//!
//! Every task gets its own worktree at
//! `{data_dir}/worktrees/{project}/task-{id}/`, branched as
//! `task/{id}-{slug}` off the project repository's HEAD. libgit2 calls run
//! inside `spawn_blocking`. Worktree directories are retained after
//! terminal transitions; only the store's uniqueness rows are released.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, TaskdError};
use crate::store::{Project, Task};

/// Cap on init-script runtime.
pub const INIT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

const SLUG_MAX: usize = 50;

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeProvisioner {
    base: PathBuf,
}

impl WorktreeProvisioner {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            base: data_dir.join("worktrees"),
        }
    }

    pub fn path_for(&self, project: &str, task_id: i64) -> PathBuf {
        self.base.join(project).join(format!("task-{task_id}"))
    }

    /// Create the worktree + branch for a task. Idempotent on the branch
    /// (an existing `task/{id}-…` branch is reused); a pre-existing
    /// directory from an earlier attempt is reattached as-is.
    pub async fn provision(&self, task: &Task, project: &Project) -> Result<WorktreeInfo> {
        if project.path.is_empty() {
            return Err(TaskdError::WorktreeFailure(format!(
                "project {} has no repository path configured",
                project.name
            )));
        }

        let branch = format!("task/{}-{}", task.id, kebab(&task.title));
        let wt_path = self.path_for(&project.name, task.id);

        if let Some(parent) = wt_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create worktree base directory")?;
        }

        if wt_path.join(".git").exists() {
            debug!(task = task.id, path = %wt_path.display(), "worktree already provisioned");
            return Ok(WorktreeInfo {
                path: wt_path,
                branch,
            });
        }

        let repo_path = PathBuf::from(&project.path);
        let branch_name = branch.clone();
        let target = wt_path.clone();
        tokio::task::spawn_blocking(move || {
            create_worktree_blocking(&repo_path, &branch_name, &target)
        })
        .await
        .map_err(|e| TaskdError::WorktreeFailure(format!("worktree task panicked: {e}")))?
        .map_err(|e| TaskdError::WorktreeFailure(e.to_string()))?;

        self.copy_agent_config(Path::new(&project.path), &wt_path)
            .await;

        info!(task = task.id, branch = %branch, path = %wt_path.display(), "worktree created");
        Ok(WorktreeInfo {
            path: wt_path,
            branch,
        })
    }

    /// Copy the project's agent config directory (`.claude/`) into the
    /// fresh worktree so the agent sees project-local settings. Best
    /// effort — a missing or unreadable config is not an error.
    async fn copy_agent_config(&self, repo: &Path, worktree: &Path) {
        let src = repo.join(".claude");
        if !src.is_dir() {
            return;
        }
        let dst = worktree.join(".claude");
        let worktree_display = worktree.display().to_string();
        let result = tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst)).await;
        match result {
            Ok(Ok(())) => debug!(worktree = %worktree_display, "agent config copied"),
            Ok(Err(e)) => warn!(err = %e, "agent config copy failed"),
            Err(e) => warn!(err = %e, "agent config copy panicked"),
        }
    }

    /// Run the project's init script inside the worktree. Non-zero exit or
    /// timeout surfaces as `InitScriptFailure` — the caller emits an event
    /// and proceeds; the task is never failed over this.
    pub async fn run_init_script(
        &self,
        project: &Project,
        task: &Task,
        info: &WorktreeInfo,
    ) -> Result<()> {
        if project.init_script.trim().is_empty() {
            return Ok(());
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&project.init_script)
            .current_dir(&info.path)
            .env("TASK_ID", task.id.to_string())
            .env("TASK_PORT", task.port.to_string())
            .env("TASK_BRANCH", &info.branch)
            .env("TASK_WORKTREE", &info.path)
            .env("TASK_MAIN_WORKTREE", &project.path)
            .env("TASK_REPO", &project.path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskdError::InitScriptFailure(format!("spawn failed: {e}")))?;

        match tokio::time::timeout(INIT_SCRIPT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(TaskdError::InitScriptFailure(format!(
                "init script exited with {}",
                status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string())
            ))),
            Ok(Err(e)) => Err(TaskdError::InitScriptFailure(format!("wait failed: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                Err(TaskdError::InitScriptFailure(format!(
                    "init script timed out after {}s",
                    INIT_SCRIPT_TIMEOUT.as_secs()
                )))
            }
        }
    }
}

/// `task/{id}-{slug}` slug: lowercase alphanumerics with single dashes,
/// capped at 50 chars.
pub fn kebab(title: &str) -> String {
    let mut slug = String::new();
    let mut dash_pending = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if dash_pending && !slug.is_empty() {
                slug.push('-');
            }
            dash_pending = false;
            for lower in c.to_lowercase() {
                slug.push(lower);
            }
        } else {
            dash_pending = true;
        }
        if slug.len() >= SLUG_MAX {
            break;
        }
    }
    while slug.len() > SLUG_MAX || slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("task");
    }
    slug
}

// ── Blocking git2 helpers ────────────────────────────────────────────────────

fn create_worktree_blocking(
    repo_path: &Path,
    branch_name: &str,
    wt_path: &Path,
) -> anyhow::Result<()> {
    let repo = git2::Repository::open(repo_path)
        .with_context(|| format!("{} is not a git repository", repo_path.display()))?;
    let tip = task_branch_tip(&repo, branch_name)?;

    // libgit2 forbids '/' in worktree names. The directory name
    // (`task-<id>`) is already unique within the repository, so it doubles
    // as the registration name.
    let registration = wt_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("worktree path has no directory name")?;

    let mut add = git2::WorktreeAddOptions::new();
    add.reference(Some(&tip));
    repo.worktree(registration, wt_path, Some(&add))
        .with_context(|| format!("checkout of {branch_name} at {} failed", wt_path.display()))?;
    Ok(())
}

/// Resolve the task branch to check out: a leftover branch from an earlier
/// run of the same task wins, otherwise a fresh one is cut from the tip of
/// the default branch.
fn task_branch_tip<'r>(
    repo: &'r git2::Repository,
    branch_name: &str,
) -> anyhow::Result<git2::Reference<'r>> {
    if let Ok(leftover) = repo.find_branch(branch_name, git2::BranchType::Local) {
        debug!(task_branch = branch_name, "found branch from a previous run");
        return Ok(leftover.into_reference());
    }

    let base = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .context("default branch has no commit to cut a task branch from")?;
    match repo.branch(branch_name, &base, false) {
        Ok(fresh) => Ok(fresh.into_reference()),
        Err(e) => bail!("could not cut branch {branch_name}: {e}"),
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_lowercases_and_dashes() {
        assert_eq!(kebab("Fix the Parser!"), "fix-the-parser");
        assert_eq!(kebab("  weird   spacing  "), "weird-spacing");
        assert_eq!(kebab("___"), "task");
    }

    #[test]
    fn kebab_caps_length() {
        let long = "x".repeat(200);
        assert!(kebab(&long).len() <= SLUG_MAX);
    }

    #[test]
    fn kebab_never_ends_with_dash() {
        let title = format!("{} b", "a".repeat(49));
        let slug = kebab(&title);
        assert!(!slug.ends_with('-'), "slug was {slug:?}");
    }

    proptest::proptest! {
        #[test]
        fn kebab_is_always_a_valid_ref_component(title in ".*") {
            let slug = kebab(&title);
            proptest::prop_assert!(!slug.is_empty());
            proptest::prop_assert!(slug.len() <= SLUG_MAX);
            proptest::prop_assert!(!slug.starts_with('-'));
            proptest::prop_assert!(!slug.ends_with('-'));
            proptest::prop_assert!(!slug.contains("--"));
        }
    }
}
