//! `VcsCoordinator` over the `git` CLI.
//!
//! Per-worker mode gives every worker a `tdd/<worker-id>` branch checked out
//! in its own worktree under `worktrees_dir`, so workers never share a
//! working tree, index or HEAD. A finished task is merged into the main
//! branch in the primary checkout; a failed one is reset back to the main
//! branch inside the worker's worktree only.
//!
//! Single-branch mode keeps every worker in the primary checkout on the main
//! branch. Anything that writes to the primary checkout (single-mode commits
//! and rollbacks, worktree registration, merges) goes through one async mutex.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tdd_orchestrator_sdk::{async_trait, VcsCoordinator};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::process::{run_command, CommandOutput};
use crate::config::{BranchMode, GitConfig};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const GIT_OUTPUT_LIMIT: usize = 64 * 1024;

pub struct GitCoordinator {
    repo_dir: PathBuf,
    worktrees_dir: PathBuf,
    config: GitConfig,
    main_lock: Mutex<()>,
}

/// `<repo>.worktrees` beside the repository.
fn default_worktrees_dir(repo_dir: &Path) -> PathBuf {
    let repo = std::fs::canonicalize(repo_dir).unwrap_or_else(|_| repo_dir.to_path_buf());
    let name = repo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    repo.with_file_name(format!("{name}.worktrees"))
}

impl GitCoordinator {
    pub fn new(repo_dir: impl Into<PathBuf>, config: GitConfig) -> Self {
        let repo_dir = repo_dir.into();
        let worktrees_dir = config
            .worktrees_dir
            .clone()
            .unwrap_or_else(|| default_worktrees_dir(&repo_dir));
        Self {
            repo_dir,
            worktrees_dir,
            config,
            main_lock: Mutex::new(()),
        }
    }

    pub fn branch_for(&self, worker_id: &str) -> String {
        match self.config.branch_mode {
            BranchMode::PerWorker => format!("tdd/{worker_id}"),
            BranchMode::Single => self.config.main_branch.clone(),
        }
    }

    /// Where the worker's files live.
    pub fn checkout_dir(&self, worker_id: &str) -> PathBuf {
        match self.config.branch_mode {
            BranchMode::PerWorker => self.worktrees_dir.join(worker_id),
            BranchMode::Single => self.repo_dir.clone(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        run_command(&argv, Some(dir), GIT_TIMEOUT, GIT_OUTPUT_LIMIT).await
    }

    async fn git_checked(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.git(dir, args).await?;
        if !output.success {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            ));
        }
        Ok(output.stdout)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = self
            .git(&self.repo_dir, &["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(output.success)
    }

    async fn has_staged_changes(&self, dir: &Path) -> Result<bool> {
        let out = self.git_checked(dir, &["diff", "--cached", "--name-only"]).await?;
        Ok(!out.trim().is_empty())
    }

    /// Register the worker's worktree unless it is already checked out.
    async fn ensure_worktree(&self, branch: &str, dir: &Path) -> Result<()> {
        let _guard = self.main_lock.lock().await;
        self.git_checked(&self.repo_dir, &["worktree", "prune"]).await?;
        if dir.join(".git").exists() {
            debug!(worktree = %dir.display(), "reusing worktree");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.worktrees_dir).await?;
        let path = dir.to_string_lossy();
        if self.branch_exists(branch).await? {
            self.git_checked(&self.repo_dir, &["worktree", "add", &path, branch]).await?;
        } else {
            self.git_checked(
                &self.repo_dir,
                &["worktree", "add", "-b", branch, &path, &self.config.main_branch],
            )
            .await?;
        }
        info!(worktree = %dir.display(), branch, "worktree created");
        Ok(())
    }

    /// Drop everything in `dir` that is not on the main branch.
    async fn reset_to_main(&self, dir: &Path) -> Result<()> {
        self.git_checked(dir, &["reset", "--hard", &self.config.main_branch]).await?;
        self.git_checked(dir, &["clean", "-fd"]).await?;
        Ok(())
    }
}

#[async_trait]
impl VcsCoordinator for GitCoordinator {
    #[instrument(skip(self))]
    async fn create_worker_branch(&self, worker_id: &str) -> Result<String> {
        let branch = self.branch_for(worker_id);
        if self.config.branch_mode == BranchMode::Single {
            return Ok(branch);
        }
        let dir = self.checkout_dir(worker_id);
        self.ensure_worktree(&branch, &dir).await?;
        // every task starts from the latest main, including peers' merges
        self.reset_to_main(&dir).await?;
        debug!(branch = %branch, "worker branch ready");
        Ok(branch)
    }

    #[instrument(skip(self, message))]
    async fn commit_changes(&self, worker_id: &str, message: &str) -> Result<Option<String>> {
        let _guard = match self.config.branch_mode {
            BranchMode::Single => Some(self.main_lock.lock().await),
            BranchMode::PerWorker => None,
        };
        let dir = self.checkout_dir(worker_id);
        self.git_checked(&dir, &["add", "-A"]).await?;
        if !self.has_staged_changes(&dir).await? {
            debug!("no staged changes, skipping commit");
            return Ok(None);
        }
        self.git_checked(&dir, &["commit", "-m", message]).await?;
        let sha = self
            .git_checked(&dir, &["rev-parse", "--short", "HEAD"])
            .await?
            .trim()
            .to_string();
        info!(sha = %sha, "committed");
        Ok(Some(sha))
    }

    #[instrument(skip(self))]
    async fn rollback_to_main(&self, worker_id: &str) -> Result<()> {
        match self.config.branch_mode {
            BranchMode::PerWorker => self.reset_to_main(&self.checkout_dir(worker_id)).await,
            BranchMode::Single => {
                let _guard = self.main_lock.lock().await;
                self.git_checked(&self.repo_dir, &["reset", "--hard", "HEAD"]).await?;
                self.git_checked(&self.repo_dir, &["clean", "-fd"]).await?;
                Ok(())
            }
        }
    }

    async fn has_uncommitted_changes(&self, worker_id: &str) -> Result<bool> {
        let out = self
            .git_checked(&self.checkout_dir(worker_id), &["status", "--porcelain"])
            .await?;
        Ok(!out.trim().is_empty())
    }

    fn workspace_dir(&self, worker_id: &str) -> Option<PathBuf> {
        match self.config.branch_mode {
            BranchMode::PerWorker => Some(self.checkout_dir(worker_id)),
            BranchMode::Single => None,
        }
    }

    #[instrument(skip(self))]
    async fn integrate(&self, worker_id: &str) -> Result<()> {
        if self.config.branch_mode == BranchMode::Single {
            return Ok(());
        }
        let branch = self.branch_for(worker_id);
        let main = &self.config.main_branch;
        let _guard = self.main_lock.lock().await;

        let head = self
            .git_checked(&self.repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if head.trim() != main.as_str() {
            return Err(anyhow!(
                "{} has '{}' checked out, expected '{main}'",
                self.repo_dir.display(),
                head.trim()
            ));
        }

        let message = format!("merge {branch}");
        let output = self
            .git(&self.repo_dir, &["merge", "--no-ff", "-m", &message, &branch])
            .await?;
        if !output.success {
            if let Err(e) = self.git_checked(&self.repo_dir, &["merge", "--abort"]).await {
                warn!("could not abort merge of {branch}: {e:#}");
            }
            return Err(anyhow!(
                "merging {branch} into {main} failed: {}",
                output.combined().trim()
            ));
        }
        info!(branch = %branch, "merged into {main}");
        Ok(())
    }
}
