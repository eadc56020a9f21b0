//! Worktree lifecycle manager.
//!
//! Each bundle gets an isolated working copy (a git worktree) leased for the
//! duration of its pipeline run. The manager enforces the concurrent-lease
//! cap, auto-evicts stale leases, and can sweep orphaned directories left by
//! a crashed run. The lease table is guarded by a single mutex; the lock is
//! never held across subprocess I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::{BranchType, Repository};
use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorktreeConfig;
use crate::errors::FixwrightError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Creating,
    Ready,
    InUse,
    Checking,
    Committing,
    Cleaning,
    Error,
}

/// Exclusive handle on a working copy.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeLease {
    pub id: String,
    pub path: PathBuf,
    pub base_branch: String,
    pub branch: String,
    pub status: LeaseStatus,
    pub issue_ids: Vec<u64>,
    pub acquired_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Leases isolated working copies under `base_dir`, at most `max_concurrent`
/// at a time.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
    prefix: String,
    max_concurrent: usize,
    auto_cleanup_after: Duration,
    leases: Arc<Mutex<HashMap<String, WorktreeLease>>>,
}

impl WorktreeManager {
    /// `repo_root` must be inside a git checkout; the base directory is
    /// created eagerly so acquisition failures surface early.
    pub fn new(repo_root: impl Into<PathBuf>, config: &WorktreeConfig) -> Result<Self, FixwrightError> {
        let repo_root = repo_root.into();
        Repository::discover(&repo_root)
            .map_err(|e| FixwrightError::WorktreeInvalidPath(format!("{}: {e}", repo_root.display())))?;

        let base_dir = if Path::new(&config.base_dir).is_absolute() {
            PathBuf::from(&config.base_dir)
        } else {
            repo_root.join(&config.base_dir)
        };
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            repo_root,
            base_dir,
            prefix: config.prefix.clone(),
            max_concurrent: config.max_concurrent,
            auto_cleanup_after: Duration::from_secs(config.auto_cleanup_minutes * 60),
            leases: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn active_count(&self) -> usize {
        self.leases.lock().unwrap().len()
    }

    pub fn active_leases(&self) -> Vec<WorktreeLease> {
        self.leases.lock().unwrap().values().cloned().collect()
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}{}", self.prefix, branch.replace('/', "-")))
    }

    /// Lease a fresh working copy on a new branch cut from `base_branch`.
    pub async fn acquire(
        &self,
        branch: &str,
        issue_ids: &[u64],
        base_branch: &str,
    ) -> Result<WorktreeLease, FixwrightError> {
        let path = self.worktree_path(branch);
        let path_str = path
            .to_str()
            .ok_or_else(|| FixwrightError::WorktreeInvalidPath(path.display().to_string()))?
            .to_string();
        let lease_id = uuid::Uuid::new_v4().to_string();

        // Reserve the slot under the lock; all filesystem work happens after.
        {
            let mut leases = self.leases.lock().unwrap();
            if leases.len() >= self.max_concurrent {
                return Err(FixwrightError::MaxConcurrentExceeded(self.max_concurrent));
            }
            if leases.values().any(|l| l.branch == branch || l.path == path) {
                return Err(FixwrightError::BranchExists(branch.to_string()));
            }
            let now = Utc::now();
            leases.insert(
                lease_id.clone(),
                WorktreeLease {
                    id: lease_id.clone(),
                    path: path.clone(),
                    base_branch: base_branch.to_string(),
                    branch: branch.to_string(),
                    status: LeaseStatus::Creating,
                    issue_ids: issue_ids.to_vec(),
                    acquired_at: now,
                    last_activity: now,
                },
            );
        }

        if self.branch_exists(branch)? {
            self.forget(&lease_id);
            return Err(FixwrightError::BranchExists(branch.to_string()));
        }

        let result = self
            .run_git(&["worktree", "add", "-b", branch, &path_str, base_branch])
            .await;

        match result {
            Ok(_) => {
                let lease = self.update_status(&lease_id, LeaseStatus::Ready)?;
                info!(lease_id = %lease.id, branch, path = %path.display(), "worktree leased");
                Ok(lease)
            }
            Err(message) => {
                self.forget(&lease_id);
                Err(FixwrightError::WorktreeCreation {
                    branch: branch.to_string(),
                    message,
                })
            }
        }
    }

    /// Narration hook for the pipeline; the manager itself only
    /// distinguishes active from released.
    pub fn update_status(
        &self,
        lease_id: &str,
        status: LeaseStatus,
    ) -> Result<WorktreeLease, FixwrightError> {
        let mut leases = self.leases.lock().unwrap();
        let lease = leases
            .get_mut(lease_id)
            .ok_or_else(|| FixwrightError::WorktreeNotFound(lease_id.to_string()))?;
        lease.status = status;
        lease.last_activity = Utc::now();
        Ok(lease.clone())
    }

    /// Remove the working copy but keep the branch for publication.
    pub async fn release(&self, lease_id: &str) -> Result<(), FixwrightError> {
        self.release_inner(lease_id, false).await
    }

    /// Remove the working copy and delete its branch.
    pub async fn release_and_clean_branch(&self, lease_id: &str) -> Result<(), FixwrightError> {
        self.release_inner(lease_id, true).await
    }

    async fn release_inner(&self, lease_id: &str, delete_branch: bool) -> Result<(), FixwrightError> {
        let lease = {
            let mut leases = self.leases.lock().unwrap();
            let lease = leases
                .get_mut(lease_id)
                .ok_or_else(|| FixwrightError::WorktreeNotFound(lease_id.to_string()))?;
            lease.status = LeaseStatus::Cleaning;
            lease.clone()
        };

        let path = lease.path.to_string_lossy().to_string();
        if let Err(e) = self.run_git(&["worktree", "remove", "--force", &path]).await {
            // Cleanup failures must not keep the lease alive.
            warn!(lease_id, error = %e, "worktree remove failed, deleting directory directly");
            let _ = tokio::fs::remove_dir_all(&lease.path).await;
            let _ = self.run_git(&["worktree", "prune"]).await;
        }
        if delete_branch {
            if let Err(e) = self.run_git(&["branch", "-D", &lease.branch]).await {
                warn!(lease_id, branch = %lease.branch, error = %e, "branch delete failed");
            }
        }

        self.forget(lease_id);
        info!(lease_id, branch = %lease.branch, delete_branch, "worktree released");
        Ok(())
    }

    /// Force-release every lease older than the auto-cleanup window.
    pub async fn run_auto_cleanup(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.auto_cleanup_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<String> = {
            let leases = self.leases.lock().unwrap();
            leases
                .values()
                .filter(|l| l.acquired_at < cutoff)
                .map(|l| l.id.clone())
                .collect()
        };
        for lease_id in stale {
            warn!(lease_id = %lease_id, "auto-cleanup evicting stale lease");
            if let Err(e) = self.release_and_clean_branch(&lease_id).await {
                warn!(lease_id = %lease_id, error = %e, "auto-cleanup release failed");
            }
        }
    }

    /// Release every known lease. Called on shutdown and interrupt.
    pub async fn cleanup_all(&self) {
        let all: Vec<String> = {
            let leases = self.leases.lock().unwrap();
            leases.keys().cloned().collect()
        };
        for lease_id in all {
            if let Err(e) = self.release_and_clean_branch(&lease_id).await {
                warn!(lease_id = %lease_id, error = %e, "cleanup_all release failed");
            }
        }
    }

    /// Remove worktree directories under the prefix that no active lease
    /// owns (typically left behind by a crashed run).
    pub async fn cleanup_orphaned(&self) -> usize {
        let active_paths: Vec<PathBuf> = {
            let leases = self.leases.lock().unwrap();
            leases.values().map(|l| l.path.clone()).collect()
        };

        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot scan worktree base dir");
                return 0;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&self.prefix) || active_paths.contains(&path) {
                continue;
            }
            info!(path = %path.display(), "removing orphaned worktree");
            let display = path.to_string_lossy().to_string();
            if self
                .run_git(&["worktree", "remove", "--force", &display])
                .await
                .is_err()
            {
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
            removed += 1;
        }
        let _ = self.run_git(&["worktree", "prune"]).await;
        removed
    }

    /// Background loop ticking at half the cleanup window until cancelled.
    pub fn spawn_auto_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.auto_cleanup_after / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_auto_cleanup().await,
                    _ = cancel.cancelled() => {
                        debug!("auto-cleanup loop stopping");
                        break;
                    }
                }
            }
        })
    }

    fn forget(&self, lease_id: &str) {
        self.leases.lock().unwrap().remove(lease_id);
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, FixwrightError> {
        let repo = Repository::discover(&self.repo_root)
            .map_err(|e| FixwrightError::WorktreeInvalidPath(e.to_string()))?;
        let exists = repo.find_branch(branch, BranchType::Local).is_ok();
        Ok(exists)
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, String> {
        run_git_in(&self.repo_root, args).await
    }
}

/// Run a git command in `cwd`, returning stdout on success and the stderr
/// tail on failure.
pub(crate) async fn run_git_in(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| format!("git {}: {e}", args.join(" ")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(format!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}
