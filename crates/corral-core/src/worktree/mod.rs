//! Worktree service: per-task branch checkouts plus their rows.
//!
//! The git plumbing lives in [`manager`]; this module ties it to the
//! `worktrees` table so the rest of the system can work with worktree ids.

pub mod manager;

use std::path::PathBuf;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use corral_db::models::{Project, Worktree, WorktreeStatus};
use corral_db::queries::worktrees as db;

use crate::error::{CoreError, CoreResult, ErrorCode};

pub use manager::{DiffFile, DiffSummary, GitWorktrees, MergeOutcome, WorktreeError};

/// Branch name for a task's worktree.
pub fn branch_name(task_id: &str) -> String {
    format!("corral/{task_id}")
}

/// Inputs for creating a worktree.
#[derive(Debug, Clone)]
pub struct CreateWorktree<'a> {
    pub project: &'a Project,
    pub task_id: &'a str,
    pub session_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    /// Branch override; defaults to `corral/<task_id>`.
    pub branch: Option<String>,
    /// Base branch override; defaults to the project's default branch.
    pub base_branch: Option<String>,
}

/// Service over worktree rows and git state.
#[derive(Clone)]
pub struct WorktreeService {
    pool: SqlitePool,
}

impl WorktreeService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn git(&self, project: &Project) -> CoreResult<GitWorktrees> {
        GitWorktrees::new(&project.path).map_err(|e| {
            CoreError::new(
                ErrorCode::WorktreeCreateFailed,
                format!("project {} is not usable as a git repository: {e}", project.id),
            )
        })
    }

    /// Create (or reuse) the worktree for a task and record it as `active`.
    ///
    /// On git failure nothing is persisted, so a failed launch leaves no
    /// worktree row behind.
    pub async fn create(&self, input: CreateWorktree<'_>) -> CoreResult<Worktree> {
        let project = input.project;
        let config = project.config().map_err(|e| {
            CoreError::new(
                ErrorCode::WorktreeCreateFailed,
                format!("invalid config for project {}: {e}", project.id),
            )
        })?;

        let branch = input.branch.unwrap_or_else(|| branch_name(input.task_id));
        let base_branch = input
            .base_branch
            .unwrap_or_else(|| config.default_branch.clone());
        let path: PathBuf = PathBuf::from(&project.path)
            .join(&config.worktree_root)
            .join(input.task_id);

        let git = self.git(project)?;
        git.create(&branch, &base_branch, &path).map_err(|e| {
            CoreError::new(
                ErrorCode::WorktreeCreateFailed,
                format!("failed to create worktree for task {}: {e}", input.task_id),
            )
        })?;

        let worktree = db::insert_worktree(
            &self.pool,
            &project.id,
            Some(input.task_id),
            input.session_id,
            input.agent_id,
            &branch,
            &path.to_string_lossy(),
            &base_branch,
        )
        .await
        .map_err(|e| {
            // The checkout exists but the row failed; remove the checkout
            // so state stays consistent.
            let _ = git.remove(&path);
            CoreError::new(ErrorCode::WorktreeCreateFailed, format!("{e:#}"))
        })?;

        info!(
            worktree_id = %worktree.id,
            task_id = input.task_id,
            branch = %branch,
            "worktree created"
        );
        Ok(worktree)
    }

    /// Fetch a worktree row.
    pub async fn get(&self, worktree_id: &str) -> Result<Option<Worktree>> {
        db::get_worktree(&self.pool, worktree_id).await
    }

    async fn get_with_project(&self, worktree_id: &str) -> CoreResult<(Worktree, Project)> {
        let worktree = db::get_worktree(&self.pool, worktree_id)
            .await
            .map_err(|e| CoreError::new(ErrorCode::WorktreeCreateFailed, format!("{e:#}")))?
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::WorktreeCreateFailed,
                    format!("worktree {worktree_id} not found"),
                )
            })?;
        let project = corral_db::queries::projects::get_project(&self.pool, &worktree.project_id)
            .await
            .map_err(|e| CoreError::new(ErrorCode::WorktreeCreateFailed, format!("{e:#}")))?
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::WorktreeCreateFailed,
                    format!("project {} not found", worktree.project_id),
                )
            })?;
        Ok((worktree, project))
    }

    /// Diff the worktree branch against its base, for the approval view.
    pub async fn get_diff(&self, worktree_id: &str) -> CoreResult<DiffSummary> {
        let (worktree, project) = self.get_with_project(worktree_id).await?;
        let git = self.git(&project)?;
        git.diff(std::path::Path::new(&worktree.path), &worktree.base_branch)
            .map_err(|e| {
                CoreError::new(
                    ErrorCode::WorktreeCreateFailed,
                    format!("failed to diff worktree {worktree_id}: {e}"),
                )
            })
    }

    /// Stage and commit everything in the worktree. Returns whether a
    /// commit was created.
    pub async fn commit_all(&self, worktree_id: &str, message: &str) -> CoreResult<bool> {
        let (worktree, project) = self.get_with_project(worktree_id).await?;
        let git = self.git(&project)?;
        git.commit_all(std::path::Path::new(&worktree.path), message)
            .map_err(|e| {
                CoreError::new(
                    ErrorCode::WorktreeCreateFailed,
                    format!("failed to commit worktree {worktree_id}: {e}"),
                )
            })
    }

    /// Merge the worktree branch into its base branch and mark the row
    /// `merged` on success.
    pub async fn merge(
        &self,
        worktree_id: &str,
        message: Option<&str>,
    ) -> CoreResult<MergeOutcome> {
        let (worktree, project) = self.get_with_project(worktree_id).await?;
        let git = self.git(&project)?;

        let outcome = git
            .merge(&worktree.branch, &worktree.base_branch, message)
            .map_err(|e| {
                CoreError::new(
                    ErrorCode::WorktreeCreateFailed,
                    format!("failed to merge worktree {worktree_id}: {e}"),
                )
            })?;

        if outcome == MergeOutcome::Merged {
            db::update_worktree_status(&self.pool, worktree_id, WorktreeStatus::Merged)
                .await
                .map_err(|e| {
                    CoreError::new(ErrorCode::WorktreeCreateFailed, format!("{e:#}"))
                })?;
            info!(worktree_id, branch = %worktree.branch, "worktree merged");
        }
        Ok(outcome)
    }

    /// Remove the worktree directory and mark the row `removed`.
    pub async fn remove(&self, worktree_id: &str) -> CoreResult<()> {
        let (worktree, project) = self.get_with_project(worktree_id).await?;
        let git = self.git(&project)?;
        git.remove(std::path::Path::new(&worktree.path)).map_err(|e| {
            CoreError::new(
                ErrorCode::WorktreeCreateFailed,
                format!("failed to remove worktree {worktree_id}: {e}"),
            )
        })?;
        db::update_worktree_status(&self.pool, worktree_id, WorktreeStatus::Removed)
            .await
            .map_err(|e| CoreError::new(ErrorCode::WorktreeCreateFailed, format!("{e:#}")))?;
        Ok(())
    }

    /// Housekeeping: prune git's stale registrations and mark rows whose
    /// directories are gone as `removed`. Returns how many rows changed.
    pub async fn prune(&self, project: &Project) -> Result<u32> {
        let git = match GitWorktrees::new(&project.path) {
            Ok(git) => git,
            Err(e) => {
                warn!(project_id = %project.id, error = %e, "skipping prune, repo unusable");
                return Ok(0);
            }
        };
        let _ = git.prune();

        let mut changed = 0;
        let rows =
            db::list_worktrees_for_project(&self.pool, &project.id, Some(WorktreeStatus::Active))
                .await?;
        for row in rows {
            if !std::path::Path::new(&row.path).exists() {
                db::update_worktree_status(&self.pool, &row.id, WorktreeStatus::Removed).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
