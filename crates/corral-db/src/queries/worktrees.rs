//! Query functions for the `worktrees` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Worktree, WorktreeStatus};

use super::{new_id, now};

/// Insert a new active worktree row. Returns the inserted worktree.
#[allow(clippy::too_many_arguments)]
pub async fn insert_worktree(
    pool: &SqlitePool,
    project_id: &str,
    task_id: Option<&str>,
    session_id: Option<&str>,
    agent_id: Option<&str>,
    branch: &str,
    path: &str,
    base_branch: &str,
) -> Result<Worktree> {
    let worktree = sqlx::query_as::<_, Worktree>(
        "INSERT INTO worktrees \
         (id, project_id, task_id, session_id, agent_id, branch, path, base_branch, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(project_id)
    .bind(task_id)
    .bind(session_id)
    .bind(agent_id)
    .bind(branch)
    .bind(path)
    .bind(base_branch)
    .bind(now())
    .fetch_one(pool)
    .await
    .context("failed to insert worktree")?;

    Ok(worktree)
}

/// Fetch a single worktree by id.
pub async fn get_worktree(pool: &SqlitePool, id: &str) -> Result<Option<Worktree>> {
    let worktree = sqlx::query_as::<_, Worktree>("SELECT * FROM worktrees WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worktree")?;

    Ok(worktree)
}

/// Update a worktree's status.
pub async fn update_worktree_status(
    pool: &SqlitePool,
    id: &str,
    status: WorktreeStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE worktrees SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update worktree status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("worktree {id} not found");
    }

    Ok(())
}

/// List worktrees for a project, optionally filtered to one status.
pub async fn list_worktrees_for_project(
    pool: &SqlitePool,
    project_id: &str,
    status: Option<WorktreeStatus>,
) -> Result<Vec<Worktree>> {
    let worktrees = match status {
        Some(status) => {
            sqlx::query_as::<_, Worktree>(
                "SELECT * FROM worktrees WHERE project_id = ? AND status = ? \
                 ORDER BY created_at ASC",
            )
            .bind(project_id)
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Worktree>(
                "SELECT * FROM worktrees WHERE project_id = ? ORDER BY created_at ASC",
            )
            .bind(project_id)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list worktrees for project")?;

    Ok(worktrees)
}
