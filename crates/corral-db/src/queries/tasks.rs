//! Query functions for the `tasks` table.
//!
//! Column transitions use optimistic locking: the UPDATE carries the
//! expected current column in its WHERE clause and callers check the
//! affected-row count.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{AgentRunStatus, PlanOptions, Task, TaskColumn};

use super::{new_id, now};

/// Insert a new task into `backlog`, placed after the column's current tail.
pub async fn insert_task(
    pool: &SqlitePool,
    project_id: &str,
    title: &str,
    description: &str,
    labels: Option<&[String]>,
) -> Result<Task> {
    let labels_json = match labels {
        Some(labels) => {
            Some(serde_json::to_string(labels).context("failed to encode labels")?)
        }
        None => None,
    };

    let position: (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM tasks \
         WHERE project_id = ? AND column_name = 'backlog'",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await
    .context("failed to compute task position")?;

    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, project_id, title, description, column_name, position, labels, created_at) \
         VALUES (?, ?, ?, ?, 'backlog', ?, ?, ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(project_id)
    .bind(title)
    .bind(description)
    .bind(position.0)
    .bind(labels_json)
    .bind(now())
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project, ordered by column position.
pub async fn list_tasks_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY column_name, position ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Move a task to a new column, guarded by the expected current column.
///
/// Returns the number of rows affected: 0 means the task does not exist or
/// the optimistic lock failed.
pub async fn transition_column(
    pool: &SqlitePool,
    id: &str,
    from: TaskColumn,
    to: TaskColumn,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET column_name = ? WHERE id = ? AND column_name = ?",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task column")?;

    Ok(result.rows_affected())
}

/// Persist a ready plan: plan text, plan options, column, and agent status
/// in one statement so the plan never appears without its column change.
pub async fn persist_plan(
    pool: &SqlitePool,
    id: &str,
    plan: &str,
    options: &PlanOptions,
) -> Result<u64> {
    let options_json =
        serde_json::to_string(options).context("failed to encode plan options")?;
    let result = sqlx::query(
        "UPDATE tasks SET plan = ?, plan_options = ?, column_name = 'waiting_approval', \
         last_agent_status = 'planning' \
         WHERE id = ? AND column_name = 'in_progress'",
    )
    .bind(plan)
    .bind(options_json)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to persist plan")?;

    Ok(result.rows_affected())
}

/// Clear the plan fields on reject: plan, options, and agent status reset,
/// column back to backlog.
pub async fn clear_plan(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET plan = NULL, plan_options = NULL, last_agent_status = NULL, \
         column_name = 'backlog' \
         WHERE id = ? AND column_name = 'waiting_approval'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to clear plan")?;

    Ok(result.rows_affected())
}

/// Record the approval stamp on a task.
pub async fn mark_approved(
    pool: &SqlitePool,
    id: &str,
    approved_by: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET approved_at = ?, approved_by = ? WHERE id = ?")
        .bind(now())
        .bind(approved_by)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark task approved")?;

    Ok(())
}

/// Attach the run artifacts (agent, session, worktree) to a task.
pub async fn set_run_refs(
    pool: &SqlitePool,
    id: &str,
    agent_id: Option<&str>,
    session_id: Option<&str>,
    worktree_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET \
         agent_id = COALESCE(?, agent_id), \
         session_id = COALESCE(?, session_id), \
         worktree_id = COALESCE(?, worktree_id) \
         WHERE id = ?",
    )
    .bind(agent_id)
    .bind(session_id)
    .bind(worktree_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set task run refs")?;

    Ok(())
}

/// Update the status badge of the most recent agent run.
pub async fn set_last_agent_status(
    pool: &SqlitePool,
    id: &str,
    status: Option<AgentRunStatus>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET last_agent_status = ?, \
         completed_at = COALESCE(?, completed_at) \
         WHERE id = ?",
    )
    .bind(status)
    .bind(completed_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set last agent status")?;

    Ok(())
}

/// Detach the session reference from a task (used when a run ends).
pub async fn clear_session_ref(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET session_id = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to clear session ref")?;

    Ok(())
}
