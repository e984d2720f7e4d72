//! Query functions for the `sessions` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::Session;

use super::{new_id, now};

/// Insert a new active session row. Returns the inserted session.
pub async fn insert_session(
    pool: &SqlitePool,
    project_id: &str,
    task_id: Option<&str>,
    agent_id: Option<&str>,
    title: &str,
) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (id, project_id, task_id, agent_id, title, status, created_at) \
         VALUES (?, ?, ?, ?, ?, 'active', ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(project_id)
    .bind(task_id)
    .bind(agent_id)
    .bind(title)
    .bind(now())
    .fetch_one(pool)
    .await
    .context("failed to insert session")?;

    Ok(session)
}

/// Fetch a single session by id.
pub async fn get_session(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch session")?;

    Ok(session)
}

/// Mark a session closed and stamp `closed_at`. Idempotent: closing a
/// closed session leaves the original stamp in place.
pub async fn close_session(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    sqlx::query(
        "UPDATE sessions SET status = 'closed', closed_at = ? \
         WHERE id = ? AND status = 'active'",
    )
    .bind(now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to close session")?;

    get_session(pool, id).await
}

/// List sessions attached to a task, newest first.
pub async fn list_sessions_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<Session>> {
    let sessions = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE task_id = ? ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list sessions for task")?;

    Ok(sessions)
}
