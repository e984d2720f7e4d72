//! Query functions for the `sandbox_instances` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{SandboxInstance, SandboxStatus};

use super::{new_id, now};

/// Insert a new sandbox instance row in `creating` status.
pub async fn insert_sandbox(pool: &SqlitePool, project_id: &str) -> Result<SandboxInstance> {
    let stamp = now();
    let sandbox = sqlx::query_as::<_, SandboxInstance>(
        "INSERT INTO sandbox_instances (id, project_id, status, created_at, updated_at) \
         VALUES (?, ?, 'creating', ?, ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(project_id)
    .bind(stamp)
    .bind(stamp)
    .fetch_one(pool)
    .await
    .context("failed to insert sandbox instance")?;

    Ok(sandbox)
}

/// Update a sandbox instance's status.
pub async fn update_sandbox_status(
    pool: &SqlitePool,
    id: &str,
    status: SandboxStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sandbox_instances SET status = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update sandbox status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("sandbox instance {id} not found");
    }

    Ok(())
}

/// Fetch the most recent sandbox instance for a project, if any.
pub async fn get_sandbox_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Option<SandboxInstance>> {
    let sandbox = sqlx::query_as::<_, SandboxInstance>(
        "SELECT * FROM sandbox_instances WHERE project_id = ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch sandbox instance for project")?;

    Ok(sandbox)
}
