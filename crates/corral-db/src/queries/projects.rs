//! Query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Project, ProjectConfig};

use super::{new_id, now};

/// Insert a new project row. Returns the inserted project.
pub async fn insert_project(
    pool: &SqlitePool,
    name: &str,
    path: &str,
    config: &ProjectConfig,
    max_concurrent_agents: i64,
) -> Result<Project> {
    let config_json = serde_json::to_string(config).context("failed to encode project config")?;
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (id, name, path, config, max_concurrent_agents, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(name)
    .bind(path)
    .bind(config_json)
    .bind(max_concurrent_agents)
    .bind(now())
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by id.
pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects, oldest first.
pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list projects")?;

    Ok(projects)
}

/// Delete a project. Refused while live sessions reference it.
pub async fn delete_project(pool: &SqlitePool, id: &str) -> Result<()> {
    let live: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sessions WHERE project_id = ? AND status = 'active'",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to count live sessions")?;

    if live.0 > 0 {
        anyhow::bail!("project {id} has {} active session(s)", live.0);
    }

    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete project")?;

    Ok(())
}
