//! Query functions for the `agents` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Agent, AgentConfig, AgentStatus};

use super::{new_id, now};

/// Insert a new idle agent row. Returns the inserted agent.
pub async fn insert_agent(
    pool: &SqlitePool,
    project_id: &str,
    agent_type: &str,
    config: &AgentConfig,
) -> Result<Agent> {
    let config_json = serde_json::to_string(config).context("failed to encode agent config")?;
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (id, project_id, agent_type, status, config, created_at) \
         VALUES (?, ?, ?, 'idle', ?, ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(project_id)
    .bind(agent_type)
    .bind(config_json)
    .bind(now())
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by id.
pub async fn get_agent(pool: &SqlitePool, id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Update an agent's status and current task.
///
/// The pair is written together: a non-idle agent always points at a task.
pub async fn update_agent_status(
    pool: &SqlitePool,
    id: &str,
    status: AgentStatus,
    current_task_id: Option<&str>,
) -> Result<()> {
    if status != AgentStatus::Idle && current_task_id.is_none() {
        anyhow::bail!("agent {id}: non-idle status {status} requires a current task");
    }

    let result = sqlx::query("UPDATE agents SET status = ?, current_task_id = ? WHERE id = ?")
        .bind(status)
        .bind(current_task_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update agent status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent {id} not found");
    }

    Ok(())
}

/// List agents for a project.
pub async fn list_agents_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE project_id = ? ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list agents for project")?;

    Ok(agents)
}
