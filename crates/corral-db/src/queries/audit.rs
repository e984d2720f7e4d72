//! Query functions for the `audit_logs` table.
//!
//! Inserts are best-effort at call sites: a failed audit write is logged
//! and never fails the operation it describes.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::AuditLog;

use super::now;

/// Append an audit entry.
pub async fn insert_audit(
    pool: &SqlitePool,
    entity_type: &str,
    entity_id: &str,
    action: &str,
    detail: Option<&serde_json::Value>,
) -> Result<()> {
    let detail_json = match detail {
        Some(value) => Some(serde_json::to_string(value).context("failed to encode audit detail")?),
        None => None,
    };

    sqlx::query(
        "INSERT INTO audit_logs (entity_type, entity_id, action, detail, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(detail_json)
    .bind(now())
    .execute(pool)
    .await
    .context("failed to insert audit log")?;

    Ok(())
}

/// List audit entries for one entity, oldest first.
pub async fn list_audit_for_entity(
    pool: &SqlitePool,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<AuditLog>> {
    let entries = sqlx::query_as::<_, AuditLog>(
        "SELECT * FROM audit_logs WHERE entity_type = ? AND entity_id = ? \
         ORDER BY id ASC",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(pool)
    .await
    .context("failed to list audit logs")?;

    Ok(entries)
}
