//! Query functions for the `api_keys` table.
//!
//! Tokens are opaque strings here; callers must never log them.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::ApiKey;

use super::{new_id, now};

/// Store a credential. Replaces any existing credential of the same kind.
pub async fn upsert_api_key(
    pool: &SqlitePool,
    kind: &str,
    token: &str,
    label: Option<&str>,
) -> Result<ApiKey> {
    sqlx::query("DELETE FROM api_keys WHERE kind = ?")
        .bind(kind)
        .execute(pool)
        .await
        .context("failed to clear existing api key")?;

    let key = sqlx::query_as::<_, ApiKey>(
        "INSERT INTO api_keys (id, kind, token, label, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new_id())
    .bind(kind)
    .bind(token)
    .bind(label)
    .bind(now())
    .fetch_one(pool)
    .await
    .context("failed to insert api key")?;

    Ok(key)
}

/// Fetch the stored credential of a given kind, if any.
pub async fn get_api_key(pool: &SqlitePool, kind: &str) -> Result<Option<ApiKey>> {
    let key = sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM api_keys WHERE kind = ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(kind)
    .fetch_optional(pool)
    .await
    .context("failed to fetch api key")?;

    Ok(key)
}

/// Remove the stored credential of a given kind.
pub async fn delete_api_key(pool: &SqlitePool, kind: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM api_keys WHERE kind = ?")
        .bind(kind)
        .execute(pool)
        .await
        .context("failed to delete api key")?;

    Ok(result.rows_affected() > 0)
}
