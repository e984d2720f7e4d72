//! Credential resolution for agent runs.
//!
//! Resolution order: the api_keys table first, then the Claude credentials
//! file at `$HOME/.claude/.credentials.json`. Expired file records count as
//! absent. The resolved token travels into the sandbox as an environment
//! variable only and must never be logged.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use corral_db::queries::api_keys;

/// The default credential kind.
pub const ANTHROPIC: &str = "anthropic";

/// Shape of `$HOME/.claude/.credentials.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    access_token: String,
    #[allow(dead_code)]
    refresh_token: Option<String>,
    /// Milliseconds since the Unix epoch.
    expires_at: Option<i64>,
    #[allow(dead_code)]
    scope: Option<String>,
}

/// Resolves a model token from the store or the credentials file.
#[derive(Clone)]
pub struct CredentialResolver {
    pool: SqlitePool,
    /// Override for the credentials file location (tests).
    credentials_path: Option<PathBuf>,
}

impl CredentialResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            credentials_path: None,
        }
    }

    /// Point the resolver at a specific credentials file.
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    fn credentials_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.credentials_path {
            return Some(path.clone());
        }
        dirs::home_dir().map(|home| home.join(".claude").join(".credentials.json"))
    }

    /// Resolve a token of the given kind, or `None` if nothing usable is
    /// configured.
    pub async fn resolve(&self, kind: &str) -> Result<Option<String>> {
        if let Some(key) = api_keys::get_api_key(&self.pool, kind).await? {
            debug!(kind, "credential resolved from store");
            return Ok(Some(key.token));
        }

        Ok(self.resolve_from_file())
    }

    fn resolve_from_file(&self) -> Option<String> {
        let path = self.credentials_path()?;

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read credentials file");
                return None;
            }
        };

        let parsed: CredentialsFile = match serde_json::from_str(&contents) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse credentials file");
                return None;
            }
        };

        if let Some(expires_at) = parsed.expires_at {
            if expires_at <= Utc::now().timestamp_millis() {
                debug!(path = %path.display(), "credentials file token is expired");
                return None;
            }
        }

        Some(parsed.access_token)
    }
}
