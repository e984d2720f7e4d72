//! Query functions, one module per table family.

pub mod agents;
pub mod api_keys;
pub mod audit;
pub mod projects;
pub mod sandboxes;
pub mod sessions;
pub mod tasks;
pub mod worktrees;

use chrono::{DateTime, Utc};

/// Mint a new string id (UUIDv4).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current timestamp, shared so inserts within one operation agree.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
