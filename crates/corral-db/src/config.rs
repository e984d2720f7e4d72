//! Database configuration.

use std::path::{Path, PathBuf};

/// Configuration for the corral database.
///
/// The store is a single SQLite file; `path` may also be the literal
/// `":memory:"` for throwaway databases.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Filesystem path to the database file.
    pub path: PathBuf,
}

impl DbConfig {
    /// Create a config pointing at the given database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the config from the `CORRAL_DATABASE_PATH` environment
    /// variable, falling back to `~/.local/share/corral/corral.db`.
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("CORRAL_DATABASE_PATH") {
            return Self::new(path);
        }
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("corral").join("corral.db"))
    }

    /// The database path as a `Path`.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
