//! Configuration file management for corral.
//!
//! TOML config at `~/.config/corral/config.toml` with the resolution
//! chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use corral_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Path to the SQLite database file.
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent binary exec'd inside sandboxes.
    pub binary: String,
    /// Container image for the docker sandbox backend.
    pub image: String,
    /// Sandbox backend: "docker" or "local".
    pub sandbox: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: "corral-agent".to_string(),
            image: "ubuntu:24.04".to_string(),
            sandbox: "docker".to_string(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Config directory, always XDG layout: `$XDG_CONFIG_HOME/corral` or
/// `~/.config/corral`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("corral");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("corral")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file; an absent file yields defaults.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConfigFile::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write the config file, creating parent directories as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    let path = config_path();
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Resolve the database config: flag > env > config file > default.
pub fn resolve_db(flag: Option<&str>) -> Result<DbConfig> {
    if let Some(path) = flag {
        return Ok(DbConfig::new(path));
    }
    if let Ok(path) = std::env::var("CORRAL_DATABASE_PATH") {
        return Ok(DbConfig::new(path));
    }
    let config = load_config()?;
    if let Some(path) = config.database.path {
        return Ok(DbConfig::new(path));
    }
    Ok(DbConfig::from_env())
}
