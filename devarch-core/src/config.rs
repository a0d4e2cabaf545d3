//! Configuration management.

use crate::error::{DevarchError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent configuration for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded wait for the per-stack apply lock, in seconds.
    pub lock_timeout_secs: u64,
    /// Escalate ambiguous or missing wiring to a planning failure.
    pub strict_wiring: bool,
    /// Warning diagnostics block apply unless the caller confirms them.
    pub confirm_warnings_required: bool,
    pub database_path: String,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            strict_wiring: false,
            confirm_warnings_required: true,
            database_path: paths::db_path().to_string_lossy().to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Load configuration from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Self::config_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| DevarchError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| DevarchError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DevarchError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            DevarchError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(path, content)
            .map_err(|e| DevarchError::Io { path: path.to_path_buf(), source: e })
    }

    /// Apply `DEVARCH_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DEVARCH_LOCK_TIMEOUT_SECS") {
            self.lock_timeout_secs = raw.trim().parse().map_err(|_| DevarchError::InvalidConfig {
                reason: format!("DEVARCH_LOCK_TIMEOUT_SECS must be an integer, got '{}'", raw),
            })?;
        }

        if let Some(raw) = lookup("DEVARCH_STRICT_WIRING") {
            self.strict_wiring = parse_bool(&raw).ok_or_else(|| DevarchError::InvalidConfig {
                reason: format!("DEVARCH_STRICT_WIRING must be a boolean, got '{}'", raw),
            })?;
        }

        if let Some(path) = lookup("DEVARCH_DATABASE_PATH") {
            self.database_path = path;
        }

        if let Some(level) = lookup("DEVARCH_LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
