//! Centralized path configuration for DevArch.
//!
//! All data paths go through this module so that every caller of the engine
//! agrees on where the database and configuration live.

use std::path::PathBuf;

/// Get the DevArch data directory.
///
/// Resolution order:
/// 1. `DEVARCH_DATA_DIR` environment variable
/// 2. `/var/lib/devarch` if it exists (system install)
/// 3. `~/.devarch` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DEVARCH_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/devarch");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".devarch")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `DEVARCH_CONFIG_DIR` wins; otherwise the platform config dir
/// (`~/.config/devarch` on Linux), falling back to the data dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DEVARCH_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("devarch")).unwrap_or_else(data_dir)
}

/// Get the database path.
pub fn db_path() -> PathBuf {
    data_dir().join("devarch.db")
}
