//! Configuration loading and data directory resolution.
//!
//! Reads `config.toml` from the data directory (`~/.rewind/` unless
//! `REWIND_DATA_DIR` is set) and deserializes it into [`RewindConfig`]. A
//! missing or malformed file falls back to defaults.

use std::path::{Path, PathBuf};

use rewind_types::config::RewindConfig;

use crate::sqlite::pool::database_url_for;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "REWIND_DATA_DIR";

/// Resolve the data directory: `REWIND_DATA_DIR`, then `~/.rewind`, then
/// `./.rewind` when no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rewind")
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or unparsable file: a warning, then defaults.
pub async fn load_config(data_dir: &Path) -> RewindConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return RewindConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return RewindConfig::default();
        }
    };

    match toml::from_str::<RewindConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            RewindConfig::default()
        }
    }
}

/// The database URL to open: `[database] url` if set, else the file in the
/// data directory.
pub fn database_url(config: &RewindConfig, data_dir: &Path) -> String {
    config
        .database
        .url
        .clone()
        .unwrap_or_else(|| database_url_for(data_dir))
}
