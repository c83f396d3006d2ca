//! Configuration management for the parley CLI.
//!
//! Settings come from, in order of precedence:
//! 1. Config file (`~/.parley/config.toml` or `--config`)
//! 2. Environment variables, for backend fields the file leaves unset
//! 3. Default values

mod schema;

pub use schema::ParleyConfig;

use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    /// TOML serialization error.
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    /// The file has error-level issues.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Get the default config directory path.
#[must_use]
pub fn default_config_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

/// Get the default config file path.
#[must_use]
pub fn config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from `path`, or the default path, merged with the
/// environment.
pub async fn load_config(path: Option<&Path>) -> ConfigResult<ParleyConfig> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    Ok(load_config_from(&path).await?.with_env())
}

/// Load configuration from a specific path, without the environment.
pub async fn load_config_from(path: &Path) -> ConfigResult<ParleyConfig> {
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return Ok(ParleyConfig::default());
    }

    let content = tokio::fs::read_to_string(path).await?;
    let config: ParleyConfig = toml::from_str(&content)?;
    debug!(path = %path.display(), "loaded config file");

    Ok(config)
}

/// Save configuration to a specific path.
pub async fn save_config_to(config: &ParleyConfig, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = toml::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;
    info!(path = %path.display(), "saved config file");

    Ok(())
}

/// Writes the default configuration to `path` unless a file exists there.
///
/// Returns `true` if a file was written.
pub async fn init_config(path: &Path, force: bool) -> ConfigResult<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    save_config_to(&ParleyConfig::default(), path).await?;
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("parley-cli-{}-{name}", std::process::id()))
            .join("config.toml")
    }

    #[test]
    fn test_default_paths() {
        let cfg_dir = default_config_dir();
        assert!(cfg_dir.ends_with(".parley"));

        let cfg_path = config_path();
        assert!(cfg_path.ends_with("config.toml"));
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let config = load_config_from(&scratch("missing")).await.unwrap();
        assert_eq!(config, ParleyConfig::default());
    }

    #[tokio::test]
    async fn init_writes_once_unless_forced() {
        let path = scratch("init");
        let _ = tokio::fs::remove_file(&path).await;

        assert!(init_config(&path, false).await.unwrap());
        assert!(!init_config(&path, false).await.unwrap());
        assert!(init_config(&path, true).await.unwrap());

        let loaded = load_config_from(&path).await.unwrap();
        assert_eq!(loaded, ParleyConfig::default());

        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}
