//! Configuration Storage
//!
//! Reads the console configuration file from disk.
//! Config location: ~/.hpc-console/config.json on macOS/Linux,
//! %APPDATA%\hpc-console\config.json on Windows

use std::path::{Path, PathBuf};
use tokio::fs;

use super::ConsoleConfig;
use crate::error::ConsoleError;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for ConsoleError {
    fn from(err: ConfigError) -> Self {
        ConsoleError::Configuration(err.to_string())
    }
}

/// Get the console configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("hpc-console"));
        }
        dirs::home_dir()
            .map(|home| home.join(".hpc-console"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".hpc-console"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default location
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Storage at a custom path (command line, tests)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load configuration from disk.
    /// A missing file yields the defaults, a malformed one is an error.
    pub async fn load(&self) -> Result<ConsoleConfig, ConfigError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let config = serde_json::from_str::<ConsoleConfig>(&contents).map_err(|e| {
                    ConfigError::Json {
                        path: self.path.clone(),
                        source: e,
                    }
                })?;
                tracing::debug!("Loaded config from {:?}", self.path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {:?}, using defaults", self.path);
                Ok(ConsoleConfig::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Load from disk, then apply `HPC_CONSOLE_*` environment overrides
    pub async fn load_with_env(&self) -> Result<ConsoleConfig, ConsoleError> {
        let mut config = self.load().await?;
        config.apply_env()?;
        Ok(config)
    }

    /// Get config file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostKeyPolicy, RelayMode};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert!(config.host.is_empty());
        assert_eq!(config.port, 22);
    }

    #[tokio::test]
    async fn test_load_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "host": "login.cluster.example",
                "username": "alice",
                "host_key_policy": "strict",
                "tunnel": { "relay_mode": "concurrent", "join_timeout_ms": 250 }
            }"#,
        )
        .unwrap();

        let config = ConfigStorage::with_path(path).load().await.unwrap();
        assert_eq!(config.host, "login.cluster.example");
        assert_eq!(config.username, "alice");
        assert_eq!(config.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.tunnel.relay_mode, RelayMode::Concurrent);
        assert_eq!(config.tunnel.join_timeout_ms, 250);
        assert_eq!(config.tunnel.remote_port, 22);
    }

    #[tokio::test]
    async fn test_malformed_file_is_configuration_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));

        let console: ConsoleError = err.into();
        assert!(matches!(console, ConsoleError::Configuration(_)));
    }
}
