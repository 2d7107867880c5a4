//! Configuration loader for YAML files and environment overrides

use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::types::CodeHeavenConfig;
use crate::errors::ConfigError;

/// Overrides `server.bind_addr`.
pub const ENV_BIND_ADDR: &str = "CODEHEAVEN_BIND_ADDR";
/// Overrides `docker.socket_path`.
pub const ENV_DOCKER_SOCKET: &str = "CODEHEAVEN_DOCKER_SOCKET";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<CodeHeavenConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::from_str(&content)
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    ///
    /// Environment overrides and validation apply either way.
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<CodeHeavenConfig, ConfigError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            return Self::from_file(path).await;
        }
        log::info!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        let mut config = CodeHeavenConfig::default();
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<CodeHeavenConfig, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let mut config: CodeHeavenConfig = if content.trim().is_empty() {
            CodeHeavenConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut CodeHeavenConfig) {
        if let Ok(addr) = env::var(ENV_BIND_ADDR) {
            if !addr.trim().is_empty() {
                log::debug!("Using bind address from {}", ENV_BIND_ADDR);
                config.server.bind_addr = addr;
            }
        }
        if let Ok(socket) = env::var(ENV_DOCKER_SOCKET) {
            if !socket.trim().is_empty() {
                log::debug!("Using Docker socket from {}", ENV_DOCKER_SOCKET);
                config.docker.socket_path = PathBuf::from(socket);
            }
        }
    }
}
