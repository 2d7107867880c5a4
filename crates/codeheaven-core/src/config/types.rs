//! Configuration type definitions
//!
//! Every section and field is optional in YAML; missing values fall back to
//! the defaults below. The sandbox limits default to the hardened profile
//! the service has always run with.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::ConfigError;
use crate::languages::LanguageRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeHeavenConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub limits: SandboxLimits,
    #[serde(default)]
    pub languages: HashMap<String, LanguageOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
    /// Largest accepted inbound text frame, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            enable_cors: true,
            cors_origins: Vec::new(),
            enable_logging: true,
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Seconds the engine waits after SIGTERM before killing on stop.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: i32,
    /// Prune dangling images after a failed execution.
    #[serde(default = "default_true")]
    pub prune_on_failure: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            stop_grace_secs: default_stop_grace_secs(),
            prune_on_failure: true,
        }
    }
}

/// Resource ceilings applied to every sandbox.
///
/// Networking, capabilities and privilege escalation are not configurable:
/// they are always disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: i64,
    #[serde(default = "default_memory_swap_mb")]
    pub memory_swap_mb: i64,
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: i64,
    #[serde(default = "default_blkio_weight")]
    pub blkio_weight: u16,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            memory_swap_mb: default_memory_swap_mb(),
            cpu_period: default_cpu_period(),
            cpu_quota: default_cpu_quota(),
            cpu_shares: default_cpu_shares(),
            blkio_weight: default_blkio_weight(),
            pids_limit: default_pids_limit(),
        }
    }
}

const BYTES_PER_MB: i64 = 1024 * 1024;

impl SandboxLimits {
    /// Saturates; `validate` rejects values that would overflow.
    pub fn memory_bytes(&self) -> i64 {
        self.memory_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn memory_swap_bytes(&self) -> i64 {
        self.memory_swap_mb.saturating_mul(BYTES_PER_MB)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageOverride {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_message_size() -> usize {
    96 * 1024
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_stop_grace_secs() -> i32 {
    1
}

fn default_memory_mb() -> i64 {
    100
}

fn default_memory_swap_mb() -> i64 {
    200
}

fn default_cpu_period() -> i64 {
    100_000
}

fn default_cpu_quota() -> i64 {
    50_000
}

fn default_cpu_shares() -> i64 {
    512
}

fn default_blkio_weight() -> u16 {
    300
}

fn default_pids_limit() -> i64 {
    100
}

impl CodeHeavenConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.memory_mb <= 0 {
            return Err(ConfigError::Invalid(
                "limits.memory_mb must be greater than zero".to_string(),
            ));
        }
        if limits.memory_swap_mb.checked_mul(BYTES_PER_MB).is_none() {
            return Err(ConfigError::Invalid(format!(
                "limits.memory_swap_mb ({}) is too large",
                limits.memory_swap_mb
            )));
        }
        if limits.memory_swap_mb < limits.memory_mb {
            return Err(ConfigError::Invalid(format!(
                "limits.memory_swap_mb ({}) must be at least limits.memory_mb ({})",
                limits.memory_swap_mb, limits.memory_mb
            )));
        }
        if limits.cpu_period <= 0 || limits.cpu_quota <= 0 || limits.cpu_shares <= 0 {
            return Err(ConfigError::Invalid(
                "CPU period, quota and shares must be greater than zero".to_string(),
            ));
        }
        if limits.cpu_quota > limits.cpu_period {
            return Err(ConfigError::Invalid(format!(
                "limits.cpu_quota ({}) must not exceed limits.cpu_period ({})",
                limits.cpu_quota, limits.cpu_period
            )));
        }
        if !(10..=1000).contains(&limits.blkio_weight) {
            return Err(ConfigError::Invalid(format!(
                "limits.blkio_weight must be between 10 and 1000, got {}",
                limits.blkio_weight
            )));
        }
        if limits.pids_limit <= 0 {
            return Err(ConfigError::Invalid(
                "limits.pids_limit must be greater than zero".to_string(),
            ));
        }
        if self.docker.stop_grace_secs < 0 {
            return Err(ConfigError::Invalid(
                "docker.stop_grace_secs must not be negative".to_string(),
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_size must be greater than zero".to_string(),
            ));
        }

        // Rejects unknown keys, empty images and zero timeouts.
        LanguageRegistry::with_overrides(&self.languages)?;
        Ok(())
    }

    /// Build the language registry described by this configuration.
    pub fn registry(&self) -> Result<LanguageRegistry, ConfigError> {
        LanguageRegistry::with_overrides(&self.languages)
    }
}
