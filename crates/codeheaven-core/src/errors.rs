//! Error types for the execution orchestrator
//!
//! Engine faults, registry lookups and configuration problems each get their
//! own enum. [`ExecutionError`] is the classification the client sees: every
//! terminal failure of a request maps onto exactly one of its variants.

use thiserror::Error;

/// Faults raised by the container engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Image '{image}' unavailable: {message}")]
    ImageUnavailable { image: String, message: String },
    #[error("No such container: {0}")]
    NoSuchContainer(String),
    #[error("Docker API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Docker connection error: {0}")]
    Connection(String),
    #[error("Log stream error: {0}")]
    Stream(String),
    #[error("I/O error during Docker operation: {0}")]
    Io(String),
}

impl EngineError {
    /// True for replies that mean the container is already stopped or gone.
    ///
    /// These are expected during teardown of auto-removed containers.
    pub fn is_already_gone(&self) -> bool {
        match self {
            EngineError::NoSuchContainer(_) => true,
            EngineError::Api { status, message } => {
                *status == 304
                    || *status == 404
                    || (*status == 409 && message.contains("already in progress"))
            }
            _ => false,
        }
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => {
                if status_code == 404 && message.to_lowercase().contains("no such container") {
                    EngineError::NoSuchContainer(message)
                } else {
                    EngineError::Api {
                        status: status_code,
                        message,
                    }
                }
            }
            other => EngineError::Connection(other.to_string()),
        }
    }
}

impl From<hyper::Error> for EngineError {
    fn from(err: hyper::Error) -> Self {
        EngineError::Stream(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

/// Language lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Language '{language}' not supported. Supported languages: {}", supported.join(", "))]
    NotFound {
        language: String,
        supported: Vec<String>,
    },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Client-visible classification of a request that did not run to completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Malformed envelope, unknown language or empty code. No container exists.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The runtime image could not be obtained. No container exists.
    #[error("Image '{image}' unavailable")]
    ProvisionFailure { image: String },
    /// Container create/start/attach failed, or the container vanished.
    #[error("Runtime fault: {0}")]
    RuntimeFault(String),
    /// The program ran past its profile's timeout.
    #[error("Execution timed out after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u64 },
    /// The client went away. Nothing is reported.
    #[error("Client disconnected")]
    ClientDisconnect,
}

impl ExecutionError {
    /// Text sent to the client, or `None` when there is nobody to tell.
    pub fn user_message(&self) -> Option<String> {
        match self {
            ExecutionError::InvalidRequest(reason) => Some(format!("❌ {}", reason)),
            ExecutionError::ProvisionFailure { image } => {
                Some(format!("🐳 Docker image unavailable ({})", image))
            }
            ExecutionError::RuntimeFault(reason) => Some(format!("💥 {}", reason)),
            ExecutionError::ExecutionTimeout { timeout_ms } => Some(format!(
                "⏱️ Execution timed out after {}",
                humanize_ms(*timeout_ms)
            )),
            ExecutionError::ClientDisconnect => None,
        }
    }

    /// Classify an engine fault raised while provisioning or running.
    pub fn from_engine(err: &EngineError) -> Self {
        match err {
            EngineError::ImageUnavailable { image, .. } => ExecutionError::ProvisionFailure {
                image: image.clone(),
            },
            EngineError::NoSuchContainer(_) => ExecutionError::RuntimeFault(
                "Container exited before its output could be read".to_string(),
            ),
            other => ExecutionError::RuntimeFault(other.to_string()),
        }
    }
}

fn humanize_ms(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
