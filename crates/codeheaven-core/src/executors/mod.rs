//! Sandboxed execution of untrusted code.
//!
//! [`ContainerEngine`] is the boundary to the container runtime;
//! [`docker::DockerEngine`] implements it against a local Docker daemon.
//! [`sandbox::SandboxExecutor`] drives one request through provisioning,
//! running and teardown on top of any engine.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;

use crate::config::SandboxLimits;
use crate::errors::EngineError;
use crate::languages::ExecutionProfile;

pub mod docker;
pub mod handle;
pub mod sandbox;

pub use handle::{ExecutionHandle, ExecutionState, TerminalState};
pub use sandbox::{ExecutionReport, Outbound, SandboxExecutor};

/// Label carrying the originating session on every sandbox container.
pub const SESSION_LABEL: &str = "codeheaven.session";
/// Label carrying the execution id on every sandbox container.
pub const EXECUTION_LABEL: &str = "codeheaven.execution";

/// Raw multiplexed output of a container, as delivered by the engine.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes, EngineError>> + Send>>;

/// Everything the engine needs to create one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub limits: SandboxLimits,
}

impl ContainerSpec {
    /// Build the sandbox for running `code` under `profile`.
    pub fn for_profile(
        profile: &ExecutionProfile,
        code: &str,
        limits: &SandboxLimits,
        session_id: &str,
        execution_id: &str,
    ) -> Self {
        let invocation = profile.invocation(code);

        let mut labels = HashMap::new();
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());
        labels.insert(EXECUTION_LABEL.to_string(), execution_id.to_string());
        labels.insert(
            "codeheaven.language".to_string(),
            profile.language.id().to_string(),
        );

        Self {
            name: format!("codeheaven-exec-{}", execution_id),
            image: profile.image.clone(),
            cmd: invocation.cmd,
            env: invocation.env,
            labels,
            limits: limits.clone(),
        }
    }
}

/// Operations the executor needs from a container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether `image` is present in the local image cache.
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Pull `image`. Failures are reported as [`EngineError::ImageUnavailable`].
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create a stopped container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Attach to the combined stdout/stderr stream of a container.
    ///
    /// Called before [`ContainerEngine::start_container`] so no output is
    /// lost. The stream ends when the container exits.
    async fn attach_output(&self, container_id: &str) -> Result<OutputStream, EngineError>;

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;

    /// Delete dangling images from the local cache.
    async fn prune_dangling_images(&self) -> Result<(), EngineError>;
}
