// src/executors/docker.rs
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    PruneImagesOptions as BollardPruneImagesOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::{header, Method, Request, StatusCode};
use std::collections::HashMap;
use std::path::PathBuf;

use super::{ContainerEngine, ContainerSpec, OutputStream};
use crate::config::DockerSettings;
use crate::errors::EngineError;

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerEngine {
    docker: Docker,
    socket_path: PathBuf,
    stop_grace_secs: i32,
}

impl DockerEngine {
    /// Connect to the daemon listening on the configured unix socket.
    pub fn connect(settings: &DockerSettings) -> Result<Self, EngineError> {
        let socket = settings.socket_path.to_string_lossy().to_string();
        let docker =
            Docker::connect_with_socket(&socket, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
        Ok(Self {
            docker,
            socket_path: settings.socket_path.clone(),
            stop_grace_secs: settings.stop_grace_secs,
        })
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Open a raw HTTP/1.1 connection to the daemon socket.
    #[cfg(unix)]
    async fn raw_connection(
        &self,
    ) -> Result<hyper::client::conn::http1::SendRequest<Empty<Bytes>>, EngineError> {
        let stream = tokio::net::UnixStream::connect(&self.socket_path).await?;
        let (sender, connection) =
            hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("Docker attach connection closed with error: {}", e);
            }
        });
        Ok(sender)
    }
}

/// Translate a sandbox spec into the engine's create request.
pub(crate) fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let limits = &spec.limits;
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        working_dir: Some("/tmp".to_string()),
        tty: Some(false),
        open_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            auto_remove: Some(true),
            memory: Some(limits.memory_bytes()),
            memory_swap: Some(limits.memory_swap_bytes()),
            cpu_period: Some(limits.cpu_period),
            cpu_quota: Some(limits.cpu_quota),
            cpu_shares: Some(limits.cpu_shares),
            blkio_weight: Some(limits.blkio_weight),
            oom_kill_disable: Some(false),
            pids_limit: Some(limits.pids_limit),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Extract the `message` field from a Docker JSON error body.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        log::info!("Pulling image {}", image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull {}: {}", image, status);
                    }
                }
                Err(e) => {
                    log::warn!("Failed to pull image {}: {}", image, e);
                    return Err(EngineError::ImageUnavailable {
                        image: image.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });
        let container = self
            .docker
            .create_container(options, create_body(spec))
            .await?;
        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", spec.name, warning);
        }
        Ok(container.id)
    }

    #[cfg(unix)]
    async fn attach_output(&self, container_id: &str) -> Result<OutputStream, EngineError> {
        let mut sender = self.raw_connection().await?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/containers/{}/attach?stream=1&stdout=1&stderr=1",
                container_id
            ))
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let message = error_message(&body);
            return Err(if status == StatusCode::NOT_FOUND {
                EngineError::NoSuchContainer(message)
            } else {
                EngineError::Api {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let output = BodyStream::new(response.into_body()).filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => Some(Err(EngineError::from(e))),
            }
        });
        Ok(Box::pin(output))
    }

    #[cfg(not(unix))]
    async fn attach_output(&self, _container_id: &str) -> Result<OutputStream, EngineError> {
        Err(EngineError::Connection(
            "Raw output attach requires a unix socket".to_string(),
        ))
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError> {
        let options = Some(BollardStopContainerOptionsQuery {
            t: Some(self.stop_grace_secs),
            ..Default::default()
        });
        self.docker.stop_container(container_id, options).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            ..Default::default()
        });
        self.docker.remove_container(container_id, options).await?;
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<(), EngineError> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let options = Some(BollardPruneImagesOptionsQuery {
            filters: Some(filters),
        });
        let report = self.docker.prune_images(options).await?;
        log::info!(
            "Pruned {} dangling images, reclaimed {} bytes",
            report.images_deleted.map(|d| d.len()).unwrap_or(0),
            report.space_reclaimed.unwrap_or(0)
        );
        Ok(())
    }
}
