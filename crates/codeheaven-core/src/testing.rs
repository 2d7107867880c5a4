//! In-memory [`ContainerEngine`] for tests.
//!
//! Records every call and replays scripted multiplexed output, so the
//! executor and the gateway can be exercised without a Docker daemon.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::demux::{encode_frame, Channel};
use crate::errors::EngineError;
use crate::executors::{ContainerEngine, ContainerSpec, OutputStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ImageExists(String),
    Pull(String),
    Create(String),
    Attach(String),
    Start(String),
    Stop(String),
    Remove(String),
    Prune,
}

#[derive(Debug, Clone, Default)]
struct Script {
    image_missing: bool,
    slow_pull: bool,
    pull_failure: Option<String>,
    create_failure: Option<EngineError>,
    attach_failure: Option<EngineError>,
    start_failure: Option<EngineError>,
    chunks: Vec<Bytes>,
    stream_error: Option<String>,
    hang: bool,
    teardown_failure: bool,
    prune_failure: bool,
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<EngineCall>,
    last_spec: Option<ContainerSpec>,
    next_id: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    script: Arc<Script>,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self) -> &mut Script {
        Arc::make_mut(&mut self.script)
    }

    pub fn with_image_missing(mut self) -> Self {
        self.script().image_missing = true;
        self
    }

    /// Pulls never finish.
    pub fn with_slow_pull(mut self) -> Self {
        self.script().slow_pull = true;
        self
    }

    pub fn with_pull_failure(mut self, message: &str) -> Self {
        self.script().pull_failure = Some(message.to_string());
        self
    }

    pub fn with_create_failure(mut self, error: EngineError) -> Self {
        self.script().create_failure = Some(error);
        self
    }

    pub fn with_attach_failure(mut self, error: EngineError) -> Self {
        self.script().attach_failure = Some(error);
        self
    }

    pub fn with_start_failure(mut self, error: EngineError) -> Self {
        self.script().start_failure = Some(error);
        self
    }

    /// Emit each frame as its own chunk.
    pub fn with_frames(mut self, frames: &[(Channel, &str)]) -> Self {
        let chunks = frames
            .iter()
            .map(|(channel, text)| Bytes::from(encode_frame(channel.kind(), text.as_bytes())));
        self.script().chunks.extend(chunks);
        self
    }

    /// Concatenate the frames and re-chunk them every `chunk_size` bytes.
    pub fn with_split_frames(mut self, frames: &[(Channel, &str)], chunk_size: usize) -> Self {
        let raw: Vec<u8> = frames
            .iter()
            .flat_map(|(channel, text)| encode_frame(channel.kind(), text.as_bytes()))
            .collect();
        let chunks = raw
            .chunks(chunk_size.max(1))
            .map(Bytes::copy_from_slice);
        self.script().chunks.extend(chunks);
        self
    }

    pub fn with_raw_chunk(mut self, chunk: &[u8]) -> Self {
        self.script().chunks.push(Bytes::copy_from_slice(chunk));
        self
    }

    /// End the output with a stream error instead of a clean close.
    pub fn with_stream_error(mut self, message: &str) -> Self {
        self.script().stream_error = Some(message.to_string());
        self
    }

    /// Keep the output open forever after the scripted chunks.
    pub fn hanging(mut self) -> Self {
        self.script().hang = true;
        self
    }

    /// Stop and remove report a server error.
    pub fn with_teardown_failure(mut self) -> Self {
        self.script().teardown_failure = true;
        self
    }

    pub fn with_prune_failure(mut self) -> Self {
        self.script().prune_failure = true;
        self
    }

    fn record(&self, call: EngineCall) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.recorded
            .lock()
            .map(|r| r.calls.clone())
            .unwrap_or_default()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.recorded.lock().ok().and_then(|r| r.last_spec.clone())
    }

    fn count(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn pull_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Pull(_)))
    }

    pub fn create_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Create(_)))
    }

    pub fn stop_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Stop(_)))
    }

    pub fn remove_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Remove(_)))
    }

    pub fn prune_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Prune))
    }

    /// Wait for the background prune task, panicking after one second.
    pub async fn wait_for_prune(&self) {
        for _ in 0..100 {
            if self.prune_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("prune was never requested");
    }
}

fn teardown_error() -> EngineError {
    EngineError::Api {
        status: 500,
        message: "mock teardown failure".to_string(),
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.record(EngineCall::ImageExists(image.to_string()));
        Ok(!self.script.image_missing)
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Pull(image.to_string()));
        if self.script.slow_pull {
            std::future::pending::<()>().await;
        }
        match &self.script.pull_failure {
            Some(message) => Err(EngineError::ImageUnavailable {
                image: image.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(EngineCall::Create(spec.name.clone()));
        if let Some(error) = &self.script.create_failure {
            return Err(error.clone());
        }
        let mut recorded = self
            .recorded
            .lock()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        recorded.next_id += 1;
        recorded.last_spec = Some(spec.clone());
        Ok(format!("mock-{}", recorded.next_id))
    }

    async fn attach_output(&self, container_id: &str) -> Result<OutputStream, EngineError> {
        self.record(EngineCall::Attach(container_id.to_string()));
        if let Some(error) = &self.script.attach_failure {
            return Err(error.clone());
        }

        let chunks = stream::iter(self.script.chunks.clone().into_iter().map(Ok));
        let tail = match (&self.script.stream_error, self.script.hang) {
            (Some(message), _) => {
                stream::iter(vec![Err(EngineError::Stream(message.clone()))]).boxed()
            }
            (None, true) => stream::pending().boxed(),
            (None, false) => stream::empty().boxed(),
        };
        Ok(Box::pin(chunks.chain(tail)))
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Start(container_id.to_string()));
        match &self.script.start_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Stop(container_id.to_string()));
        if self.script.teardown_failure {
            return Err(teardown_error());
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(container_id.to_string()));
        if self.script.teardown_failure {
            return Err(teardown_error());
        }
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Prune);
        if self.script.prune_failure {
            return Err(EngineError::Api {
                status: 500,
                message: "mock prune failure".to_string(),
            });
        }
        Ok(())
    }
}
