//! One client connection.
//!
//! A [`Session`] validates inbound frames, dispatches at most one execution
//! at a time and cancels it when the connection goes away. The socket itself
//! is driven by [`handle_connection`], which splits it into a reader loop and
//! a writer task draining the session's outbound channel.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use codeheaven_core::languages::MAX_CODE_BYTES;
use codeheaven_core::{
    ExecutionError, ExecutionProfile, ExecutionReport, LanguageRegistry, Outbound,
    SandboxExecutor,
};
use codeheaven_types::{ClientMessage, ExecutionRequest, MessageType};

use crate::AppState;

pub const CONNECTED_MESSAGE: &str = "🔗 Connected to execution service";

const OUTBOUND_BUFFER: usize = 256;

struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<ExecutionReport>,
}

pub struct Session {
    id: String,
    registry: Arc<LanguageRegistry>,
    executor: SandboxExecutor,
    outbound: Outbound,
    max_message_size: usize,
    active: Option<ActiveRun>,
}

impl Session {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        executor: SandboxExecutor,
        outbound: Outbound,
        max_message_size: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            registry,
            executor,
            outbound,
            max_message_size,
            active: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether an execution is still running on this connection.
    pub fn is_busy(&self) -> bool {
        self.active
            .as_ref()
            .map(|run| !run.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn greet(&self) {
        self.send(ClientMessage::untimed(MessageType::System, CONNECTED_MESSAGE))
            .await;
    }

    /// Handle one text frame. Returns whether an execution was started.
    pub async fn on_text(&mut self, text: &str) -> bool {
        let (request, profile) = match self.validate(text) {
            Ok(accepted) => accepted,
            Err(e) => {
                log::debug!("Session {} rejected request: {}", self.id, e);
                self.reject(e).await;
                return false;
            }
        };

        if self.is_busy() {
            log::info!(
                "Session {} rejected {} request while another execution is running",
                self.id,
                profile.language
            );
            self.reject(ExecutionError::InvalidRequest(
                "An execution is already running on this connection".to_string(),
            ))
            .await;
            return false;
        }

        self.send(ClientMessage::system(format!(
            "🚀 Executing {} code...",
            profile.language
        )))
        .await;

        let session_id = if request.session_id.is_empty() {
            self.id.clone()
        } else {
            request.session_id
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let executor = self.executor.clone();
        let outbound = self.outbound.clone();
        let code = request.code;
        let task = tokio::spawn(async move {
            executor
                .execute(&profile, &code, &session_id, &outbound, token)
                .await
        });

        self.active = Some(ActiveRun { cancel, task });
        true
    }

    pub async fn on_binary(&self) {
        self.reject(ExecutionError::InvalidRequest(
            "Binary messages are not supported".to_string(),
        ))
        .await;
    }

    /// Cancel the active execution, if any, and wait for its teardown.
    pub async fn on_close(&mut self) -> Option<ExecutionReport> {
        if let Some(run) = &self.active {
            run.cancel.cancel();
        }
        self.join_active().await
    }

    /// Wait for the active execution to end on its own.
    pub async fn join_active(&mut self) -> Option<ExecutionReport> {
        let run = self.active.take()?;
        match run.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                log::error!("Execution task for session {} failed: {}", self.id, e);
                None
            }
        }
    }

    fn validate(&self, text: &str) -> Result<(ExecutionRequest, ExecutionProfile), ExecutionError> {
        if text.len() > self.max_message_size {
            return Err(ExecutionError::InvalidRequest(format!(
                "Message exceeds the {} byte limit",
                self.max_message_size
            )));
        }

        let request = ExecutionRequest::from_json(text)
            .map_err(|_| ExecutionError::InvalidRequest("Invalid JSON format".to_string()))?;

        let profile = self
            .registry
            .resolve(&request.language)
            .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))?
            .clone();

        if request.is_blank() {
            return Err(ExecutionError::InvalidRequest("No code provided".to_string()));
        }
        if request.code.len() > MAX_CODE_BYTES {
            return Err(ExecutionError::InvalidRequest(format!(
                "Code exceeds the {} byte limit",
                MAX_CODE_BYTES
            )));
        }

        Ok((request, profile))
    }

    async fn reject(&self, error: ExecutionError) {
        if let Some(message) = error.user_message() {
            self.send(ClientMessage::error(message)).await;
        }
    }

    async fn send(&self, message: ClientMessage) {
        if self.outbound.send(message).await.is_err() {
            log::debug!("Session {} outbound channel closed", self.id);
        }
    }
}

/// Drive one upgraded WebSocket until the client disconnects.
pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ClientMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    log::error!("Failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(
        Arc::clone(&state.registry),
        state.executor.clone(),
        tx,
        state.config.max_message_size,
    );
    log::info!("Client {} connected", session.id());
    session.greet().await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                session.on_text(text.as_str()).await;
            }
            Ok(Message::Binary(_)) => session.on_binary().await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Client {} socket error: {}", session.id(), e);
                break;
            }
        }
    }

    if let Some(report) = session.on_close().await {
        log::debug!(
            "Client {} left with execution {} {}",
            session.id(),
            report.execution_id,
            report.outcome
        );
    }
    log::info!("Client {} disconnected", session.id());
    drop(session);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeheaven_core::config::{LanguageOverride, SandboxLimits};
    use codeheaven_core::demux::Channel;
    use codeheaven_core::testing::MockEngine;
    use codeheaven_core::TerminalState;
    use std::collections::HashMap;

    fn session_with(
        engine: &MockEngine,
        registry: LanguageRegistry,
    ) -> (Session, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let executor = SandboxExecutor::new(Arc::new(engine.clone()), SandboxLimits::default());
        let session = Session::new(Arc::new(registry), executor, tx, 1024);
        (session, rx)
    }

    fn session(engine: &MockEngine) -> (Session, mpsc::Receiver<ClientMessage>) {
        session_with(engine, LanguageRegistry::new())
    }

    fn drain(rx: &mut mpsc::Receiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn request(code: &str, language: &str) -> String {
        serde_json::to_string(&ExecutionRequest::new(code, language, "room-1")).unwrap()
    }

    #[tokio::test]
    async fn test_greeting_is_untimed() {
        let engine = MockEngine::new();
        let (session, mut rx) = session(&engine);
        session.greet().await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::System);
        assert_eq!(messages[0].data, CONNECTED_MESSAGE);
        assert!(messages[0].timestamp.is_none());
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let engine = MockEngine::new();
        let (mut session, mut rx) = session(&engine);

        assert!(!session.on_text("{not json").await);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Error);
        assert_eq!(messages[0].data, "❌ Invalid JSON format");
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_language_scenario() {
        let engine = MockEngine::new();
        let (mut session, mut rx) = session(&engine);

        assert!(!session.on_text(&request("puts 1", "ruby")).await);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Error);
        assert!(messages[0].data.contains("ruby"));
        assert!(messages[0].data.contains("python, javascript, c, cpp, html"));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_blank_code() {
        let engine = MockEngine::new();
        let (mut session, mut rx) = session(&engine);

        assert!(!session.on_text(&request("   \n\t", "python")).await);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "❌ No code provided");
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message() {
        let engine = MockEngine::new();
        let (mut session, mut rx) = session(&engine);

        let big = request(&"x".repeat(2048), "python");
        assert!(!session.on_text(&big).await);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].data.contains("byte limit"));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_binary_rejected() {
        let engine = MockEngine::new();
        let (session, mut rx) = session(&engine);
        session.on_binary().await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Error);
    }

    #[tokio::test]
    async fn test_python_request_streams_to_end() {
        let engine = MockEngine::new().with_frames(&[(Channel::Stdout, "2\n")]);
        let (mut session, mut rx) = session(&engine);

        assert!(session.on_text(&request("print(1+1)", "py")).await);
        let report = session.join_active().await.unwrap();
        assert_eq!(report.outcome, TerminalState::Completed);

        let messages = drain(&mut rx);
        let kinds: Vec<_> = messages.iter().map(|m| m.message_type).collect();
        assert_eq!(
            kinds,
            vec![MessageType::System, MessageType::Output, MessageType::End]
        );
        assert_eq!(messages[0].data, "🚀 Executing python code...");
        assert_eq!(messages[1].data, "2\n");

        let spec = engine.last_spec().unwrap();
        assert_eq!(spec.labels["codeheaven.session"], "room-1");
    }

    #[tokio::test]
    async fn test_second_request_rejected_while_running() {
        let engine = MockEngine::new()
            .with_frames(&[(Channel::Stdout, "working\n")])
            .hanging();
        let (mut session, mut rx) = session(&engine);

        assert!(session.on_text(&request("while True: pass", "python")).await);
        assert!(session.is_busy());
        assert!(!session.on_text(&request("print(2)", "python")).await);
        assert!(session.is_busy());

        let report = session.on_close().await.unwrap();
        assert_eq!(report.outcome, TerminalState::Aborted);
        assert_eq!(engine.create_count(), 1);
        assert_eq!(engine.stop_count(), 1);

        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|m| m.data.contains("already running")));
        assert!(messages.iter().all(|m| m.message_type != MessageType::End));
    }

    #[tokio::test]
    async fn test_new_request_after_completion() {
        let engine = MockEngine::new().with_frames(&[(Channel::Stdout, "ok\n")]);
        let (mut session, _rx) = session(&engine);

        assert!(session.on_text(&request("print('ok')", "python")).await);
        session.join_active().await;
        assert!(!session.is_busy());
        assert!(session.on_text(&request("print('ok')", "python")).await);
        session.join_active().await;
        assert_eq!(engine.create_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_then_error() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "python".to_string(),
            LanguageOverride {
                image: None,
                timeout_ms: Some(40),
            },
        );
        let registry = LanguageRegistry::with_overrides(&overrides).unwrap();
        let engine = MockEngine::new().hanging();
        let (mut session, mut rx) = session_with(&engine, registry);

        assert!(session.on_text(&request("import time; time.sleep(10)", "python")).await);
        let report = session.join_active().await.unwrap();
        assert_eq!(report.outcome, TerminalState::TimedOut);

        let messages = drain(&mut rx);
        let last = messages.last().unwrap();
        assert_eq!(last.message_type, MessageType::Error);
        assert!(last.data.contains("40ms"));
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_close_without_execution() {
        let engine = MockEngine::new();
        let (mut session, _rx) = session(&engine);
        assert!(session.on_close().await.is_none());
        assert!(engine.calls().is_empty());
    }
}
