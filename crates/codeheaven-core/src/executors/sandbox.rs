//! Orchestration of one sandboxed run.
//!
//! The executor provisions the image, creates and starts the container,
//! relays its output frame by frame and finally tears the container down.
//! Four things can end a run: the output stream ending, the timer firing,
//! the client going away (the cancellation token) and an engine fault. All
//! of them go through [`SandboxExecutor::finish`], which consults the
//! handle's terminal latch so teardown and the terminal message happen once.
//!
//! A client that stops reading must not hold a container open: every relayed
//! frame races the deadline and the cancellation token, the container is torn
//! down before the terminal message, and that message only waits briefly.

use futures_util::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use codeheaven_types::ClientMessage;

use super::handle::{ExecutionHandle, TerminalState};
use super::{ContainerEngine, ContainerSpec};
use crate::config::SandboxLimits;
use crate::demux::{Channel, Demultiplexer, OutputFrame};
use crate::errors::{EngineError, ExecutionError};
use crate::formatter;
use crate::languages::ExecutionProfile;

/// Channel towards the client connection.
pub type Outbound = mpsc::Sender<ClientMessage>;

pub const NO_OUTPUT_MESSAGE: &str = "(no output)";
pub const COMPLETED_MESSAGE: &str = "✅ Execution completed";

/// How long a terminal message may wait for room in a full outbound channel.
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub outcome: TerminalState,
    /// Output frames relayed to the client.
    pub frames: usize,
    /// Classification of the failure, if the run did not complete.
    pub error: Option<ExecutionError>,
}

/// Why the running phase stopped.
#[derive(Debug)]
enum Ending {
    Completed { frames: usize },
    TimedOut { frames: usize },
    Aborted { frames: usize },
    Failed { frames: usize, error: EngineError },
}

impl Ending {
    fn state(&self) -> TerminalState {
        match self {
            Ending::Completed { .. } => TerminalState::Completed,
            Ending::TimedOut { .. } => TerminalState::TimedOut,
            Ending::Aborted { .. } => TerminalState::Aborted,
            Ending::Failed { .. } => TerminalState::Failed,
        }
    }

    fn interrupted(stop: Interrupt, frames: usize) -> Self {
        match stop {
            Interrupt::Cancelled => Ending::Aborted { frames },
            Interrupt::Expired => Ending::TimedOut { frames },
        }
    }

    fn frames(&self) -> usize {
        match self {
            Ending::Completed { frames }
            | Ending::TimedOut { frames }
            | Ending::Aborted { frames }
            | Ending::Failed { frames, .. } => *frames,
        }
    }
}

/// Why a relay gave up before the client accepted the frame.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    Expired,
}

/// Runs requests against a [`ContainerEngine`].
///
/// Cheap to clone; every run owns its own handle, buffers and timer.
#[derive(Clone)]
pub struct SandboxExecutor {
    engine: Arc<dyn ContainerEngine>,
    limits: SandboxLimits,
    prune_on_failure: bool,
}

impl SandboxExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>, limits: SandboxLimits) -> Self {
        Self {
            engine,
            limits,
            prune_on_failure: true,
        }
    }

    pub fn with_prune_on_failure(mut self, enabled: bool) -> Self {
        self.prune_on_failure = enabled;
        self
    }

    /// Run `code` under `profile`, streaming messages to `outbound`.
    ///
    /// Never fails: faults are reported to the client and summarized in the
    /// returned report. Cancelling `cancel` aborts the run silently.
    pub async fn execute(
        &self,
        profile: &ExecutionProfile,
        code: &str,
        session_id: &str,
        outbound: &Outbound,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let mut handle = ExecutionHandle::new(session_id);
        handle.begin_provisioning();
        log::info!(
            "Execution {} (session '{}') starting: {} on {}",
            handle.id(),
            session_id,
            profile.language,
            profile.image
        );

        let mut frames = 0usize;
        let result = self
            .run(&mut handle, profile, code, outbound, &cancel, &mut frames)
            .await;
        let ending = match result {
            Ok(ending) => ending,
            Err(error) => Ending::Failed { frames, error },
        };

        let state = ending.state();
        self.finish(&mut handle, ending, profile, outbound)
            .await
            .unwrap_or_else(|| ExecutionReport {
                execution_id: handle.id().to_string(),
                outcome: state,
                frames,
                error: None,
            })
    }

    async fn run(
        &self,
        handle: &mut ExecutionHandle,
        profile: &ExecutionProfile,
        code: &str,
        outbound: &Outbound,
        cancel: &CancellationToken,
        frames: &mut usize,
    ) -> Result<Ending, EngineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Ending::Aborted { frames: 0 }),
            provisioned = self.ensure_image(&profile.image) => provisioned?,
        }

        let deadline = handle.arm_timer(profile.timeout);
        let spec = ContainerSpec::for_profile(
            profile,
            code,
            &self.limits,
            handle.session_id(),
            handle.id(),
        );
        let container_id = self.engine.create_container(&spec).await?;
        log::info!(
            "Execution {} created container {}",
            handle.id(),
            container_id
        );
        handle.attach_container(container_id.clone());

        let mut output = self.engine.attach_output(&container_id).await?;
        self.engine.start_container(&container_id).await?;
        handle.begin_running();

        let mut demux = Demultiplexer::new();
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Ending::Aborted { frames: *frames }),
                _ = &mut timer => return Ok(Ending::TimedOut { frames: *frames }),
                chunk = output.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let batch = demux.push(&bytes);
                        if let Err(stop) =
                            relay_all(batch, profile, outbound, cancel, deadline, frames).await
                        {
                            return Ok(Ending::interrupted(stop, *frames));
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        let batch = demux.finish();
                        if let Err(stop) =
                            relay_all(batch, profile, outbound, cancel, deadline, frames).await
                        {
                            return Ok(Ending::interrupted(stop, *frames));
                        }
                        if demux.pending() > 0 {
                            log::debug!(
                                "Execution {} dropped {} trailing bytes",
                                handle.id(),
                                demux.pending()
                            );
                        }
                        return Ok(Ending::Completed { frames: *frames });
                    }
                },
            }
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.engine.image_exists(image).await? {
            return Ok(());
        }
        self.engine.pull_image(image).await
    }

    /// Terminal transition. Returns `None` when the handle already ended, in
    /// which case nothing is sent and nothing is torn down.
    async fn finish(
        &self,
        handle: &mut ExecutionHandle,
        ending: Ending,
        profile: &ExecutionProfile,
        outbound: &Outbound,
    ) -> Option<ExecutionReport> {
        let teardown = match handle.terminate(ending.state()) {
            Some(teardown) => teardown,
            None => {
                log::debug!(
                    "Execution {} already terminated, ignoring {}",
                    handle.id(),
                    ending.state()
                );
                return None;
            }
        };

        if let Some(container_id) = &teardown.container_id {
            self.teardown(container_id).await;
        }

        let frames = ending.frames();
        let error = match ending {
            Ending::Completed { frames } => {
                if frames == 0 {
                    send(outbound, ClientMessage::output(NO_OUTPUT_MESSAGE)).await;
                }
                send(outbound, ClientMessage::end(COMPLETED_MESSAGE)).await;
                None
            }
            Ending::TimedOut { .. } => {
                let error = ExecutionError::ExecutionTimeout {
                    timeout_ms: profile.timeout_ms(),
                };
                if let Some(message) = error.user_message() {
                    send(outbound, ClientMessage::error(message)).await;
                }
                Some(error)
            }
            Ending::Aborted { .. } => Some(ExecutionError::ClientDisconnect),
            Ending::Failed { error, .. } => {
                log::error!("Execution {} failed: {}", handle.id(), error);
                let classified = ExecutionError::from_engine(&error);
                if let Some(message) = classified.user_message() {
                    send(outbound, ClientMessage::error(message)).await;
                }
                if self.prune_on_failure {
                    self.spawn_prune();
                }
                Some(classified)
            }
        };

        log::info!(
            "Execution {} finished: {} ({} frames)",
            handle.id(),
            teardown.outcome,
            frames
        );

        Some(ExecutionReport {
            execution_id: handle.id().to_string(),
            outcome: teardown.outcome,
            frames,
            error,
        })
    }

    /// Stop and remove a container. Failures are logged, never raised.
    async fn teardown(&self, container_id: &str) {
        if let Err(e) = self.engine.stop_container(container_id).await {
            log_cleanup_error("stop", container_id, &e);
        }
        if let Err(e) = self.engine.remove_container(container_id).await {
            log_cleanup_error("remove", container_id, &e);
        }
    }

    fn spawn_prune(&self) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.prune_dangling_images().await {
                log::warn!("Image pruning failed: {}", e);
            }
        });
    }
}

fn log_cleanup_error(step: &str, container_id: &str, error: &EngineError) {
    if error.is_already_gone() {
        log::debug!("Container {} already gone on {}: {}", container_id, step, error);
    } else {
        log::warn!("Failed to {} container {}: {}", step, container_id, error);
    }
}

/// Relay a batch of frames, counting those handed to the client.
async fn relay_all(
    batch: Vec<OutputFrame>,
    profile: &ExecutionProfile,
    outbound: &Outbound,
    cancel: &CancellationToken,
    deadline: Instant,
    frames: &mut usize,
) -> Result<(), Interrupt> {
    for frame in batch {
        if relay(frame, profile, outbound, cancel, deadline).await? {
            *frames += 1;
        }
    }
    Ok(())
}

/// Format one frame and forward it. Returns whether anything was sent.
///
/// Frames that were nothing but control characters are dropped. Waiting for
/// room in the channel stops at the deadline or on cancellation.
async fn relay(
    frame: OutputFrame,
    profile: &ExecutionProfile,
    outbound: &Outbound,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<bool, Interrupt> {
    let text = formatter::format(&frame.text, frame.channel, profile.language);
    if text.is_empty() {
        return Ok(false);
    }
    let message = match frame.channel {
        Channel::Stdout => ClientMessage::output(text),
        Channel::Stderr => ClientMessage::error(text),
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Expired),
        sent = outbound.send(message) => {
            if sent.is_err() {
                log::debug!("Client connection closed, dropping output");
            }
            Ok(true)
        }
    }
}

/// Send a terminal message, giving up on a client that is not reading.
async fn send(outbound: &Outbound, message: ClientMessage) {
    match tokio::time::timeout(TERMINAL_SEND_TIMEOUT, outbound.send(message)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => log::debug!("Client connection closed, dropping message"),
        Err(_) => log::warn!("Client is not reading, dropping terminal message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::encode_frame;
    use crate::languages::{Language, LanguageRegistry};
    use crate::testing::{EngineCall, MockEngine};
    use codeheaven_types::MessageType;
    use std::time::Duration;

    fn executor(engine: &MockEngine) -> SandboxExecutor {
        SandboxExecutor::new(Arc::new(engine.clone()), SandboxLimits::default())
    }

    fn profile(language: Language) -> ExecutionProfile {
        ExecutionProfile::default_for(language)
    }

    fn quick(language: Language, timeout_ms: u64) -> ExecutionProfile {
        ExecutionProfile {
            timeout: Duration::from_millis(timeout_ms),
            ..profile(language)
        }
    }

    async fn run(
        engine: &MockEngine,
        profile: &ExecutionProfile,
        code: &str,
    ) -> (ExecutionReport, Vec<ClientMessage>) {
        let (tx, mut rx) = mpsc::channel(64);
        let report = executor(engine)
            .execute(profile, code, "room", &tx, CancellationToken::new())
            .await;
        drop(tx);
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        (report, messages)
    }

    #[tokio::test]
    async fn test_python_scenario() {
        let engine = MockEngine::new().with_frames(&[(Channel::Stdout, "2\n")]);
        let (report, messages) = run(&engine, &profile(Language::Python), "print(1+1)").await;

        assert_eq!(report.outcome, TerminalState::Completed);
        assert_eq!(report.frames, 1);
        assert!(report.error.is_none());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::Output);
        assert!(messages[0].data.contains('2'));
        assert!(messages[0].timestamp.is_none());
        assert_eq!(messages[1].message_type, MessageType::End);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_attach_happens_before_start() {
        let engine = MockEngine::new().with_frames(&[(Channel::Stdout, "x")]);
        run(&engine, &profile(Language::Python), "print('x')").await;

        let calls = engine.calls();
        let attach = calls
            .iter()
            .position(|c| matches!(c, EngineCall::Attach(_)))
            .unwrap();
        let start = calls
            .iter()
            .position(|c| matches!(c, EngineCall::Start(_)))
            .unwrap();
        assert!(attach < start);
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks() {
        let engine = MockEngine::new().with_split_frames(
            &[(Channel::Stdout, "hello "), (Channel::Stdout, "world\n")],
            3,
        );
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(report.frames, 2);
        assert_eq!(messages[0].data, "hello ");
        assert_eq!(messages[1].data, "world\n");
    }

    #[tokio::test]
    async fn test_unknown_and_empty_frames_are_skipped() {
        let mut raw = encode_frame(3, b"stdin echo");
        raw.extend(encode_frame(Channel::Stdout.kind(), b""));
        raw.extend(encode_frame(Channel::Stdout.kind(), b"\x1b[32mok\x1b[0m\n"));
        let engine = MockEngine::new().with_raw_chunk(&raw);
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(report.frames, 1);
        assert_eq!(messages[0].data, "ok\n");
        assert_eq!(messages[1].message_type, MessageType::End);
    }

    #[tokio::test]
    async fn test_blank_lines_are_relayed() {
        let engine = MockEngine::new().with_frames(&[
            (Channel::Stdout, "a\n"),
            (Channel::Stdout, "\n"),
            (Channel::Stdout, "b\n"),
        ]);
        let (report, messages) =
            run(&engine, &profile(Language::Python), "print('a'); print(); print('b')").await;

        assert_eq!(report.frames, 3);
        let stdout: String = messages
            .iter()
            .filter(|m| m.message_type == MessageType::Output)
            .map(|m| m.data.as_str())
            .collect();
        assert_eq!(stdout, "a\n\nb\n");
    }

    #[tokio::test]
    async fn test_whitespace_only_output_counts_as_output() {
        let engine = MockEngine::new().with_frames(&[(Channel::Stdout, "   \n")]);
        let (report, messages) = run(&engine, &profile(Language::Python), "print('   ')").await;

        assert_eq!(report.frames, 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data, "   \n");
        assert!(messages.iter().all(|m| m.data != NO_OUTPUT_MESSAGE));
    }

    #[tokio::test]
    async fn test_character_split_across_writes() {
        let euro = "€".as_bytes();
        let mut raw = encode_frame(Channel::Stdout.kind(), &[b'=', euro[0], euro[1]]);
        raw.extend(encode_frame(Channel::Stdout.kind(), &[euro[2], b'\n']));
        let engine = MockEngine::new().with_raw_chunk(&raw);
        let (_, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(messages[0].data, "=");
        assert_eq!(messages[1].data, "€\n");
    }

    #[tokio::test]
    async fn test_no_output() {
        let engine = MockEngine::new();
        let (report, messages) = run(&engine, &profile(Language::Python), "pass").await;

        assert_eq!(report.outcome, TerminalState::Completed);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data, NO_OUTPUT_MESSAGE);
        assert_eq!(messages[0].message_type, MessageType::Output);
        assert_eq!(messages[1].message_type, MessageType::End);
    }

    #[tokio::test]
    async fn test_c_compile_error_scenario() {
        let stderr = "Compilation errors:\n/tmp/main.c: In function 'main':\n/tmp/main.c:2:13: error: expected ';' before '}' token\n";
        let engine = MockEngine::new().with_frames(&[(Channel::Stderr, stderr)]);
        let (report, messages) =
            run(&engine, &profile(Language::C), "int main(){return 0}").await;

        assert_eq!(report.outcome, TerminalState::Completed);
        let errors: Vec<_> = messages
            .iter()
            .filter(|m| m.message_type == MessageType::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].data.contains("Line 2:13"));
        assert!(!errors[0].data.contains("/tmp/main.c"));
        assert_eq!(messages.last().unwrap().message_type, MessageType::End);
    }

    #[tokio::test]
    async fn test_timeout_scenario() {
        let engine = MockEngine::new()
            .with_frames(&[(Channel::Stdout, "sleeping\n")])
            .hanging();
        let (report, messages) = run(&engine, &quick(Language::Python, 50), "sleep").await;

        assert_eq!(report.outcome, TerminalState::TimedOut);
        assert_eq!(
            report.error,
            Some(ExecutionError::ExecutionTimeout { timeout_ms: 50 })
        );
        let last = messages.last().unwrap();
        assert_eq!(last.message_type, MessageType::Error);
        assert!(last.data.contains("timed out"));
        assert!(messages.iter().all(|m| m.message_type != MessageType::End));
        assert_eq!(engine.stop_count(), 1);
    }

    fn chatter() -> MockEngine {
        let frames: Vec<(Channel, &str)> = (0..50).map(|_| (Channel::Stdout, "spam\n")).collect();
        MockEngine::new().with_frames(&frames).hanging()
    }

    #[tokio::test]
    async fn test_timeout_fires_while_client_is_not_reading() {
        let engine = chatter();
        let exec = executor(&engine);
        let (tx, _rx) = mpsc::channel(4);

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            exec.execute(
                &quick(Language::Python, 50),
                "while True: print('spam')",
                "room",
                &tx,
                CancellationToken::new(),
            ),
        )
        .await
        .expect("executor ignored its deadline");

        assert_eq!(report.outcome, TerminalState::TimedOut);
        assert_eq!(report.frames, 4);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_client_is_not_reading() {
        let engine = chatter();
        let exec = executor(&engine);
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            let profile = profile(Language::Python);
            tokio::spawn(async move { exec.execute(&profile, "loop", "room", &tx, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("executor ignored cancellation")
            .unwrap();
        assert_eq!(report.outcome, TerminalState::Aborted);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_scenario() {
        let engine = MockEngine::new()
            .with_frames(&[(Channel::Stdout, "tick\n")])
            .hanging();
        let exec = executor(&engine);
        let profile = profile(Language::Python);
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move { exec.execute(&profile, "loop", "room", &tx, cancel).await })
        };

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data, "tick\n");
        cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.outcome, TerminalState::Aborted);
        assert_eq!(report.error, Some(ExecutionError::ClientDisconnect));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_provisioning_creates_nothing() {
        let engine = MockEngine::new().with_image_missing().with_slow_pull();
        let exec = executor(&engine);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = exec
            .execute(&profile(Language::Python), "x", "room", &tx, cancel)
            .await;
        drop(tx);

        assert_eq!(report.outcome, TerminalState::Aborted);
        assert!(rx.recv().await.is_none());
        assert_eq!(engine.create_count(), 0);
        assert_eq!(engine.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_pull_failure() {
        let engine = MockEngine::new()
            .with_image_missing()
            .with_pull_failure("manifest unknown");
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(report.outcome, TerminalState::Failed);
        assert_eq!(
            report.error,
            Some(ExecutionError::ProvisionFailure {
                image: "python:3.11-slim".to_string()
            })
        );
        assert_eq!(messages.len(), 1);
        assert!(messages[0].data.contains("Docker image unavailable"));
        assert_eq!(engine.create_count(), 0);
        assert_eq!(engine.stop_count(), 0);
        engine.wait_for_prune().await;
    }

    #[tokio::test]
    async fn test_image_present_skips_pull() {
        let engine = MockEngine::new();
        run(&engine, &profile(Language::Python), "x").await;
        assert_eq!(engine.pull_count(), 0);

        let engine = MockEngine::new().with_image_missing();
        run(&engine, &profile(Language::Python), "x").await;
        assert_eq!(engine.pull_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_tears_down() {
        let engine = MockEngine::new().with_start_failure(EngineError::Api {
            status: 500,
            message: "OCI runtime create failed".to_string(),
        });
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(report.outcome, TerminalState::Failed);
        assert!(matches!(report.error, Some(ExecutionError::RuntimeFault(_))));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].data.contains("OCI runtime create failed"));
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_container_is_classified() {
        let engine = MockEngine::new()
            .with_attach_failure(EngineError::NoSuchContainer("abc".to_string()));
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(report.outcome, TerminalState::Failed);
        assert!(messages[0].data.contains("Container exited"));
    }

    #[tokio::test]
    async fn test_stream_error_fails_after_output() {
        let engine = MockEngine::new()
            .with_frames(&[(Channel::Stdout, "partial\n")])
            .with_stream_error("connection reset");
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;

        assert_eq!(report.outcome, TerminalState::Failed);
        assert_eq!(report.frames, 1);
        assert_eq!(messages[0].data, "partial\n");
        assert_eq!(messages[1].message_type, MessageType::Error);
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_prune_failure_is_swallowed() {
        let engine = MockEngine::new()
            .with_create_failure(EngineError::Api {
                status: 500,
                message: "no space left on device".to_string(),
            })
            .with_prune_failure();
        let (report, _) = run(&engine, &profile(Language::Python), "x").await;
        assert_eq!(report.outcome, TerminalState::Failed);
        engine.wait_for_prune().await;
    }

    #[tokio::test]
    async fn test_prune_can_be_disabled() {
        let engine = MockEngine::new().with_create_failure(EngineError::Api {
            status: 500,
            message: "boom".to_string(),
        });
        let exec = executor(&engine).with_prune_on_failure(false);
        let (tx, _rx) = mpsc::channel(8);
        exec.execute(
            &profile(Language::Python),
            "x",
            "room",
            &tx,
            CancellationToken::new(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.prune_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_errors_are_swallowed() {
        let engine = MockEngine::new()
            .with_frames(&[(Channel::Stdout, "ok\n")])
            .with_teardown_failure();
        let (report, messages) = run(&engine, &profile(Language::Python), "x").await;
        assert_eq!(report.outcome, TerminalState::Completed);
        assert_eq!(messages.last().unwrap().message_type, MessageType::End);
    }

    #[tokio::test]
    async fn test_second_terminal_transition_is_a_noop() {
        let engine = MockEngine::new();
        let exec = executor(&engine);
        let profile = profile(Language::Python);
        let (tx, mut rx) = mpsc::channel(8);

        let mut handle = ExecutionHandle::new("room");
        handle.begin_provisioning();
        handle.attach_container("mock-1");
        handle.begin_running();

        let first = exec
            .finish(&mut handle, Ending::Completed { frames: 1 }, &profile, &tx)
            .await;
        assert!(first.is_some());
        let late_timeout = exec
            .finish(&mut handle, Ending::TimedOut { frames: 1 }, &profile, &tx)
            .await;
        assert!(late_timeout.is_none());
        drop(tx);

        let mut messages = Vec::new();
        while let Some(m) = rx.recv().await {
            messages.push(m);
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::End);
        assert_eq!(handle.teardown_count(), 1);
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_every_path_tears_down_once() {
        let cases: Vec<(MockEngine, u64)> = vec![
            (MockEngine::new().with_frames(&[(Channel::Stdout, "a")]), 5_000),
            (MockEngine::new().hanging(), 30),
            (
                MockEngine::new().with_stream_error("reset"),
                5_000,
            ),
            (
                MockEngine::new().with_start_failure(EngineError::Api {
                    status: 500,
                    message: "x".to_string(),
                }),
                5_000,
            ),
        ];

        for (engine, timeout_ms) in cases {
            run(&engine, &quick(Language::Python, timeout_ms), "x").await;
            assert_eq!(engine.create_count(), 1);
            assert_eq!(engine.stop_count(), 1);
            assert_eq!(engine.remove_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_registry_profile_is_used() {
        let registry = LanguageRegistry::new();
        let engine = MockEngine::new();
        let profile = registry.resolve("cpp").unwrap();
        run(&engine, profile, "int main(){}").await;

        let spec = engine.last_spec().unwrap();
        assert_eq!(spec.image, "gcc:13");
        assert_eq!(spec.labels["codeheaven.language"], "cpp");
    }
}
