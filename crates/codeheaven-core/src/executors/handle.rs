//! Per-request execution state.
//!
//! An [`ExecutionHandle`] is owned by the task running one request. Natural
//! end of output, the timeout, a client disconnect and an engine fault all
//! end the request through [`ExecutionHandle::terminate`]; only the first
//! call wins and receives the container to tear down.

use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    Completed,
    TimedOut,
    Aborted,
    Failed,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Completed => "completed",
            TerminalState::TimedOut => "timed_out",
            TerminalState::Aborted => "aborted",
            TerminalState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Provisioning,
    Running,
    Terminated(TerminalState),
}

/// Resources released by the winning [`ExecutionHandle::terminate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub outcome: TerminalState,
    pub container_id: Option<String>,
}

#[derive(Debug)]
pub struct ExecutionHandle {
    id: String,
    session_id: String,
    state: ExecutionState,
    container_id: Option<String>,
    deadline: Option<Instant>,
    teardowns: usize,
}

impl ExecutionHandle {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            session_id: session_id.into(),
            state: ExecutionState::Idle,
            container_id: None,
            deadline: None,
            teardowns: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, ExecutionState::Terminated(_))
    }

    /// Number of times teardown was handed out. Never exceeds one.
    pub fn teardown_count(&self) -> usize {
        self.teardowns
    }

    pub fn begin_provisioning(&mut self) -> bool {
        self.advance(ExecutionState::Idle, ExecutionState::Provisioning)
    }

    /// Arm the execution timer. Returns the deadline.
    pub fn arm_timer(&mut self, timeout: Duration) -> Instant {
        let deadline = Instant::now() + timeout;
        if !self.is_terminated() {
            self.deadline = Some(deadline);
        }
        deadline
    }

    /// Record the container created for this execution.
    pub fn attach_container(&mut self, container_id: impl Into<String>) {
        if !self.is_terminated() {
            self.container_id = Some(container_id.into());
        }
    }

    pub fn begin_running(&mut self) -> bool {
        self.advance(ExecutionState::Provisioning, ExecutionState::Running)
    }

    /// Move to a terminal state.
    ///
    /// Returns the teardown work on the first call and `None` on every call
    /// after that. The timer is disarmed either way.
    pub fn terminate(&mut self, outcome: TerminalState) -> Option<Teardown> {
        self.deadline = None;
        if self.is_terminated() {
            return None;
        }
        self.state = ExecutionState::Terminated(outcome);
        self.teardowns += 1;
        Some(Teardown {
            outcome,
            container_id: self.container_id.take(),
        })
    }

    fn advance(&mut self, from: ExecutionState, to: ExecutionState) -> bool {
        if self.state == from {
            self.state = to;
            true
        } else {
            log::debug!(
                "Execution {} ignored transition {:?} -> {:?} while {:?}",
                self.id,
                from,
                to,
                self.state
            );
            false
        }
    }
}
