//! Sandboxed code execution for the CodeHeaven editor.
//!
//! A request names a language and carries source code. The orchestrator picks
//! an execution profile for the language, runs the code in a locked-down
//! throwaway container and streams the program's output back frame by frame.
//!
//! - **Language registry**: language ids, aliases, images and timeouts
//! - **Executors**: the container engine boundary and the per-request state machine
//! - **Demultiplexer**: decoding of the engine's combined stdout/stderr stream
//! - **Formatter**: cleanup of terminal escapes and compiler diagnostics
//! - **Configuration**: YAML settings with environment overrides

pub mod config;
pub mod demux;
pub mod errors;
pub mod executors;
pub mod formatter;
pub mod languages;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::*;
pub use errors::{ConfigError, EngineError, ExecutionError, RegistryError};
pub use executors::docker::DockerEngine;
pub use executors::{ContainerEngine, ExecutionReport, Outbound, SandboxExecutor, TerminalState};
pub use languages::{ExecutionProfile, Language, LanguageRegistry};
