//! Wire types for the CodeHeaven execution protocol.
//!
//! A client sends one [`ExecutionRequest`] per message over a WebSocket and
//! receives a sequence of [`ClientMessage`]s: `system` notices, `output` and
//! `error` frames while the program runs, and a final `end` or `error`.

pub mod messages;
pub mod request;

pub use messages::{ClientMessage, MessageType};
pub use request::ExecutionRequest;
