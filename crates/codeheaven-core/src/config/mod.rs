//! Configuration for the execution service
//!
//! YAML files are loaded by [`ConfigLoader`], then environment overrides are
//! applied and the result is validated.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
