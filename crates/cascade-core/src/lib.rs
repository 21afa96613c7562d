//! Envelope protocol, configuration, and errors shared by every Cascade stage.

pub mod config;
pub mod error;
pub mod protocol;

pub use error::{CascadeError, Result};
pub use protocol::{Envelope, MessageType, Payload, Source};
