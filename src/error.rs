//! Custom error types for the bridge.
//!
//! This module defines the primary error type, `BridgeError`, shared by every
//! component of the crate. Using the `thiserror` crate, it gives one consistent
//! way to report what can go wrong between the agent and the printer, from
//! configuration problems to a printer that never answers.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps [`ConfigError`], produced while loading or validating
//!   the layered configuration.
//! - **`Io`**: Wraps `std::io::Error` from the serial link.
//! - **`Decode`**: A line from the printer was not valid UTF-8. The line is
//!   logged and dropped; the link stays up.
//! - **`LinkLost`**: The link failed while an instruction was being written.
//!   The payload is not replayed on the renewed link.
//! - **`InstructionTimeout`** / **`InstructionRejected`**: The two non-success
//!   verdicts an instruction can reach, surfaced to callers that asked for a
//!   `Result` instead of inspecting the status themselves.
//! - **`ExpectationConflict`** / **`InvalidOverride`**: Misuse of the state
//!   machine. They are logged and the call is ignored.
//! - **`CommandRejected`**: A command precondition failed; the message is sent
//!   back to the requester verbatim.
//! - **`ShuttingDown`**: Returned by every blocking call once shutdown starts.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::state::PrinterState;

/// Convenience alias for results using the bridge error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Undecodable line from the printer: {0}")]
    Decode(#[from] std::str::Utf8Error),

    #[error("Serial link lost while sending '{0}'")]
    LinkLost(String),

    #[error("Gave up waiting for '{instruction}' after {waited:?}")]
    InstructionTimeout { instruction: String, waited: Duration },

    #[error("Printer rejected '{instruction}': {token}")]
    InstructionRejected { instruction: String, token: String },

    #[error("A state change is already expected for command {outstanding}")]
    ExpectationConflict { outstanding: u64 },

    #[error("{0} is not an override state")]
    InvalidOverride(PrinterState),

    #[error("{0}")]
    CommandRejected(String),

    #[error("Shutting down")]
    ShuttingDown,
}

impl BridgeError {
    /// Whether the error only means the process is going away.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, BridgeError::ShuttingDown)
    }
}
