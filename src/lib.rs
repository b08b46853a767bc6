//! Core library for the printer_bridge agent.
//!
//! The agent sits between a G-code printer on a serial line and an upstream
//! service. Bytes flow through these layers:
//!
//! - [`transport`]: owns the serial link, reopens it when it fails and turns
//!   the incoming byte stream into lines.
//! - [`router`]: hands each line to the instruction queue's matcher and to
//!   pattern listeners.
//! - [`queue`]: sends instructions one at a time and decides, from the
//!   printer's answers, whether each was confirmed, rejected or timed out.
//! - [`state`]: tracks the reported printer state and attributes
//!   transitions to the command that caused them.
//! - [`inference`]: moves the state machine on what the printer reports by
//!   itself (busy, print done, errors, resets).
//! - [`command`] and [`events`]: run upstream commands and report their
//!   outcome.
//! - [`telemetry`]: polls and collects temperatures, positions and print
//!   progress; [`info`] asks the printer about firmware and model.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod inference;
pub mod info;
pub mod logging;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use queue::{InstructionHandle, InstructionQueue, InstructionStatus};
pub use router::LineRouter;
pub use shutdown::Shutdown;
pub use state::{PrinterState, StateMachine};
pub use transport::Transport;
