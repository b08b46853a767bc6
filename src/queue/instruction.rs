//! A single line sent to the printer and its verdict.
//!
//! Status only moves forward:
//!
//! ```text
//! Pending -> Sent -> Confirmed | MatchFailed | TimedOut
//! Pending -> TimedOut            (shutdown before dispatch)
//! ```
//!
//! The current [`InstructionOutcome`] lives in a `watch` channel so any
//! number of waiters can observe the terminal transition.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::error::{BridgeError, BridgeResult};
use crate::router::literal_regex;
use crate::shutdown::Shutdown;

/// Generic acknowledgment: `ok` alone or followed by a space and a payload.
static ACK_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^ok(?:\s|$)"));

/// Whether `line` is a generic acknowledgment.
pub(crate) fn is_ack(line: &str) -> bool {
    ACK_REGEX.is_match(line)
}

/// Where an instruction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionStatus {
    /// Queued, not written yet
    Pending,
    /// Written, waiting for a verdict
    Sent,
    /// Acknowledged (or its completion pattern matched)
    Confirmed,
    /// The printer reported a rejection
    MatchFailed,
    /// No verdict before the deadline, or the link failed meanwhile
    TimedOut,
}

impl InstructionStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstructionStatus::Confirmed | InstructionStatus::MatchFailed | InstructionStatus::TimedOut
        )
    }
}

/// Snapshot of an instruction's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionOutcome {
    /// Current status
    pub status: InstructionStatus,
    /// The line that decided the verdict
    pub response: Option<String>,
    /// Capture groups 1.. of the completion pattern, unmatched groups as `None`
    pub captures: Vec<Option<String>>,
    /// Token reported by the rejection pattern
    pub rejection: Option<String>,
}

impl InstructionOutcome {
    fn pending() -> Self {
        Self {
            status: InstructionStatus::Pending,
            response: None,
            captures: Vec::new(),
            rejection: None,
        }
    }

    /// Capture group `index` (1-based, like the pattern), if it participated.
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.captures.get(i))
            .and_then(|c| c.as_deref())
    }
}

/// What to enqueue: the text plus optional completion pattern and deadline.
#[derive(Debug, Clone)]
pub struct InstructionSpec {
    pub(crate) text: String,
    pub(crate) completion: Option<Regex>,
    pub(crate) timeout: Option<Duration>,
}

impl InstructionSpec {
    /// Instruction completed by a generic acknowledgment.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completion: None,
            timeout: None,
        }
    }

    /// Complete only when a line matches `pattern`.
    pub fn with_completion(mut self, pattern: Regex) -> Self {
        self.completion = Some(pattern);
        self
    }

    /// Override the queue's default verdict deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub(crate) struct Instruction {
    id: u64,
    text: String,
    completion: Option<Regex>,
    timeout: Duration,
    outcome: watch::Sender<InstructionOutcome>,
    /// Fired when the `ok` trailing a non-`ok` verdict arrives.
    trailing_ack: Notify,
}

impl Instruction {
    pub(crate) fn new(id: u64, spec: InstructionSpec, default_timeout: Duration) -> Self {
        let (outcome, _) = watch::channel(InstructionOutcome::pending());
        Self {
            id,
            text: spec.text,
            completion: spec.completion,
            timeout: spec.timeout.unwrap_or(default_timeout),
            outcome,
            trailing_ack: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn completion(&self) -> Option<&Regex> {
        self.completion.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn status(&self) -> InstructionStatus {
        self.outcome.borrow().status
    }

    pub(crate) fn outcome(&self) -> InstructionOutcome {
        self.outcome.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<InstructionOutcome> {
        self.outcome.subscribe()
    }

    /// Bytes put on the wire.
    pub(crate) fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 1);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes.push(b'\n');
        bytes
    }

    pub(crate) fn mark_sent(&self) -> bool {
        self.outcome.send_if_modified(|o| {
            if o.status == InstructionStatus::Pending {
                o.status = InstructionStatus::Sent;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn confirm(&self, line: &str, captures: Option<&Captures<'_>>) -> bool {
        let groups = captures
            .map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        self.outcome.send_if_modified(|o| {
            if o.status != InstructionStatus::Sent {
                return false;
            }
            o.status = InstructionStatus::Confirmed;
            o.response = Some(line.to_string());
            o.captures = groups;
            true
        })
    }

    pub(crate) fn reject(&self, line: &str, token: String) -> bool {
        self.outcome.send_if_modified(|o| {
            if o.status != InstructionStatus::Sent {
                return false;
            }
            o.status = InstructionStatus::MatchFailed;
            o.response = Some(line.to_string());
            o.rejection = Some(token);
            true
        })
    }

    pub(crate) fn time_out(&self) -> bool {
        self.outcome.send_if_modified(|o| {
            if o.status.is_terminal() {
                return false;
            }
            o.status = InstructionStatus::TimedOut;
            true
        })
    }

    /// Decided by a line other than `ok`; the printer still owes its `ok`.
    pub(crate) fn owes_ack(&self) -> bool {
        let outcome = self.outcome.borrow();
        matches!(
            outcome.status,
            InstructionStatus::Confirmed | InstructionStatus::MatchFailed
        ) && !outcome.response.as_deref().is_some_and(is_ack)
    }

    pub(crate) fn note_trailing_ack(&self) {
        self.trailing_ack.notify_one();
    }

    pub(crate) async fn trailing_ack(&self) {
        self.trailing_ack.notified().await;
    }
}

/// Caller's view of an enqueued instruction.
#[derive(Clone)]
pub struct InstructionHandle {
    inner: Arc<Instruction>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for InstructionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionHandle")
            .field("id", &self.inner.id)
            .field("text", &self.inner.text)
            .field("status", &self.status())
            .finish()
    }
}

impl InstructionHandle {
    pub(crate) fn new(inner: Arc<Instruction>, shutdown: Shutdown) -> Self {
        Self { inner, shutdown }
    }

    /// Queue-assigned id; increases in enqueue order.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// The instruction text, without terminator.
    pub fn text(&self) -> &str {
        self.inner.text()
    }

    /// Current status.
    pub fn status(&self) -> InstructionStatus {
        self.inner.status()
    }

    /// Current outcome snapshot.
    pub fn outcome(&self) -> InstructionOutcome {
        self.inner.outcome()
    }

    /// Wait for a terminal status.
    ///
    /// Returns [`BridgeError::ShuttingDown`] if shutdown comes first.
    pub async fn wait(&self) -> BridgeResult<InstructionOutcome> {
        let mut rx = self.inner.subscribe();
        let terminal = async {
            rx.wait_for(|o| o.status.is_terminal())
                .await
                .map(|o| (*o).clone())
        };
        tokio::select! {
            biased;
            outcome = terminal => outcome.map_err(|_| BridgeError::ShuttingDown),
            _ = self.shutdown.wait() => Err(BridgeError::ShuttingDown),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `deadline`.
    ///
    /// Giving up does not remove the instruction; it keeps its place in the
    /// queue and still gets a verdict.
    pub async fn wait_timeout(&self, deadline: Duration) -> BridgeResult<InstructionOutcome> {
        match tokio::time::timeout(deadline, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::InstructionTimeout {
                instruction: self.inner.text().to_string(),
                waited: deadline,
            }),
        }
    }

    /// Wait for a terminal status and turn anything but `Confirmed` into an error.
    pub async fn confirmed(&self) -> BridgeResult<InstructionOutcome> {
        let outcome = self.wait().await?;
        match outcome.status {
            InstructionStatus::Confirmed => Ok(outcome),
            InstructionStatus::MatchFailed => Err(BridgeError::InstructionRejected {
                instruction: self.inner.text().to_string(),
                token: outcome.rejection.unwrap_or_default(),
            }),
            _ => Err(BridgeError::InstructionTimeout {
                instruction: self.inner.text().to_string(),
                waited: self.inner.timeout(),
            }),
        }
    }
}
