//! Upstream notifications.
//!
//! Command handlers report their progress as [`Event`]s and every state
//! transition becomes a `STATE_CHANGED` event. Where events go is decided by
//! the [`EventSink`]; delivering them to a remote service is out of scope,
//! the binary logs them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::shutdown::Shutdown;
use crate::state::{PrinterState, Source, StateMachine};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The command was taken and is still running
    Accepted,
    /// The command could not be carried out
    Rejected,
    /// The command completed
    Finished,
    /// Answer to an information request
    Info,
    /// The printer's reported state changed
    StateChanged,
}

/// One notification for upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Kind of event
    pub event: EventKind,
    /// Command the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
    /// Human-readable explanation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Printer state, for state changes and info
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PrinterState>,
    /// Attributed source of a state change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Free-form payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

impl Event {
    /// Bare event of `kind`.
    pub fn new(kind: EventKind) -> Self {
        Self {
            event: kind,
            command_id: None,
            reason: None,
            state: None,
            source: None,
            values: None,
        }
    }

    /// Attach a command id.
    pub fn with_command_id(mut self, command_id: u64) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a state.
    pub fn with_state(mut self, state: PrinterState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach a source.
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach a payload.
    pub fn with_values(mut self, values: serde_json::Value) -> Self {
        self.values = Some(values);
        self
    }
}

/// Destination of events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: Event);
}

/// Sink that forwards events over an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Sink plus the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver is gone, dropping event");
        }
    }
}

/// Sink that logs events as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(event = %json, "Event"),
            Err(e) => tracing::error!(error = %e, ?event, "Failed to serialize event"),
        }
    }
}

/// Turn every state transition into a `STATE_CHANGED` event until shutdown.
pub fn forward_state_changes(
    state: &StateMachine,
    sink: Arc<dyn EventSink>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    let mut transitions = state.subscribe();
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.wait() => break,
                received = transitions.recv() => received,
            };
            match received {
                Ok(transition) => {
                    let mut event = Event::new(EventKind::StateChanged).with_state(transition.to);
                    if let Some(command_id) = transition.command_id {
                        event = event.with_command_id(command_id);
                    }
                    if let Some(source) = transition.source {
                        event = event.with_source(source);
                    }
                    sink.emit(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "State change events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExpectedChange;
    use std::time::Duration;

    #[test]
    fn test_event_json_skips_empty_fields() {
        let event = Event::new(EventKind::Rejected)
            .with_command_id(12)
            .with_reason("Already printing");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "REJECTED",
                "command_id": 12,
                "reason": "Already printing"
            })
        );
    }

    #[tokio::test]
    async fn test_state_changes_are_forwarded() {
        let state = StateMachine::new();
        let (sink, mut rx) = ChannelSink::new();
        let shutdown = Shutdown::new();
        let task = forward_state_changes(&state, Arc::new(sink), shutdown.clone());

        state.busy();
        state
            .expect_change(ExpectedChange::new(7, Source::Cloud, [PrinterState::Printing]))
            .unwrap();
        state.printing();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event, EventKind::StateChanged);
        assert_eq!(first.state, Some(PrinterState::Busy));
        assert_eq!(first.command_id, None);

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.state, Some(PrinterState::Printing));
        assert_eq!(second.command_id, Some(7));
        assert_eq!(second.source, Some(Source::Cloud));

        shutdown.trigger();
        task.await.unwrap();
    }
}
