//! Printer state machine
//!
//! The reported state is layered:
//!
//! ```text
//! reported = override (Error | Attention)
//!          | printing sub-state (Printing | Paused | Finished | Stopped)
//!          | base (Ready | Busy)
//! ```
//!
//! Setters change one layer and publish a [`StateTransition`] only when the
//! reported state actually changes. A command that is about to cause a
//! transition registers an [`ExpectedChange`] first; the next transition into
//! one of its target states carries the command's id and source. Other
//! transitions are published without attribution.
//!
//! All setters serialize on one mutex, so transitions are published in the
//! order they happened.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{BridgeError, BridgeResult};

const TRANSITION_CAPACITY: usize = 64;

/// States the printer can be reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrinterState {
    /// Idle and able to take work
    Ready,
    /// Working on something other than a print (homing, heating, ...)
    Busy,
    /// A print is running
    Printing,
    /// A print is paused
    Paused,
    /// The last print completed
    Finished,
    /// The last print was stopped
    Stopped,
    /// The printer reported an error
    Error,
    /// The printer needs a human
    Attention,
}

impl PrinterState {
    /// `Error` and `Attention` take precedence over everything else.
    pub fn is_override(self) -> bool {
        matches!(self, PrinterState::Error | PrinterState::Attention)
    }

    /// States that belong to the printing sub-state layer.
    pub fn is_print_stage(self) -> bool {
        matches!(
            self,
            PrinterState::Printing
                | PrinterState::Paused
                | PrinterState::Finished
                | PrinterState::Stopped
        )
    }

    /// Upper-case name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            PrinterState::Ready => "READY",
            PrinterState::Busy => "BUSY",
            PrinterState::Printing => "PRINTING",
            PrinterState::Paused => "PAUSED",
            PrinterState::Finished => "FINISHED",
            PrinterState::Stopped => "STOPPED",
            PrinterState::Error => "ERROR",
            PrinterState::Attention => "ATTENTION",
        }
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    /// A command from the cloud
    Cloud,
    /// The printer firmware on its own
    Firmware,
    /// Something typed on the serial line
    Serial,
    /// Someone at the printer
    User,
}

/// A transition a command is about to cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChange {
    /// Id of the command that will cause it
    pub command_id: u64,
    /// Where the command came from
    pub source: Source,
    /// States the transition may lead to
    pub targets: HashSet<PrinterState>,
}

impl ExpectedChange {
    /// Expect `command_id` from `source` to lead to one of `targets`.
    pub fn new(
        command_id: u64,
        source: Source,
        targets: impl IntoIterator<Item = PrinterState>,
    ) -> Self {
        Self {
            command_id,
            source,
            targets: targets.into_iter().collect(),
        }
    }
}

/// Published on every change of the reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Reported state before
    pub from: PrinterState,
    /// Reported state after
    pub to: PrinterState,
    /// Command the transition is attributed to
    pub command_id: Option<u64>,
    /// Source the transition is attributed to
    pub source: Option<Source>,
}

#[derive(Debug)]
struct Inner {
    base: PrinterState,
    printing: Option<PrinterState>,
    override_state: Option<PrinterState>,
    last_state: PrinterState,
    expected: Option<ExpectedChange>,
}

impl Inner {
    fn current(&self) -> PrinterState {
        self.printing.unwrap_or(self.base)
    }

    fn reported(&self) -> PrinterState {
        self.override_state.unwrap_or_else(|| self.current())
    }
}

/// Single source of truth for the printer's state.
pub struct StateMachine {
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Ready`.
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                base: PrinterState::Ready,
                printing: None,
                override_state: None,
                last_state: PrinterState::Ready,
                expected: None,
            }),
            transitions,
        }
    }

    /// Subscribe to transition notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// The override state if set, else the current state.
    pub fn get_state(&self) -> PrinterState {
        self.inner.lock().reported()
    }

    /// The state ignoring any override.
    pub fn current_state(&self) -> PrinterState {
        self.inner.lock().current()
    }

    /// The current state before the last change of it.
    pub fn last_state(&self) -> PrinterState {
        self.inner.lock().last_state
    }

    /// The override state, if any.
    pub fn override_state(&self) -> Option<PrinterState> {
        self.inner.lock().override_state
    }

    /// The printing sub-state, if any.
    pub fn printing_state(&self) -> Option<PrinterState> {
        self.inner.lock().printing
    }

    /// Whether a print is running or paused.
    pub fn is_printing(&self) -> bool {
        matches!(
            self.inner.lock().printing,
            Some(PrinterState::Printing | PrinterState::Paused)
        )
    }

    /// The outstanding expectation, if any.
    pub fn expected(&self) -> Option<ExpectedChange> {
        self.inner.lock().expected.clone()
    }

    /// Register the transition a command is about to cause.
    ///
    /// Only one expectation may be outstanding; a second one is logged and
    /// ignored, leaving the first in place.
    pub fn expect_change(&self, change: ExpectedChange) -> BridgeResult<()> {
        let mut inner = self.inner.lock();
        if let Some(outstanding) = &inner.expected {
            tracing::warn!(
                outstanding = outstanding.command_id,
                requested = change.command_id,
                "Tried to expect a state change while another one is outstanding"
            );
            return Err(BridgeError::ExpectationConflict {
                outstanding: outstanding.command_id,
            });
        }
        tracing::debug!(
            command_id = change.command_id,
            source = ?change.source,
            targets = ?change.targets,
            "Expecting state change"
        );
        inner.expected = Some(change);
        Ok(())
    }

    /// Like [`expect_change`](Self::expect_change), returning a guard that
    /// clears the expectation when dropped.
    pub fn expect_change_scoped(
        self: &Arc<Self>,
        change: ExpectedChange,
    ) -> BridgeResult<ExpectationGuard> {
        let command_id = change.command_id;
        self.expect_change(change)?;
        Ok(ExpectationGuard {
            state: Arc::clone(self),
            command_id,
        })
    }

    /// Clear the expectation, whether or not it was met.
    pub fn stop_expecting_change(&self) {
        if let Some(expected) = self.inner.lock().expected.take() {
            tracing::debug!(command_id = expected.command_id, "Stopped expecting state change");
        }
    }

    fn stop_expecting_for(&self, command_id: u64) {
        let mut inner = self.inner.lock();
        if inner
            .expected
            .as_ref()
            .is_some_and(|expected| expected.command_id == command_id)
        {
            inner.expected = None;
            tracing::debug!(command_id, "Stopped expecting state change");
        }
    }

    /// Idle. Also closes a finished or stopped print.
    pub fn ready(&self) -> Option<StateTransition> {
        self.apply(|inner| {
            inner.base = PrinterState::Ready;
            if matches!(
                inner.printing,
                Some(PrinterState::Finished | PrinterState::Stopped)
            ) {
                inner.printing = None;
            }
        })
    }

    /// Working, but not printing.
    pub fn busy(&self) -> Option<StateTransition> {
        self.apply(|inner| inner.base = PrinterState::Busy)
    }

    /// A print is running.
    pub fn printing(&self) -> Option<StateTransition> {
        self.apply(|inner| inner.printing = Some(PrinterState::Printing))
    }

    /// The print is paused.
    pub fn paused(&self) -> Option<StateTransition> {
        self.apply(|inner| inner.printing = Some(PrinterState::Paused))
    }

    /// The print completed.
    pub fn finished(&self) -> Option<StateTransition> {
        self.apply(|inner| inner.printing = Some(PrinterState::Finished))
    }

    /// The print was stopped.
    pub fn stopped(&self) -> Option<StateTransition> {
        self.apply(|inner| inner.printing = Some(PrinterState::Stopped))
    }

    /// Report `state` (`Error` or `Attention`) in place of the current state.
    pub fn set_override(&self, state: PrinterState) -> BridgeResult<Option<StateTransition>> {
        if !state.is_override() {
            tracing::warn!(state = %state, "Refusing to use a regular state as override");
            return Err(BridgeError::InvalidOverride(state));
        }
        Ok(self.apply(|inner| inner.override_state = Some(state)))
    }

    /// Report the current state again.
    pub fn clear_override(&self) -> Option<StateTransition> {
        self.apply(|inner| inner.override_state = None)
    }

    fn apply(&self, change: impl FnOnce(&mut Inner)) -> Option<StateTransition> {
        let mut inner = self.inner.lock();
        let from = inner.reported();
        let previous = inner.current();

        change(&mut inner);

        if inner.current() != previous {
            inner.last_state = previous;
        }
        let to = inner.reported();
        if from == to {
            return None;
        }

        let (command_id, source) = match &inner.expected {
            Some(expected) if expected.targets.contains(&to) => {
                (Some(expected.command_id), Some(expected.source))
            }
            _ => (None, None),
        };
        let transition = StateTransition {
            from,
            to,
            command_id,
            source,
        };
        tracing::info!(
            from = %from,
            to = %to,
            command_id = ?command_id,
            source = ?source,
            "Printer state changed"
        );
        // Sent under the lock so subscribers see transitions in order.
        let _ = self.transitions.send(transition.clone());
        Some(transition)
    }
}

/// Clears its expectation when dropped.
#[must_use = "the expectation is cleared as soon as the guard is dropped"]
pub struct ExpectationGuard {
    state: Arc<StateMachine>,
    command_id: u64,
}

impl ExpectationGuard {
    /// Command the guarded expectation belongs to.
    pub fn command_id(&self) -> u64 {
        self.command_id
    }
}

impl Drop for ExpectationGuard {
    fn drop(&mut self) {
        self.state.stop_expecting_for(self.command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printing_expected(command_id: u64) -> ExpectedChange {
        ExpectedChange::new(command_id, Source::Cloud, [PrinterState::Printing])
    }

    #[test]
    fn test_unattributed_transition() {
        let state = StateMachine::new();
        let mut rx = state.subscribe();

        let transition = state.printing().unwrap();
        assert_eq!(transition.from, PrinterState::Ready);
        assert_eq!(transition.to, PrinterState::Printing);
        assert_eq!(transition.command_id, None);
        assert_eq!(transition.source, None);
        assert_eq!(rx.try_recv().unwrap(), transition);
    }

    #[test]
    fn test_attributed_transition() {
        let state = StateMachine::new();
        state.expect_change(printing_expected(7)).unwrap();

        let transition = state.printing().unwrap();
        assert_eq!(transition.command_id, Some(7));
        assert_eq!(transition.source, Some(Source::Cloud));
    }

    #[test]
    fn test_transition_outside_targets_is_unattributed() {
        let state = StateMachine::new();
        state.expect_change(printing_expected(7)).unwrap();

        let transition = state.busy().unwrap();
        assert_eq!(transition.to, PrinterState::Busy);
        assert_eq!(transition.command_id, None);

        // The expectation survives until explicitly cleared.
        let transition = state.printing().unwrap();
        assert_eq!(transition.command_id, Some(7));
        state.stop_expecting_change();
        assert!(state.expected().is_none());
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_second_expectation_is_ignored() {
        let state = StateMachine::new();
        state.expect_change(printing_expected(1)).unwrap();

        let result = state.expect_change(printing_expected(2));
        assert!(matches!(
            result,
            Err(BridgeError::ExpectationConflict { outstanding: 1 })
        ));
        assert_eq!(state.expected().unwrap().command_id, 1);
        assert!(logs_contain("another one is outstanding"));
    }

    #[test]
    fn test_no_notification_without_change() {
        let state = StateMachine::new();
        let mut rx = state.subscribe();
        assert!(state.ready().is_none());
        state.busy();
        assert!(state.busy().is_none());
        assert_eq!(rx.try_recv().unwrap().to, PrinterState::Busy);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_override_hides_current_state() {
        let state = StateMachine::new();
        state.printing();

        let transition = state.set_override(PrinterState::Attention).unwrap().unwrap();
        assert_eq!(transition.from, PrinterState::Printing);
        assert_eq!(state.get_state(), PrinterState::Attention);
        assert_eq!(state.current_state(), PrinterState::Printing);

        // Changes underneath an override are not reported.
        assert!(state.paused().is_none());

        let transition = state.clear_override().unwrap();
        assert_eq!(transition.to, PrinterState::Paused);
    }

    #[test]
    fn test_set_override_rejects_regular_states() {
        let state = StateMachine::new();
        assert!(matches!(
            state.set_override(PrinterState::Busy),
            Err(BridgeError::InvalidOverride(PrinterState::Busy))
        ));
        assert_eq!(state.get_state(), PrinterState::Ready);
    }

    #[test]
    fn test_print_layer_and_last_state() {
        let state = StateMachine::new();
        state.busy();
        state.printing();
        assert_eq!(state.last_state(), PrinterState::Busy);
        assert!(state.is_printing());

        // Busy during a print does not hide it.
        assert!(state.busy().is_none());
        assert_eq!(state.get_state(), PrinterState::Printing);

        state.finished();
        assert!(!state.is_printing());
        let transition = state.ready().unwrap();
        assert_eq!(transition.from, PrinterState::Finished);
        assert_eq!(transition.to, PrinterState::Ready);
        assert_eq!(state.printing_state(), None);
    }

    #[test]
    fn test_scoped_expectation() {
        let state = Arc::new(StateMachine::new());
        {
            let guard = state.expect_change_scoped(printing_expected(3)).unwrap();
            assert_eq!(guard.command_id(), 3);
            assert!(state.expect_change_scoped(printing_expected(4)).is_err());
            assert_eq!(state.expected().unwrap().command_id, 3);
        }
        assert!(state.expected().is_none());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PrinterState::Attention.to_string(), "ATTENTION");
        assert_eq!(
            serde_json::to_string(&PrinterState::Printing).unwrap(),
            "\"PRINTING\""
        );
        assert!(PrinterState::Error.is_override());
        assert!(!PrinterState::Finished.is_override());
        assert!(PrinterState::Stopped.is_print_stage());
    }
}
