//! State inference from printer output
//!
//! The firmware tells a lot about what it is doing without being asked:
//! busy keep-alives while homing or heating, a line when an SD print is done,
//! host action notifications when someone pauses or cancels at the printer,
//! `start` after a reset. [`StateInference`] registers a listener for each of
//! those on the [`LineRouter`] and moves the [`StateMachine`] accordingly.
//!
//! | Printer says | Reaction |
//! |---|---|
//! | `ok` | attention cleared, then `ready()` |
//! | `echo:busy: processing` | attention cleared, then `busy()` |
//! | `echo:busy: paused for user` | `Attention` override |
//! | `Error:Printer stopped ...` / `Error:Printer halted ...` | `Error` override |
//! | `Done printing file` | `finished()` |
//! | `// action:paused` / `resumed` / `cancel` | `paused()` / `printing()` / `stopped()` |
//! | `start` | override cleared, print stopped, `ready()` |
//!
//! Transitions inferred here are attributed like any other: to the command
//! whose expectation is outstanding, if the new state is one of its targets.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::router::{literal_regex, LineRouter, ListenerId};
use crate::state::{PrinterState, StateMachine};

static OK_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^ok\b"));
static BUSY_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^echo:busy: processing$"));
static ATTENTION_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^echo:busy: paused for user$"));
static ERROR_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^Error:Printer (stopped|halted)"));
static PRINT_DONE_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^Done printing file$"));
static PAUSED_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^// action:paused$"));
static RESUMED_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^// action:resumed$"));
static CANCEL_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^// action:cancel$"));
static BOOT_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^start$"));

type Reaction = fn(&StateMachine);

fn react(
    router: &LineRouter,
    state: &Arc<StateMachine>,
    pattern: &Regex,
    reaction: Reaction,
) -> ListenerId {
    let state = Arc::clone(state);
    router.register_listener(pattern.clone(), move |caps| {
        tracing::trace!(line = &caps[0], "Inferring printer state");
        reaction(&state);
    })
}

fn set_override(state: &StateMachine, override_state: PrinterState) {
    if let Err(e) = state.set_override(override_state) {
        tracing::warn!(error = %e, "Could not report the printer's override state");
    }
}

fn clear_attention(state: &StateMachine) {
    if state.override_state() == Some(PrinterState::Attention) {
        state.clear_override();
    }
}

fn on_ok(state: &StateMachine) {
    clear_attention(state);
    state.ready();
}

fn on_busy(state: &StateMachine) {
    clear_attention(state);
    state.busy();
}

fn on_paused(state: &StateMachine) {
    if state.printing_state() == Some(PrinterState::Printing) {
        state.paused();
    }
}

fn on_resumed(state: &StateMachine) {
    if state.printing_state() == Some(PrinterState::Paused) {
        state.printing();
    }
}

fn on_cancel(state: &StateMachine) {
    if state.is_printing() {
        state.stopped();
    }
}

// A reset ends whatever the printer was doing.
fn on_boot(state: &StateMachine) {
    tracing::info!("Printer (re)started");
    state.clear_override();
    if state.is_printing() {
        state.stopped();
    } else {
        state.ready();
    }
}

/// Listeners keeping the state machine in line with what the printer says.
pub struct StateInference {
    listeners: Vec<ListenerId>,
}

impl StateInference {
    /// Register the inference listeners on `router`.
    pub fn install(router: &LineRouter, state: &Arc<StateMachine>) -> Self {
        let listeners = vec![
            react(router, state, &OK_REGEX, on_ok),
            react(router, state, &BUSY_REGEX, on_busy),
            react(router, state, &ATTENTION_REGEX, |state| {
                set_override(state, PrinterState::Attention);
            }),
            react(router, state, &ERROR_REGEX, |state| {
                set_override(state, PrinterState::Error);
            }),
            react(router, state, &PRINT_DONE_REGEX, |state| {
                state.finished();
            }),
            react(router, state, &PAUSED_REGEX, on_paused),
            react(router, state, &RESUMED_REGEX, on_resumed),
            react(router, state, &CANCEL_REGEX, on_cancel),
            react(router, state, &BOOT_REGEX, on_boot),
        ];
        tracing::debug!(listeners = listeners.len(), "State inference installed");
        Self { listeners }
    }

    /// Ids of the registered listeners.
    pub fn listener_ids(&self) -> &[ListenerId] {
        &self.listeners
    }

    /// Remove the listeners from `router`.
    pub fn uninstall(self, router: &LineRouter) {
        for id in self.listeners {
            router.unregister_listener(id);
        }
    }
}
