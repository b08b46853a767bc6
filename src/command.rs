//! Command execution
//!
//! A command is a unit of work requested from upstream: start a print, run a
//! G-code, report information. Each one is a [`CommandHandler`] that drives
//! the printer through the [`InstructionQueue`] and the [`StateMachine`].
//! [`CommandContext::execute`] runs one handler at a time and reports the
//! outcome as events:
//!
//! - `FINISHED` when the handler completed,
//! - `REJECTED` with a reason when it failed,
//! - `ACCEPTED` from handlers that take long, while they keep running.
//!
//! A handler that causes a state change registers the expectation before
//! acting, so the transition is attributed to its command id.
//!
//! ```rust,ignore
//! let ctx = CommandContext::new(queue, state, events, transport.link_status(), shutdown, &settings);
//! ctx.execute(42, &ExecuteGcode::new("G28")).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{watch, Mutex};

use crate::config::CommandSettings;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{Event, EventKind, EventSink};
use crate::info::InfoGatherer;
use crate::queue::{InstructionQueue, InstructionSpec, InstructionStatus};
use crate::router::literal_regex;
use crate::shutdown::Shutdown;
use crate::state::{ExpectationGuard, ExpectedChange, PrinterState, Source, StateMachine};
use crate::transport::LinkStatus;

/// Answer to `M23`: group 1 on success, group 2 on failure.
static OPEN_RESULT_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^(File opened.*)$|^(open failed.*)$"));

const SD_CARD_PREFIX: &str = "/SD Card/";

/// How a handler finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Report `FINISHED`
    Finished,
    /// The handler already reported everything it had to
    Silent,
}

/// One kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Carry the command out.
    ///
    /// Precondition failures are returned as [`BridgeError::CommandRejected`];
    /// their message becomes the rejection reason.
    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion>;
}

/// Everything a handler may touch.
pub struct CommandContext {
    queue: Arc<InstructionQueue>,
    state: Arc<StateMachine>,
    events: Arc<dyn EventSink>,
    link: watch::Receiver<LinkStatus>,
    shutdown: Shutdown,
    ack_window: Duration,
    long_gcode_timeout: Duration,
    running: Mutex<()>,
}

impl CommandContext {
    /// Context over the running queue and state machine.
    pub fn new(
        queue: Arc<InstructionQueue>,
        state: Arc<StateMachine>,
        events: Arc<dyn EventSink>,
        link: watch::Receiver<LinkStatus>,
        shutdown: Shutdown,
        settings: &CommandSettings,
    ) -> Self {
        Self {
            queue,
            state,
            events,
            link,
            shutdown,
            ack_window: Duration::from_millis(settings.ack_window_ms),
            long_gcode_timeout: Duration::from_millis(settings.long_gcode_timeout_ms),
            running: Mutex::new(()),
        }
    }

    /// The instruction queue.
    pub fn queue(&self) -> &Arc<InstructionQueue> {
        &self.queue
    }

    /// The printer state machine.
    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// Whether the serial link is up right now.
    pub fn link_open(&self) -> bool {
        self.link.borrow().is_open()
    }

    /// Send `event` upstream.
    pub fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    /// Run `handler` for `command_id` and report how it went.
    ///
    /// Commands run one at a time; a second call waits for the first. The
    /// returned error is the one already reported as `REJECTED`.
    pub async fn execute(&self, command_id: u64, handler: &dyn CommandHandler) -> BridgeResult<()> {
        let _running = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return Err(BridgeError::ShuttingDown),
            guard = self.running.lock() => guard,
        };
        tracing::info!(command = handler.name(), command_id, "Executing command");

        match handler.run(self, command_id).await {
            Ok(Completion::Finished) => {
                tracing::info!(command = handler.name(), command_id, "Command finished");
                self.emit(Event::new(EventKind::Finished).with_command_id(command_id));
                Ok(())
            }
            Ok(Completion::Silent) => Ok(()),
            Err(BridgeError::ShuttingDown) => {
                tracing::debug!(command = handler.name(), command_id, "Command abandoned on shutdown");
                Err(BridgeError::ShuttingDown)
            }
            Err(e) => {
                let reason = rejection_reason(&e);
                tracing::warn!(command = handler.name(), command_id, %reason, "Command rejected");
                self.emit(
                    Event::new(EventKind::Rejected)
                        .with_command_id(command_id)
                        .with_reason(reason),
                );
                Err(e)
            }
        }
    }

    /// Enqueue `spec` and insist on `Confirmed`.
    async fn step(&self, spec: InstructionSpec) -> BridgeResult<()> {
        self.queue.enqueue_with(spec).confirmed().await.map(|_| ())
    }

    /// Register the transition a command is about to cause.
    ///
    /// A conflicting expectation is logged by the state machine and leaves the
    /// transition unattributed; it does not stop the command.
    fn expect(
        &self,
        command_id: u64,
        targets: impl IntoIterator<Item = PrinterState>,
    ) -> Option<ExpectationGuard> {
        self.state
            .expect_change_scoped(ExpectedChange::new(command_id, Source::Cloud, targets))
            .ok()
    }
}

fn rejection_reason(error: &BridgeError) -> String {
    match error {
        BridgeError::CommandRejected(reason) => reason.clone(),
        other => other.to_string(),
    }
}

fn rejected(reason: impl Into<String>) -> BridgeError {
    BridgeError::CommandRejected(reason.into())
}

/// Path of `path` relative to the SD card, if it points at one.
pub fn sd_card_file(path: &str) -> Option<&str> {
    path.strip_prefix(SD_CARD_PREFIX)
        .filter(|rest| !rest.is_empty())
}

/// Select a file on the SD card and start printing it.
#[derive(Debug, Clone)]
pub struct StartPrint {
    path: String,
}

impl StartPrint {
    /// Print the file at `path`, e.g. `/SD Card/benchy.gco`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CommandHandler for StartPrint {
    fn name(&self) -> &'static str {
        "start_print"
    }

    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion> {
        if ctx.state.is_printing() {
            return Err(rejected("Already printing"));
        }
        if ctx.state.override_state().is_some() {
            return Err(rejected(format!(
                "Cannot print in {} state.",
                ctx.state.get_state()
            )));
        }

        let _expectation = ctx.expect(command_id, [PrinterState::Printing]);

        let file = sd_card_file(&self.path)
            .ok_or_else(|| rejected("Only files on the SD card can be printed"))?;
        // The firmware lists SD files in lower case.
        let file_name = file.to_lowercase();

        let opened = ctx
            .queue
            .enqueue_with(
                InstructionSpec::new(format!("M23 {file_name}"))
                    .with_completion(OPEN_RESULT_REGEX.clone()),
            )
            .confirmed()
            .await?;
        if opened.group(1).is_none() {
            return Err(rejected(format!(
                "Wrong file name, or bad file. File name: {file_name}"
            )));
        }

        ctx.step(InstructionSpec::new("M24")).await?;
        ctx.state.printing();
        Ok(Completion::Finished)
    }
}

/// Pause the running print.
#[derive(Debug, Clone, Copy, Default)]
pub struct PausePrint;

#[async_trait]
impl CommandHandler for PausePrint {
    fn name(&self) -> &'static str {
        "pause_print"
    }

    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion> {
        if ctx.state.printing_state() != Some(PrinterState::Printing) {
            return Err(rejected("Not printing"));
        }
        let _expectation = ctx.expect(command_id, [PrinterState::Paused]);
        ctx.step(InstructionSpec::new("M601")).await?;
        ctx.state.paused();
        Ok(Completion::Finished)
    }
}

/// Resume a paused print.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumePrint;

#[async_trait]
impl CommandHandler for ResumePrint {
    fn name(&self) -> &'static str {
        "resume_print"
    }

    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion> {
        if ctx.state.printing_state() != Some(PrinterState::Paused) {
            return Err(rejected("Print is not paused"));
        }
        let _expectation = ctx.expect(command_id, [PrinterState::Printing]);
        ctx.step(InstructionSpec::new("M602")).await?;
        ctx.state.printing();
        Ok(Completion::Finished)
    }
}

/// Stop the running or paused print.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopPrint;

#[async_trait]
impl CommandHandler for StopPrint {
    fn name(&self) -> &'static str {
        "stop_print"
    }

    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion> {
        if !ctx.state.is_printing() {
            return Err(rejected("Not printing"));
        }
        let _expectation = ctx.expect(command_id, [PrinterState::Stopped]);
        ctx.step(InstructionSpec::new("M603")).await?;
        ctx.state.stopped();
        Ok(Completion::Finished)
    }
}

/// Send one G-code line verbatim.
///
/// A G-code that is not confirmed within the acknowledgment window is
/// reported as `ACCEPTED` and followed until it finishes or the long timeout
/// runs out.
#[derive(Debug, Clone)]
pub struct ExecuteGcode {
    gcode: String,
}

impl ExecuteGcode {
    /// Execute `gcode`.
    pub fn new(gcode: impl Into<String>) -> Self {
        Self {
            gcode: gcode.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for ExecuteGcode {
    fn name(&self) -> &'static str {
        "execute_gcode"
    }

    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion> {
        if ctx.state.override_state().is_some() || !ctx.link_open() {
            ctx.state.busy();
            return Err(rejected("Printer looks busy"));
        }

        let handle = ctx.queue.enqueue_with(
            InstructionSpec::new(self.gcode.clone()).with_timeout(ctx.long_gcode_timeout),
        );

        let outcome = match handle.wait_timeout(ctx.ack_window).await {
            Ok(outcome) => outcome,
            Err(BridgeError::InstructionTimeout { .. }) => {
                ctx.emit(Event::new(EventKind::Accepted).with_command_id(command_id));
                let outcome = handle.wait().await?;
                if outcome.status == InstructionStatus::TimedOut {
                    tracing::error!(
                        command_id,
                        gcode = %self.gcode,
                        "G-code did not finish in time"
                    );
                    return Ok(Completion::Silent);
                }
                outcome
            }
            Err(e) => return Err(e),
        };

        match outcome.status {
            InstructionStatus::Confirmed => Ok(Completion::Finished),
            InstructionStatus::MatchFailed => {
                Err(rejected(format!("Unknown command '{}'", self.gcode)))
            }
            _ => Err(rejected("Printer did not respond")),
        }
    }
}

/// Report what is known about the printer.
///
/// Firmware version and printer type are asked from the printer while the
/// link is up; caller-supplied values are merged over the gathered ones.
#[derive(Debug, Clone, Default)]
pub struct SendInfo {
    extra: serde_json::Map<String, serde_json::Value>,
}

impl SendInfo {
    /// Report the gathered info only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also report `values`, e.g. a serial number known upstream.
    pub fn with_values(values: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { extra: values }
    }
}

#[async_trait]
impl CommandHandler for SendInfo {
    fn name(&self) -> &'static str {
        "send_info"
    }

    async fn run(&self, ctx: &CommandContext, command_id: u64) -> BridgeResult<Completion> {
        let gatherer = InfoGatherer::new(Arc::clone(&ctx.queue), Arc::clone(&ctx.state));
        let info = if ctx.link_open() {
            gatherer.gather().await?
        } else {
            tracing::debug!(command_id, "Printer unreachable, reporting local info only");
            gatherer.local_only().await
        };

        let mut values = serde_json::to_value(&info)
            .map_err(|e| rejected(format!("Cannot encode printer info: {e}")))?;
        if let Some(fields) = values.as_object_mut() {
            fields.extend(self.extra.clone());
        }
        ctx.emit(
            Event::new(EventKind::Info)
                .with_command_id(command_id)
                .with_state(info.state)
                .with_values(values),
        );
        Ok(Completion::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd_card_file() {
        assert_eq!(sd_card_file("/SD Card/Benchy.gco"), Some("Benchy.gco"));
        assert_eq!(sd_card_file("/SD Card/dir/part.gco"), Some("dir/part.gco"));
        assert_eq!(sd_card_file("/SD Card/"), None);
        assert_eq!(sd_card_file("/local/benchy.gco"), None);
        assert_eq!(sd_card_file("benchy.gco"), None);
    }

    #[test]
    fn test_open_result_groups() {
        let opened = OPEN_RESULT_REGEX
            .captures("File opened: benchy.gco Size: 1234")
            .unwrap();
        assert!(opened.get(1).is_some());
        assert!(opened.get(2).is_none());

        let failed = OPEN_RESULT_REGEX.captures("open failed, File: nope.gco.").unwrap();
        assert!(failed.get(1).is_none());
        assert!(failed.get(2).is_some());

        assert!(!OPEN_RESULT_REGEX.is_match("echo:Now fresh file: benchy.gco"));
    }

    #[test]
    fn test_rejection_reason_is_verbatim_for_precondition_failures() {
        assert_eq!(rejection_reason(&rejected("Already printing")), "Already printing");
        let timeout = BridgeError::InstructionRejected {
            instruction: "M24".to_string(),
            token: "Unknown command".to_string(),
        };
        assert_eq!(rejection_reason(&timeout), "Printer rejected 'M24': Unknown command");
    }
}
