//! Telemetry gathering
//!
//! Standing listeners on the [`LineRouter`] pick temperatures, positions,
//! fan speeds and print progress out of whatever the printer says, whether
//! in answer to our polling G-codes or spontaneously (heating reports). A
//! poller enqueues the polling G-codes at a fixed interval.
//!
//! Values accumulate in a current snapshot; [`TelemetryGatherer::take_telemetry`]
//! hands out the previous complete one and starts a new one.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::TelemetrySettings;
use crate::error::{BridgeError, BridgeResult};
use crate::queue::{InstructionQueue, InstructionStatus};
use crate::router::{literal_regex, LineRouter, ListenerId};
use crate::shutdown::Shutdown;
use crate::state::{PrinterState, StateMachine};
use crate::transport::LinkStatus;

static TEMPERATURE_REGEX: Lazy<Regex> = Lazy::new(|| {
    literal_regex(r"^ok\s?T:(-?\d+\.\d+) /(-?\d+\.\d+) B:(-?\d+\.\d+) /(-?\d+\.\d+)")
});
static POSITION_REGEX: Lazy<Regex> = Lazy::new(|| {
    literal_regex(
        r"^X:(-?\d+\.\d+) Y:(-?\d+\.\d+) Z:(-?\d+\.\d+) E:(-?\d+\.\d+) Count X: ?(-?\d+\.\d+) Y:(-?\d+\.\d+) Z:(-?\d+\.\d+)",
    )
});
static E_FAN_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"E0:(\d+) ?RPM"));
static P_FAN_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"PRN1:(\d+) ?RPM"));
static PRINT_TIME_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^(Not SD printing)$|^((\d+):(\d{2}))$"));
static PROGRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^NORMAL MODE: Percent done: (-?\d+);"));
static SILENT_TIME_REMAINING_REGEX: Lazy<Regex> = Lazy::new(|| {
    literal_regex(r"^SILENT MODE: Percent done: (-?\d+); print time remaining in mins: (-?\d+)")
});
static NORMAL_TIME_REMAINING_REGEX: Lazy<Regex> = Lazy::new(|| {
    literal_regex(r"^NORMAL MODE: Percent done: (-?\d+); print time remaining in mins: (-?\d+)")
});
static HEATING_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^T:(\d+\.\d+) E:\d+ B:(\d+\.\d+)$"));
static HEATING_HOTEND_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^T:(\d+\.\d+) E:([?]|\d+) W:(\d+|[?])$"));

/// Which of the two remaining-time estimates M73 prints is used.
///
/// The firmware reports one line for normal and one for silent mode, and
/// the active mode is not known here. Silent mode runs slower, so its
/// estimate is the conservative default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRemainingPolicy {
    /// Use the silent mode estimate
    #[default]
    Silent,
    /// Use the normal mode estimate
    Normal,
}

impl TimeRemainingPolicy {
    fn pattern(self) -> &'static Lazy<Regex> {
        match self {
            TimeRemainingPolicy::Silent => &SILENT_TIME_REMAINING_REGEX,
            TimeRemainingPolicy::Normal => &NORMAL_TIME_REMAINING_REGEX,
        }
    }
}

/// One telemetry snapshot. Unknown values are left out when serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    /// Nozzle temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_nozzle: Option<f64>,
    /// Bed temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_bed: Option<f64>,
    /// Nozzle target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_nozzle: Option<f64>,
    /// Bed target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bed: Option<f64>,
    /// X position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_x: Option<f64>,
    /// Y position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_y: Option<f64>,
    /// Z position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_z: Option<f64>,
    /// Extruder fan RPM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_extruder: Option<u32>,
    /// Print fan RPM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_print: Option<u32>,
    /// Percent done
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Seconds since the print started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_printing: Option<u64>,
    /// Seconds until the print is expected to end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_estimated: Option<u64>,
    /// Reported printer state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PrinterState>,
    /// When the snapshot was handed out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Snapshots {
    current: Telemetry,
    last: Telemetry,
}

type Update = fn(&mut Telemetry, &Captures<'_>);

fn listen(
    router: &LineRouter,
    snapshots: &Arc<Mutex<Snapshots>>,
    pattern: &Regex,
    update: Update,
) -> ListenerId {
    let snapshots = Arc::clone(snapshots);
    router.register_listener(pattern.clone(), move |caps| {
        update(&mut snapshots.lock().current, caps);
    })
}

fn parse<T: FromStr>(caps: &Captures<'_>, group: usize) -> Option<T> {
    caps.get(group).and_then(|m| m.as_str().parse().ok())
}

/// Collects telemetry from printer output.
pub struct TelemetryGatherer {
    queue: Arc<InstructionQueue>,
    state: Arc<StateMachine>,
    gcodes: Vec<String>,
    snapshots: Arc<Mutex<Snapshots>>,
    listeners: Vec<ListenerId>,
}

impl TelemetryGatherer {
    /// Register the telemetry listeners on `router`.
    pub fn new(
        queue: Arc<InstructionQueue>,
        state: Arc<StateMachine>,
        router: &LineRouter,
        settings: &TelemetrySettings,
    ) -> Arc<Self> {
        let snapshots = Arc::new(Mutex::new(Snapshots::default()));

        let listeners = vec![
            listen(router, &snapshots, &TEMPERATURE_REGEX, |t, caps| {
                if let (Some(nozzle), Some(target_nozzle), Some(bed), Some(target_bed)) =
                    (parse(caps, 1), parse(caps, 2), parse(caps, 3), parse(caps, 4))
                {
                    t.temp_nozzle = Some(nozzle);
                    t.target_nozzle = Some(target_nozzle);
                    t.temp_bed = Some(bed);
                    t.target_bed = Some(target_bed);
                }
            }),
            listen(router, &snapshots, &POSITION_REGEX, |t, caps| {
                t.axis_x = parse(caps, 5);
                t.axis_y = parse(caps, 6);
                t.axis_z = parse(caps, 7);
            }),
            listen(router, &snapshots, &E_FAN_REGEX, |t, caps| t.fan_extruder = parse(caps, 1)),
            listen(router, &snapshots, &P_FAN_REGEX, |t, caps| t.fan_print = parse(caps, 1)),
            listen(router, &snapshots, &PRINT_TIME_REGEX, |t, caps| {
                if caps.get(2).is_some() {
                    if let (Some(hours), Some(mins)) = (parse::<u64>(caps, 3), parse::<u64>(caps, 4)) {
                        t.time_printing = hours
                            .checked_mul(3600)
                            .and_then(|secs| secs.checked_add(mins * 60));
                    }
                }
            }),
            listen(router, &snapshots, &PROGRESS_REGEX, |t, caps| {
                if let Some(progress) = parse::<i64>(caps, 1) {
                    if (0..=100).contains(&progress) {
                        t.progress = u8::try_from(progress).ok();
                    }
                }
            }),
            listen(router, &snapshots, settings.time_remaining_mode.pattern(), |t, caps| {
                if let Some(mins) = parse::<i64>(caps, 2) {
                    if mins >= 0 {
                        t.time_estimated = mins
                            .checked_mul(60)
                            .and_then(|secs| u64::try_from(secs).ok());
                    }
                }
            }),
            listen(router, &snapshots, &HEATING_REGEX, |t, caps| {
                t.temp_nozzle = parse(caps, 1);
                t.temp_bed = parse(caps, 2);
            }),
            listen(router, &snapshots, &HEATING_HOTEND_REGEX, |t, caps| t.temp_nozzle = parse(caps, 1)),
        ];

        Arc::new(Self {
            queue,
            state,
            gcodes: settings.gcodes.clone(),
            snapshots,
            listeners,
        })
    }

    /// Ids of the registered listeners.
    pub fn listener_ids(&self) -> &[ListenerId] {
        &self.listeners
    }

    /// The snapshot being filled right now.
    pub fn current(&self) -> Telemetry {
        self.snapshots.lock().current.clone()
    }

    /// Return the previous snapshot and start a new one.
    ///
    /// `state` is stamped in; progress and times are dropped unless a print
    /// is running or paused.
    pub fn take_telemetry(&self, state: PrinterState) -> Telemetry {
        let mut telemetry = {
            let mut snapshots = self.snapshots.lock();
            let fresh = std::mem::take(&mut snapshots.current);
            std::mem::replace(&mut snapshots.last, fresh)
        };
        telemetry.state = Some(state);
        telemetry.timestamp = Some(Utc::now());
        if !matches!(state, PrinterState::Printing | PrinterState::Paused) {
            telemetry.progress = None;
            telemetry.time_printing = None;
            telemetry.time_estimated = None;
        }
        telemetry
    }

    /// Enqueue the polling G-codes and wait until each has a verdict.
    ///
    /// A printer that lets a polling G-code time out is busy with something
    /// else; the state machine is told so.
    pub async fn poll_once(&self) -> BridgeResult<()> {
        let handles = self.queue.enqueue_list(self.gcodes.iter().cloned());
        for handle in handles {
            let outcome = handle.wait().await?;
            match outcome.status {
                InstructionStatus::Confirmed => {}
                InstructionStatus::TimedOut => {
                    tracing::debug!(
                        gcode = %handle.text(),
                        "Telemetry G-code timed out waiting for the printer"
                    );
                    self.state.busy();
                }
                status => tracing::debug!(
                    gcode = %handle.text(),
                    ?status,
                    "Telemetry G-code was not confirmed"
                ),
            }
        }
        Ok(())
    }

    /// Poll every `interval` while the link is open, until shutdown.
    pub fn spawn_poller(
        self: Arc<Self>,
        interval: Duration,
        link: watch::Receiver<LinkStatus>,
        shutdown: Shutdown,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }
                if !link.borrow().is_open() {
                    tracing::trace!("Printer unreachable, skipping telemetry round");
                    continue;
                }
                match self.poll_once().await {
                    Ok(()) => {}
                    Err(BridgeError::ShuttingDown) => break,
                    Err(e) => tracing::warn!(error = %e, "Telemetry round failed"),
                }
            }
            tracing::debug!("Telemetry poller stopped");
        })
    }

    /// Reset progress and print time when a print starts.
    pub fn watch_state(self: &Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let mut transitions = self.state.subscribe();
        let snapshots = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.wait() => break,
                    received = transitions.recv() => received,
                };
                match received {
                    Ok(transition) => {
                        if transition.to == PrinterState::Printing
                            && matches!(transition.from, PrinterState::Ready | PrinterState::Busy)
                        {
                            let mut snapshots = snapshots.lock();
                            snapshots.current.progress = Some(0);
                            snapshots.current.time_printing = Some(0);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Telemetry missed state changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        for pattern in [
            &TEMPERATURE_REGEX,
            &POSITION_REGEX,
            &E_FAN_REGEX,
            &P_FAN_REGEX,
            &PRINT_TIME_REGEX,
            &PROGRESS_REGEX,
            &SILENT_TIME_REMAINING_REGEX,
            &NORMAL_TIME_REMAINING_REGEX,
            &HEATING_REGEX,
            &HEATING_HOTEND_REGEX,
        ] {
            Lazy::force(pattern);
        }
    }

    #[test]
    fn test_sample_lines_match() {
        let temps = TEMPERATURE_REGEX
            .captures("ok T:210.3 /210.0 B:60.1 /60.0 T0:210.3 /210.0 @:42 B@:12 P:35.2 A:39.1")
            .unwrap();
        assert_eq!(parse::<f64>(&temps, 3), Some(60.1));

        let position = POSITION_REGEX
            .captures("X:10.00 Y:20.00 Z:0.20 E:0.00 Count X: 10.05 Y:20.01 Z:0.20 E:0.00")
            .unwrap();
        assert_eq!(parse::<f64>(&position, 5), Some(10.05));

        assert!(PRINT_TIME_REGEX.is_match("Not SD printing"));
        let time = PRINT_TIME_REGEX.captures("1:05").unwrap();
        assert_eq!(parse::<u64>(&time, 3), Some(1));
        assert_eq!(parse::<u64>(&time, 4), Some(5));

        assert!(HEATING_HOTEND_REGEX.is_match("T:180.5 E:0 W:?"));
        assert!(HEATING_REGEX.is_match("T:180.5 E:0 B:55.0"));
        assert!(!HEATING_REGEX.is_match("ok T:180.5 E:0 B:55.0"));
    }
}
