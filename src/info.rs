//! Printer information
//!
//! Answers to "what is connected": firmware version, printer model and the
//! address the agent is reachable at. Firmware and model are asked from the
//! printer through the [`InstructionQueue`]; a query the printer does not
//! answer in time means it is busy, and the state machine is told so.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::net::UdpSocket;

use crate::error::BridgeResult;
use crate::queue::{InstructionOutcome, InstructionQueue, InstructionSpec, InstructionStatus};
use crate::router::literal_regex;
use crate::state::{PrinterState, StateMachine};

static FIRMWARE_REGEX: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"^FIRMWARE_NAME:Prusa-Firmware ?((\d+\.)*\d).*$"));
static PRINTER_TYPE_REGEX: Lazy<Regex> = Lazy::new(|| literal_regex(r"^(\d{3,5})$"));

// Any routable address works; connecting a UDP socket sends nothing.
const ROUTE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 255, 255, 255), 1);

/// Model name for a printer type code reported by `M862.2 Q`.
pub fn printer_model(code: u16) -> Option<&'static str> {
    let model = match code {
        250 => "MK2.5",
        20250 => "MK2.5 MMU2",
        252 => "MK2.5S",
        20252 => "MK2.5S MMU2S",
        300 => "MK3",
        20300 => "MK3 MMU2",
        302 => "MK3S",
        20302 => "MK3S MMU2S",
        _ => return None,
    };
    Some(model)
}

/// What is known about the connected printer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterInfo {
    /// Reported printer state
    pub state: PrinterState,
    /// Firmware version, e.g. `3.10.0`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Printer type code, e.g. `302`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printer_type: Option<u16>,
    /// Model name derived from the type code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printer_model: Option<&'static str>,
    /// Local address of this host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpAddr>,
}

impl PrinterInfo {
    /// Nothing known beyond the state.
    pub fn new(state: PrinterState) -> Self {
        Self {
            state,
            firmware: None,
            printer_type: None,
            printer_model: None,
            local_ip: None,
        }
    }
}

/// Asks the printer about itself.
pub struct InfoGatherer {
    queue: Arc<InstructionQueue>,
    state: Arc<StateMachine>,
}

impl InfoGatherer {
    /// Gatherer over the running queue.
    pub fn new(queue: Arc<InstructionQueue>, state: Arc<StateMachine>) -> Self {
        Self { queue, state }
    }

    /// Query firmware and printer type, and look up the local address.
    pub async fn gather(&self) -> BridgeResult<PrinterInfo> {
        let firmware = self
            .ask("M115", &FIRMWARE_REGEX)
            .await?
            .and_then(|outcome| outcome.group(1).map(str::to_string));
        let printer_type = self
            .ask("M862.2 Q", &PRINTER_TYPE_REGEX)
            .await?
            .and_then(|outcome| outcome.group(1).and_then(|code| code.parse::<u16>().ok()));

        let mut info = self.local_only().await;
        info.firmware = firmware;
        info.printer_type = printer_type;
        info.printer_model = printer_type.and_then(printer_model);
        Ok(info)
    }

    /// What can be told without the printer.
    pub async fn local_only(&self) -> PrinterInfo {
        let mut info = PrinterInfo::new(self.state.get_state());
        info.local_ip = local_ip().await;
        info
    }

    async fn ask(&self, gcode: &str, answer: &Regex) -> BridgeResult<Option<InstructionOutcome>> {
        let handle = self
            .queue
            .enqueue_with(InstructionSpec::new(gcode).with_completion(answer.clone()));
        let outcome = handle.wait().await?;
        match outcome.status {
            InstructionStatus::Confirmed => Ok(Some(outcome)),
            InstructionStatus::TimedOut => {
                tracing::debug!(gcode, "Info query timed out waiting for the printer");
                self.state.busy();
                Ok(None)
            }
            status => {
                tracing::debug!(gcode, ?status, "Printer did not answer info query");
                Ok(None)
            }
        }
    }
}

/// Address of the interface the default route goes through.
pub async fn local_ip() -> Option<IpAddr> {
    let lookup = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(ROUTE_TARGET).await?;
        socket.local_addr()
    };
    match lookup.await {
        Ok(addr) if !addr.ip().is_unspecified() => Some(addr.ip()),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Failed getting the local IP, are we connected to LAN?");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_version() {
        let caps = FIRMWARE_REGEX
            .captures(
                "FIRMWARE_NAME:Prusa-Firmware 3.10.0 based on Marlin FIRMWARE_URL:https://github.com/prusa3d/Prusa-Firmware PROTOCOL_VERSION:1.0 MACHINE_TYPE:Prusa i3 MK3S EXTRUDER_COUNT:1",
            )
            .unwrap();
        assert_eq!(&caps[1], "3.10.0");
        assert!(!FIRMWARE_REGEX.is_match("FIRMWARE_NAME:Marlin 2.1.2"));
    }

    #[test]
    fn test_printer_type() {
        assert!(PRINTER_TYPE_REGEX.is_match("302"));
        assert!(PRINTER_TYPE_REGEX.is_match("20302"));
        assert!(!PRINTER_TYPE_REGEX.is_match("ok"));
        assert_eq!(printer_model(302), Some("MK3S"));
        assert_eq!(printer_model(20250), Some("MK2.5 MMU2"));
        assert_eq!(printer_model(100), None);
    }

    #[test]
    fn test_info_json_skips_unknowns() {
        let info = PrinterInfo {
            firmware: Some("3.10.0".to_string()),
            ..PrinterInfo::new(PrinterState::Ready)
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({ "state": "READY", "firmware": "3.10.0" })
        );
    }
}
