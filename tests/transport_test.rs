//! Serial transport recovery, control line and decoding against a mock printer.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use printer_bridge::queue::InstructionStatus;
use printer_bridge::BridgeError;
use printer_bridge::transport::mock::MockConnector;
use printer_bridge::transport::{LinkEvent, LinkState};
use regex::Regex;
use tracing_test::traced_test;

use common::{eventually, queue_config, within, Harness};

#[tokio::test]
async fn test_link_failure_mid_dispatch_times_out_and_reconnects() {
    let (mut harness, mut device) = Harness::start().await;
    let mut events = harness.transport.subscribe_events();

    let interrupted = harness.queue.enqueue("G28", None);
    let next = harness.queue.enqueue("M105", None);
    assert_eq!(within(device.read_line()).await.as_deref(), Some("G28"));

    harness.connector.fail_next(1);
    device.disconnect();

    let outcome = within(interrupted.wait()).await.unwrap();
    assert_eq!(outcome.status, InstructionStatus::TimedOut);

    // The next instruction goes out on the renewed link only.
    let mut renewed = harness.next_device().await;
    assert_eq!(within(renewed.read_line()).await.as_deref(), Some("M105"));
    renewed.send_line("ok").await.unwrap();
    assert_eq!(
        within(next.wait()).await.unwrap().status,
        InstructionStatus::Confirmed
    );

    assert_eq!(within(events.recv()).await.unwrap(), LinkEvent::Failed);
    assert_eq!(within(events.recv()).await.unwrap(), LinkEvent::Renewed);
    assert_eq!(harness.connector.attempts(), 3);

    let status = *harness.transport.link_status().borrow();
    assert_eq!(status.state, LinkState::Open);
    assert_eq!(status.generation, 2);
    harness.stop().await;
}

#[tokio::test]
async fn test_write_goes_through_after_disconnect() {
    let (mut harness, device) = Harness::start().await;

    device.disconnect();
    within(harness.transport.write(b"M105\n")).await.unwrap();

    let mut renewed = harness.next_device().await;
    assert_eq!(within(renewed.read_line()).await.as_deref(), Some("M105"));
    harness.stop().await;
}

#[tokio::test]
async fn test_reset_pulses_dtr() {
    let (harness, device) = Harness::start().await;

    within(harness.transport.reset_via_control_line())
        .await
        .unwrap();
    assert_eq!(device.dtr_history(), vec![false, true]);
    harness.stop().await;
}

#[tokio::test]
#[traced_test]
async fn test_undecodable_line_is_dropped() {
    let (harness, mut device) = Harness::start().await;

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = Arc::clone(&hits);
        harness
            .router
            .register_listener(Regex::new(".+").unwrap(), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
    }

    device.send_raw(b"T:\xff\xfe\n").await.unwrap();
    device.send_line("T:180.5 E:0 W:?").await.unwrap();

    eventually(|| hits.load(Ordering::SeqCst) == 1).await;
    assert!(logs_contain("Failed decoding a message from the printer"));
    assert!(harness.transport.link_status().borrow().is_open());
    harness.stop().await;
}

#[tokio::test]
#[traced_test]
async fn test_start_retries_until_the_port_opens() {
    let (connector, devices) = MockConnector::new();
    connector.fail_next(2);

    let (harness, _device) = Harness::start_with(connector, devices, queue_config()).await;
    assert_eq!(harness.connector.attempts(), 3);
    assert!(logs_contain("Opening of the serial port failed. Retrying..."));
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_the_link() {
    let (harness, mut device) = Harness::start().await;
    let transport = harness.transport.clone();

    harness.stop().await;
    assert_eq!(transport.link_status().borrow().state, LinkState::Closed);
    assert_eq!(within(device.read_line()).await, None);
}

#[tokio::test]
async fn test_blocked_write_aborts_on_shutdown() {
    let (harness, _device) = Harness::start().await;
    let transport = harness.transport.clone();

    // The printer never reads, so the pipe fills up and the write stalls.
    let mut message = vec![b'G'; 16 * 1024];
    message.push(b'\n');
    let write = tokio::spawn(async move { transport.write(&message).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!write.is_finished());

    harness.shutdown.trigger();
    let result = within(write).await.unwrap();
    assert!(matches!(result, Err(BridgeError::ShuttingDown)));
    assert_eq!(harness.connector.attempts(), 1);
    harness.stop().await;
}
