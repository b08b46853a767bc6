//! Instruction queue against a mock printer.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use printer_bridge::queue::InstructionStatus;
use printer_bridge::transport::mock::always_ok;
use printer_bridge::BridgeError;
use regex::Regex;

use common::{eventually, queue_config, within, Harness};

#[tokio::test]
async fn test_instructions_are_sent_in_order_and_confirmed() {
    let (harness, device) = Harness::start().await;
    let printer = device.spawn_responder(always_ok);

    let handles = harness.queue.enqueue_list(["G28", "G1 X10", "M105"]);
    for handle in &handles {
        let outcome = within(handle.wait()).await.unwrap();
        assert_eq!(outcome.status, InstructionStatus::Confirmed);
        assert_eq!(outcome.response.as_deref(), Some("ok"));
    }
    assert!(handles.windows(2).all(|pair| pair[0].id() < pair[1].id()));

    harness.stop().await;
    let received = within(printer).await.unwrap();
    assert_eq!(received, vec!["G28", "G1 X10", "M105"]);
}

#[tokio::test]
async fn test_at_most_one_instruction_in_flight() {
    let (harness, mut device) = Harness::start().await;

    let mut producers = Vec::new();
    for task in 0..4 {
        let queue = harness.queue.clone();
        producers.push(tokio::spawn(async move {
            let handles: Vec<_> = (0..5)
                .map(|n| queue.enqueue(format!("M117 t{task} n{n}"), None))
                .collect();
            for handle in handles {
                handle.wait().await.unwrap();
            }
        }));
    }

    let mut seen: HashMap<String, Vec<u32>> = HashMap::new();
    for _ in 0..20 {
        let line = within(device.read_line()).await.unwrap();
        // Nothing else may be written before this one is answered.
        assert!(
            tokio::time::timeout(Duration::from_millis(30), device.read_line())
                .await
                .is_err(),
            "second instruction sent while '{line}' was in flight"
        );
        let mut parts = line.split_whitespace().skip(1);
        let task = parts.next().unwrap().to_string();
        let n: u32 = parts.next().unwrap()[1..].parse().unwrap();
        seen.entry(task).or_default().push(n);
        device.send_line("ok").await.unwrap();
    }

    for producer in producers {
        within(producer).await.unwrap();
    }
    assert_eq!(seen.len(), 4);
    for sequence in seen.values() {
        assert_eq!(sequence, &vec![0, 1, 2, 3, 4]);
    }
    harness.stop().await;
}

#[tokio::test]
async fn test_rejection_then_trailing_ok_is_not_misattributed() {
    let (harness, mut device) = Harness::start().await;

    let unknown = harness.queue.enqueue("M9999", None);
    let temperature = harness.queue.enqueue("M105", None);

    assert_eq!(within(device.read_line()).await.as_deref(), Some("M9999"));
    device
        .send_line("echo:Unknown command: \"M9999\"")
        .await
        .unwrap();
    device.send_line("ok").await.unwrap();

    let outcome = within(unknown.wait()).await.unwrap();
    assert_eq!(outcome.status, InstructionStatus::MatchFailed);
    assert_eq!(outcome.rejection.as_deref(), Some("Unknown command"));
    assert!(matches!(
        within(unknown.confirmed()).await,
        Err(BridgeError::InstructionRejected { .. })
    ));

    assert_eq!(within(device.read_line()).await.as_deref(), Some("M105"));
    assert_eq!(temperature.status(), InstructionStatus::Sent);
    device
        .send_line("ok T:210.0 /210.0 B:60.0 /60.0")
        .await
        .unwrap();

    let outcome = within(temperature.wait()).await.unwrap();
    assert_eq!(outcome.status, InstructionStatus::Confirmed);
    assert_eq!(
        outcome.response.as_deref(),
        Some("ok T:210.0 /210.0 B:60.0 /60.0")
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_completion_pattern_captures_groups() {
    let (harness, mut device) = Harness::start().await;

    let progress = harness.queue.enqueue(
        "M27",
        Some(Regex::new(r"^SD printing byte (\d+)/(\d+)$").unwrap()),
    );
    let next = harness.queue.enqueue("M105", None);

    assert_eq!(within(device.read_line()).await.as_deref(), Some("M27"));
    device.send_line("echo:busy: processing").await.unwrap();
    device.send_line("SD printing byte 10/200").await.unwrap();
    device.send_line("ok").await.unwrap();

    let outcome = within(progress.wait()).await.unwrap();
    assert_eq!(outcome.status, InstructionStatus::Confirmed);
    assert_eq!(outcome.group(1), Some("10"));
    assert_eq!(outcome.group(2), Some("200"));

    // The trailing ok belonged to M27.
    assert_eq!(within(device.read_line()).await.as_deref(), Some("M105"));
    assert_eq!(next.status(), InstructionStatus::Sent);
    device.send_line("ok").await.unwrap();
    assert_eq!(
        within(next.wait()).await.unwrap().status,
        InstructionStatus::Confirmed
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_wait_deadline_leaves_instruction_queued() {
    let (harness, mut device) = Harness::start().await;

    let result = harness
        .queue
        .enqueue_and_wait("G28", None, Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(BridgeError::InstructionTimeout { .. })));
    assert_eq!(harness.queue.len(), 1);

    assert_eq!(within(device.read_line()).await.as_deref(), Some("G28"));
    assert_eq!(
        harness.queue.statuses().first().map(|(_, status)| *status),
        Some(InstructionStatus::Sent)
    );
    device.send_line("ok").await.unwrap();

    let queue = harness.queue.clone();
    eventually(move || queue.is_empty()).await;
    harness.stop().await;
}

#[tokio::test]
async fn test_unanswered_instruction_times_out_and_queue_advances() {
    let mut config = queue_config();
    config.instruction_timeout = Duration::from_millis(100);
    let (harness, mut device) = Harness::start_with_queue(config).await;

    let silent = harness.queue.enqueue("M400", None);
    let answered = harness.queue.enqueue("M105", None);

    assert_eq!(within(device.read_line()).await.as_deref(), Some("M400"));
    assert_eq!(within(device.read_line()).await.as_deref(), Some("M105"));
    device.send_line("ok").await.unwrap();

    assert_eq!(
        within(silent.wait()).await.unwrap().status,
        InstructionStatus::TimedOut
    );
    assert_eq!(
        within(answered.wait()).await.unwrap().status,
        InstructionStatus::Confirmed
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_unblocks_waiters() {
    let (harness, mut device) = Harness::start().await;

    let in_flight = harness.queue.enqueue("G28", None);
    let queued = harness.queue.enqueue("M105", None);
    assert_eq!(within(device.read_line()).await.as_deref(), Some("G28"));

    let waiter = {
        let in_flight = in_flight.clone();
        tokio::spawn(async move { in_flight.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.shutdown.trigger();
    // Either the waiter saw shutdown or the dispatcher timed the instruction out first.
    match within(waiter).await.unwrap() {
        Err(BridgeError::ShuttingDown) => {}
        Ok(outcome) => assert_eq!(outcome.status, InstructionStatus::TimedOut),
        Err(other) => panic!("unexpected error: {other}"),
    }

    harness.stop().await;
    assert_eq!(in_flight.status(), InstructionStatus::TimedOut);
    assert_eq!(queued.status(), InstructionStatus::TimedOut);
}
