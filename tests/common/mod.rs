//! Shared harness: a transport and queue running against a mock printer.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use printer_bridge::queue::{InstructionQueue, QueueConfig};
use printer_bridge::transport::mock::{MockConnector, MockDevice, MockDevices};
use printer_bridge::transport::{Transport, TransportConfig};
use printer_bridge::{LineRouter, Shutdown};

/// Upper bound for anything a test waits on.
pub const TEST_DEADLINE: Duration = Duration::from_secs(5);

pub fn transport_config() -> TransportConfig {
    TransportConfig {
        boot_wait: Duration::ZERO,
        reopen_backoff: Duration::from_millis(10),
    }
}

pub fn queue_config() -> QueueConfig {
    QueueConfig {
        instruction_timeout: Duration::from_secs(2),
        rejection_ack_grace: Duration::from_millis(200),
        ..QueueConfig::default()
    }
}

/// Await `future`, failing the test if it takes longer than [`TEST_DEADLINE`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_DEADLINE, future)
        .await
        .expect("test step timed out")
}

/// Poll `condition` until it holds.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

pub struct Harness {
    pub connector: Arc<MockConnector>,
    pub devices: MockDevices,
    pub router: Arc<LineRouter>,
    pub transport: Arc<Transport>,
    pub queue: Arc<InstructionQueue>,
    pub shutdown: Shutdown,
}

impl Harness {
    /// Start with default test settings; returns the first printer.
    pub async fn start() -> (Self, MockDevice) {
        let (connector, devices) = MockConnector::new();
        Self::start_with(connector, devices, queue_config()).await
    }

    pub async fn start_with_queue(config: QueueConfig) -> (Self, MockDevice) {
        let (connector, devices) = MockConnector::new();
        Self::start_with(connector, devices, config).await
    }

    pub async fn start_with(
        connector: Arc<MockConnector>,
        mut devices: MockDevices,
        config: QueueConfig,
    ) -> (Self, MockDevice) {
        let shutdown = Shutdown::new();
        let router = Arc::new(LineRouter::new());
        let transport = within(Transport::start(
            connector.clone(),
            transport_config(),
            Arc::clone(&router),
            shutdown.clone(),
        ))
        .await
        .expect("transport should start");
        let queue = InstructionQueue::start(
            Arc::clone(&transport),
            &router,
            config,
            shutdown.clone(),
        );
        let device = within(devices.next_device())
            .await
            .expect("first printer should be connected");

        (
            Self {
                connector,
                devices,
                router,
                transport,
                queue,
                shutdown,
            },
            device,
        )
    }

    pub async fn next_device(&mut self) -> MockDevice {
        within(self.devices.next_device())
            .await
            .expect("connector should produce another printer")
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        within(self.queue.stop()).await;
        within(self.transport.shutdown()).await;
    }
}
