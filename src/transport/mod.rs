//! Serial transport: owns the link to the printer.
//!
//! The [`Transport`] keeps one bidirectional byte stream open, reads it line
//! by line on a background task and hands every decoded line to the
//! [`LineRouter`]. Writers are serialized by a single lock that also guards
//! link replacement, so a write never interleaves with a reconnect.
//!
//! # Link lifecycle
//!
//! ```text
//! Closed -> Opening -> Open -> Failed -> Opening -> Open ...
//! ```
//!
//! Any read or write failure closes the old link, publishes
//! [`LinkEvent::Failed`] and loops on the [`Connector`] until a new link
//! opens, waiting out the printer's boot time before publishing
//! [`LinkEvent::Renewed`]. Each successful open bumps the link generation
//! reported by [`Transport::link_status`], which lets the instruction queue
//! notice that a line it sent may never be answered.
//!
//! Physical access is abstracted by [`Connector`]: [`serial::SerialConnector`]
//! opens a real tty, [`mock::MockConnector`] hands out in-memory devices.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::SerialConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::router::LineRouter;
use crate::shutdown::Shutdown;

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

/// Read half of an open link.
pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open link, including the modem control lines.
pub trait LinkWriter: AsyncWrite + Send + Unpin {
    /// Drive the DTR line.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
}

/// A freshly opened link, split into halves.
pub struct Link {
    /// Bytes coming from the printer
    pub reader: LinkReader,
    /// Bytes going to the printer
    pub writer: Box<dyn LinkWriter>,
}

/// Opens links to the printer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link. Called again after every failure.
    async fn connect(&self) -> io::Result<Link>;

    /// Human-readable name of the endpoint, for logs.
    fn describe(&self) -> String;
}

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not opened yet, or closed by shutdown
    Closed,
    /// A connect attempt (or the boot wait after it) is in progress
    Opening,
    /// Usable
    Open,
    /// The previous link broke; replacement is about to start
    Failed,
}

/// Snapshot of the link published to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    /// Current lifecycle state
    pub state: LinkState,
    /// Number of links opened so far
    pub generation: u64,
}

impl LinkStatus {
    /// Whether the link is open.
    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }
}

/// Link notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link broke; a reconnect is starting
    Failed,
    /// A new link is open and the printer had time to boot
    Renewed,
}

/// Timing of link (re)establishment.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Wait after every successful open before the link is used
    pub boot_wait: Duration,
    /// Wait between failed open attempts
    pub reopen_backoff: Duration,
}

impl From<&SerialConfig> for TransportConfig {
    fn from(config: &SerialConfig) -> Self {
        Self {
            boot_wait: config.boot_wait(),
            reopen_backoff: config.reopen_backoff(),
        }
    }
}

/// State guarded by the write lock.
struct Slot {
    writer: Option<Box<dyn LinkWriter>>,
    generation: u64,
    /// Reader of a link opened on the write path, not yet taken by the
    /// reader task.
    pending_reader: Option<LinkReader>,
}

/// Owner of the printer link.
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    slot: tokio::sync::Mutex<Slot>,
    status: watch::Sender<LinkStatus>,
    events: broadcast::Sender<LinkEvent>,
    router: Arc<LineRouter>,
    shutdown: Shutdown,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Open the link and start the reader task.
    ///
    /// Blocks until the first link is open, retrying forever. Returns
    /// [`BridgeError::ShuttingDown`] if shutdown is triggered first.
    pub async fn start(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        router: Arc<LineRouter>,
        shutdown: Shutdown,
    ) -> BridgeResult<Arc<Self>> {
        let (status, _) = watch::channel(LinkStatus {
            state: LinkState::Closed,
            generation: 0,
        });
        let (events, _) = broadcast::channel(16);
        let transport = Arc::new(Self {
            connector,
            config,
            slot: tokio::sync::Mutex::new(Slot {
                writer: None,
                generation: 0,
                pending_reader: None,
            }),
            status,
            events,
            router,
            shutdown,
            reader_task: Mutex::new(None),
        });

        let (reader, generation) = {
            let mut slot = transport.slot.lock().await;
            let reader = transport
                .reconnect_locked(&mut slot)
                .await
                .ok_or(BridgeError::ShuttingDown)?;
            (reader, slot.generation)
        };

        let task = tokio::spawn(Arc::clone(&transport).read_loop(reader, generation));
        *transport.reader_task.lock() = Some(task);
        Ok(transport)
    }

    /// Subscribe to link status changes.
    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Subscribe to [`LinkEvent`]s.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Name of the endpoint.
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Write `message` to the printer, replacing the link and retrying until
    /// it goes through.
    pub async fn write(&self, message: &[u8]) -> BridgeResult<()> {
        tracing::debug!(
            message = %String::from_utf8_lossy(message).trim_end(),
            "Sending to printer"
        );
        let mut slot = self.slot.lock().await;
        while !self.shutdown.is_triggered() {
            match self.write_locked(&mut slot, message).await {
                Ok(()) => return Ok(()),
                Err(_) if self.shutdown.is_triggered() => break,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        message = %String::from_utf8_lossy(message).trim_end(),
                        "Serial error while sending to the printer"
                    );
                    self.replace_link(&mut slot).await;
                }
            }
        }
        Err(BridgeError::ShuttingDown)
    }

    /// Write `message` once.
    ///
    /// On failure the link is replaced, but the message is not sent again:
    /// the caller gets [`BridgeError::LinkLost`] and decides what to do.
    pub async fn send_once(&self, message: &[u8]) -> BridgeResult<()> {
        tracing::debug!(
            message = %String::from_utf8_lossy(message).trim_end(),
            "Sending to printer"
        );
        let mut slot = self.slot.lock().await;
        if self.shutdown.is_triggered() {
            return Err(BridgeError::ShuttingDown);
        }
        match self.write_locked(&mut slot, message).await {
            Ok(()) => Ok(()),
            Err(_) if self.shutdown.is_triggered() => Err(BridgeError::ShuttingDown),
            Err(e) => {
                tracing::error!(error = %e, "Serial error while sending to the printer");
                self.replace_link(&mut slot).await;
                Err(BridgeError::LinkLost(
                    String::from_utf8_lossy(message).trim_end().to_string(),
                ))
            }
        }
    }

    /// Reset the printer by pulsing DTR, then wait for it to boot.
    pub async fn reset_via_control_line(&self) -> BridgeResult<()> {
        let mut slot = self.slot.lock().await;
        if let Some(writer) = slot.writer.as_mut() {
            tracing::info!(port = %self.connector.describe(), "Resetting printer via DTR");
            writer.set_dtr(false)?;
            writer.set_dtr(true)?;
        }
        if !self.shutdown.sleep(self.config.boot_wait).await {
            return Err(BridgeError::ShuttingDown);
        }
        Ok(())
    }

    /// Stop the reader task and close the link.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Serial reader task ended abnormally");
            }
        }

        let mut slot = self.slot.lock().await;
        if let Some(mut writer) = slot.writer.take() {
            let _ = writer.shutdown().await;
        }
        slot.pending_reader = None;
        let generation = slot.generation;
        self.status.send_replace(LinkStatus {
            state: LinkState::Closed,
            generation,
        });
        tracing::info!(port = %self.connector.describe(), "Serial link closed");
    }

    async fn write_locked(&self, slot: &mut Slot, message: &[u8]) -> io::Result<()> {
        let writer = slot
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial link is not open"))?;
        let write = async {
            writer.write_all(message).await?;
            writer.flush().await
        };
        tokio::select! {
            result = write => result,
            _ = self.shutdown.wait() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "write aborted by shutdown",
            )),
        }
    }

    /// Reconnect from the write path and park the new reader for the reader
    /// task.
    async fn replace_link(&self, slot: &mut Slot) {
        if let Some(reader) = self.reconnect_locked(slot).await {
            slot.pending_reader = Some(reader);
        }
    }

    fn publish(&self, state: LinkState, generation: u64) {
        self.status.send_replace(LinkStatus { state, generation });
    }

    /// Drop the current link and open a new one. `None` on shutdown.
    async fn reconnect_locked(&self, slot: &mut Slot) -> Option<LinkReader> {
        let port = self.connector.describe();
        let _ = self.events.send(LinkEvent::Failed);
        self.publish(LinkState::Failed, slot.generation);
        if let Some(mut writer) = slot.writer.take() {
            let _ = writer.shutdown().await;
        }
        slot.pending_reader = None;

        while !self.shutdown.is_triggered() {
            self.publish(LinkState::Opening, slot.generation);
            match self.connector.connect().await {
                Ok(link) => {
                    tracing::debug!(port = %port, "Waiting for the printer to boot");
                    if !self.shutdown.sleep(self.config.boot_wait).await {
                        break;
                    }
                    slot.generation += 1;
                    slot.writer = Some(link.writer);
                    self.publish(LinkState::Open, slot.generation);
                    let _ = self.events.send(LinkEvent::Renewed);
                    tracing::info!(
                        port = %port,
                        generation = slot.generation,
                        "Serial link open"
                    );
                    return Some(link.reader);
                }
                Err(e) => {
                    tracing::warn!(
                        port = %port,
                        error = %e,
                        "Opening of the serial port failed. Retrying..."
                    );
                    if !self.shutdown.sleep(self.config.reopen_backoff).await {
                        break;
                    }
                }
            }
        }
        None
    }

    /// Reader-side recovery after the link the task was reading failed.
    async fn recover(&self, failed_generation: u64) -> Option<(LinkReader, u64)> {
        let mut slot = self.slot.lock().await;
        if slot.generation != failed_generation {
            if let Some(reader) = slot.pending_reader.take() {
                return Some((reader, slot.generation));
            }
        }
        let reader = self.reconnect_locked(&mut slot).await?;
        Some((reader, slot.generation))
    }

    /// Pick up a link opened on the write path.
    async fn take_pending(&self) -> Option<(LinkReader, u64)> {
        let mut slot = self.slot.lock().await;
        let generation = slot.generation;
        slot.pending_reader.take().map(|reader| (reader, generation))
    }

    async fn read_loop(self: Arc<Self>, reader: LinkReader, generation: u64) {
        let mut status_rx = self.status.subscribe();
        status_rx.borrow_and_update();
        let mut current = Some((BufReader::new(reader), generation));
        let mut buf = Vec::with_capacity(256);

        loop {
            match current.as_mut() {
                None => {
                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        changed = status_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            status_rx.borrow_and_update();
                        }
                    }
                    current = self
                        .take_pending()
                        .await
                        .map(|(reader, generation)| (BufReader::new(reader), generation));
                }
                Some((reader, generation)) => {
                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        changed = status_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let status = *status_rx.borrow_and_update();
                            if status.generation != *generation || !status.is_open() {
                                // Link is being replaced on the write path. Let go of
                                // our half so the port can be reopened.
                                drop(current.take());
                                buf.clear();
                                current = self
                                    .take_pending()
                                    .await
                                    .map(|(reader, generation)| (BufReader::new(reader), generation));
                            }
                        }
                        read = reader.read_until(b'\n', &mut buf) => {
                            match read {
                                Ok(0) => {
                                    tracing::error!("Printer closed the serial link");
                                    let failed = *generation;
                                    drop(current.take());
                                    buf.clear();
                                    match self.recover(failed).await {
                                        Some((reader, generation)) => {
                                            current = Some((BufReader::new(reader), generation));
                                        }
                                        None => break,
                                    }
                                }
                                Ok(_) => {
                                    self.handle_raw_line(&buf);
                                    buf.clear();
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "Failed to read from the printer");
                                    let failed = *generation;
                                    drop(current.take());
                                    buf.clear();
                                    match self.recover(failed).await {
                                        Some((reader, generation)) => {
                                            current = Some((BufReader::new(reader), generation));
                                        }
                                        None => break,
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!("Serial reader task stopped");
    }

    fn handle_raw_line(&self, raw: &[u8]) {
        let line = match decode_line(raw) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bytes = ?raw,
                    "Failed decoding a message from the printer"
                );
                return;
            }
        };
        if line.is_empty() {
            return;
        }
        tracing::debug!(line = %line, "Printer says");
        self.router.route(line);
    }
}

/// Decode one raw line and strip surrounding whitespace and terminators.
fn decode_line(raw: &[u8]) -> BridgeResult<&str> {
    Ok(std::str::from_utf8(raw)?.trim())
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> TransportConfig {
        TransportConfig {
            boot_wait: Duration::ZERO,
            reopen_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_lines_reach_router() {
        let router = Arc::new(LineRouter::new());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            router.register_listener(regex::Regex::new("^echo:").unwrap(), move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (connector, mut devices) = MockConnector::new();
        let transport = Transport::start(connector, fast_config(), router, Shutdown::new())
            .await
            .unwrap();
        let mut device = devices.next_device().await.unwrap();

        device.send_line("echo:one").await.unwrap();
        device.send_line("").await.unwrap();
        device.send_line("  echo:two\r").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(transport.link_status().borrow().is_open());
        transport.shutdown().await;
        assert_eq!(transport.link_status().borrow().state, LinkState::Closed);
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"  ok T:20.0\r\n").unwrap(), "ok T:20.0");
        assert!(matches!(
            decode_line(b"T:\xff\n"),
            Err(BridgeError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_start_aborts_on_shutdown() {
        let (connector, _devices) = MockConnector::new();
        connector.fail_next(usize::MAX);
        let shutdown = Shutdown::new();

        let starting = tokio::spawn(Transport::start(
            connector,
            fast_config(),
            Arc::new(LineRouter::new()),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), starting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BridgeError::ShuttingDown)));
    }
}
