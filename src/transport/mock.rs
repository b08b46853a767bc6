//! Mock printer link
//!
//! Provides in-memory printers for testing without a serial port. Every
//! successful [`MockConnector::connect`] creates a fresh duplex pipe and
//! hands the printer side to the test as a [`MockDevice`].
//!
//! # Example
//!
//! ```rust,ignore
//! let (connector, mut devices) = MockConnector::new();
//! let transport = Transport::start(connector, config, router, shutdown).await?;
//! let mut printer = devices.next_device().await.unwrap();
//! assert_eq!(printer.read_line().await.as_deref(), Some("M105"));
//! printer.send_line("ok T:210.0 /210.0 B:60.0 /60.0").await?;
//! ```
//!
//! Dropping a [`MockDevice`] closes its end of the pipe, which the transport
//! sees as a lost link.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{
    AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Connector, Link, LinkWriter};

const PIPE_CAPACITY: usize = 4096;

/// Connector producing in-memory printers.
pub struct MockConnector {
    devices: mpsc::UnboundedSender<MockDevice>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

/// Receiving end for devices created by a [`MockConnector`].
pub struct MockDevices {
    rx: mpsc::UnboundedReceiver<MockDevice>,
}

impl MockDevices {
    /// Next device, in connect order. `None` once the connector is gone.
    pub async fn next_device(&mut self) -> Option<MockDevice> {
        self.rx.recv().await
    }

    /// A device that was already connected, if any.
    pub fn try_next_device(&mut self) -> Option<MockDevice> {
        self.rx.try_recv().ok()
    }
}

impl MockConnector {
    /// Create a connector and the stream of devices it will produce.
    pub fn new() -> (Arc<Self>, MockDevices) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            devices: tx,
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, MockDevices { rx })
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> io::Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "mock printer is unplugged",
            ));
        }

        let (agent_side, printer_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (agent_reader, agent_writer) = tokio::io::split(agent_side);
        let (printer_reader, printer_writer) = tokio::io::split(printer_side);
        let dtr = Arc::new(Mutex::new(Vec::new()));

        let device = MockDevice {
            reader: BufReader::new(printer_reader),
            writer: printer_writer,
            dtr: Arc::clone(&dtr),
        };
        self.devices
            .send(device)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "no one is listening"))?;

        Ok(Link {
            reader: Box::new(agent_reader),
            writer: Box::new(MockWriter {
                inner: agent_writer,
                dtr,
            }),
        })
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

struct MockWriter {
    inner: WriteHalf<DuplexStream>,
    dtr: Arc<Mutex<Vec<bool>>>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl LinkWriter for MockWriter {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.dtr.lock().push(level);
        Ok(())
    }
}

/// Printer side of a mock link.
pub struct MockDevice {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    dtr: Arc<Mutex<Vec<bool>>>,
}

impl MockDevice {
    /// Next line written by the agent, without the line terminator.
    /// `None` once the agent closed the link.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    /// Send one line to the agent.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Send raw bytes to the agent.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// DTR levels set by the agent, oldest first.
    pub fn dtr_history(&self) -> Vec<bool> {
        self.dtr.lock().clone()
    }

    /// Simulate an unplugged cable.
    pub fn disconnect(self) {
        tracing::debug!("Mock printer disconnected");
    }

    /// Answer every received line with the replies produced by `respond`.
    ///
    /// The task ends when the agent closes the link and returns every line
    /// it received.
    pub fn spawn_responder<F>(mut self, mut respond: F) -> JoinHandle<Vec<String>>
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(line) = self.read_line().await {
                let replies = respond(&line);
                received.push(line);
                for reply in replies {
                    if self.send_line(&reply).await.is_err() {
                        return received;
                    }
                }
            }
            received
        })
    }
}

/// Responder that acknowledges everything with a bare `ok`.
pub fn always_ok(_line: &str) -> Vec<String> {
    vec!["ok".to_string()]
}
