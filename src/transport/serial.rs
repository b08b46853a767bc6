//! tty-backed connector.
//!
//! Opening a serial port normally raises DTR, and dropping it (HUPCL)
//! resets most printer boards. Before each open the port's termios is
//! rewritten without HUPCL so a reconnect does not reboot a running print.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, WriteHalf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::{Connector, Link, LinkWriter};
use crate::config::SerialConfig;

/// Opens the printer's tty with tokio-serial.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
}

impl SerialConnector {
    /// Connector for `port` at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl From<&SerialConfig> for SerialConnector {
    fn from(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> io::Result<Link> {
        #[cfg(unix)]
        suppress_hangup(&self.port)?;

        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .open_native_async()
            .map_err(io::Error::from)?;
        let control = SerialPort::try_clone(&stream).map_err(io::Error::from)?;
        let (reader, writer) = tokio::io::split(stream);

        tracing::debug!(port = %self.port, baud_rate = self.baud_rate, "Serial port opened");
        Ok(Link {
            reader: Box::new(reader),
            writer: Box::new(SerialWriter {
                inner: writer,
                control,
            }),
        })
    }

    fn describe(&self) -> String {
        self.port.clone()
    }
}

/// Clear HUPCL so closing the port does not drop DTR.
#[cfg(unix)]
fn suppress_hangup(path: &str) -> io::Result<()> {
    use nix::fcntl::OFlag;
    use nix::sys::termios::{tcgetattr, tcsetattr, ControlFlags, SetArg};
    use std::os::unix::fs::OpenOptionsExt;

    let tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
        .open(path)?;
    let mut attrs = tcgetattr(&tty)?;
    attrs.control_flags.remove(ControlFlags::HUPCL);
    tcsetattr(&tty, SetArg::TCSAFLUSH, &attrs)?;
    tracing::debug!(port = %path, "Cleared HUPCL");
    Ok(())
}

struct SerialWriter {
    inner: WriteHalf<SerialStream>,
    control: Box<dyn SerialPort>,
}

impl AsyncWrite for SerialWriter {
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

impl LinkWriter for SerialWriter {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.control
            .write_data_terminal_ready(level)
            .map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_from_config() {
        let config = SerialConfig {
            port: "/dev/ttyACM0".to_string(),
            ..SerialConfig::default()
        };
        let connector = SerialConnector::from(&config);
        assert_eq!(connector.describe(), "/dev/ttyACM0");
        assert_eq!(connector.baud_rate, 115_200);
    }

    #[tokio::test]
    async fn test_missing_port_fails() {
        let connector = SerialConnector::new("/dev/definitely-not-a-printer", 115_200);
        assert!(connector.connect().await.is_err());
    }
}
