//! Serial driver for the Masimo Rad-8 pulse oximeter.
//!
//! The Rad-8 serial output emits one ASCII record per line. The driver splits
//! the byte stream on line endings and hands each record to the subscribed
//! callback, in order, without interpreting it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{Instrument, Span, debug, info, trace, warn};

use dongle_bridge_framework::{
    BridgeError, ConfigMap, Driver, DriverCallback, DriverFactory, DriverMessage, Result,
    Subscription,
};

use crate::config::{LineSettings, SerialSettings};

/// Pause before re-opening the port after a read failure.
pub const REOPEN_DELAY: Duration = Duration::from_secs(2);

/// Longest record kept; longer runs without a line ending are discarded.
pub const MAX_LINE_LEN: usize = 4096;

const READ_BUFFER_SIZE: usize = 256;

/// Splits a byte stream into lines terminated by `\n`, `\r` or `\r\n`.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the complete, non-empty lines they finish.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' | b'\r' => {
                    if self.overflowed {
                        self.overflowed = false;
                        self.buffer.clear();
                    } else if !self.buffer.is_empty() {
                        lines.push(std::mem::take(&mut self.buffer));
                    }
                }
                _ if self.overflowed => {}
                _ if self.buffer.len() >= MAX_LINE_LEN => {
                    warn!(limit = MAX_LINE_LEN, "Discarding over-long serial record");
                    self.overflowed = true;
                    self.buffer.clear();
                }
                _ => self.buffer.push(byte),
            }
        }
        lines
    }

    /// Bytes received since the last line ending.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Read `reader` to its end, delivering each line to `callback`.
///
/// Each callback is awaited before the next line is delivered. Returns
/// `Ok(())` on end of stream.
pub async fn deliver_lines<R>(mut reader: R, callback: &dyn DriverCallback) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        };
        trace!(bytes = n, "Read from serial port");

        for line in framer.push(&buf[..n]) {
            callback.handle_message(DriverMessage::from_frame(line)).await;
        }
    }
}

/// Driver bound to one serial port.
pub struct MasimoDriver {
    settings: SerialSettings,
    span: Span,
}

impl MasimoDriver {
    pub fn new(settings: SerialSettings) -> Self {
        let span = tracing::info_span!("masimo", port = %settings.port);
        Self { settings, span }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

impl Driver for MasimoDriver {
    fn subscribe(
        &mut self,
        filter: Option<&str>,
        callback: Arc<dyn DriverCallback>,
    ) -> Result<Subscription> {
        let _entered = self.span.enter();
        if let Some(filter) = filter {
            debug!(filter, "Ignoring filter; the Rad-8 emits a single stream");
        }

        let stream = self.settings.open().map_err(|e| {
            BridgeError::driver(format!("cannot open {}: {}", self.settings.port, e))
        })?;
        info!(baud = self.settings.line.baud_rate, "Serial port opened");

        let task = tokio::spawn(
            read_loop(stream, self.settings.clone(), callback).instrument(self.span.clone()),
        );
        Ok(Subscription::new(task))
    }
}

/// Deliver lines until aborted, re-opening the port whenever it fails.
async fn read_loop(
    stream: tokio_serial::SerialStream,
    settings: SerialSettings,
    callback: Arc<dyn DriverCallback>,
) {
    let mut stream = Some(stream);
    loop {
        let port = match stream.take() {
            Some(port) => port,
            None => match settings.open() {
                Ok(port) => {
                    info!("Serial port re-opened");
                    port
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?REOPEN_DELAY, "Failed to re-open serial port");
                    tokio::time::sleep(REOPEN_DELAY).await;
                    continue;
                }
            },
        };

        match deliver_lines(port, callback.as_ref()).await {
            Ok(()) => warn!("Serial port closed"),
            Err(e) => warn!(error = %e, "Serial read failed"),
        }
        tokio::time::sleep(REOPEN_DELAY).await;
    }
}

/// Creates [`MasimoDriver`]s with the configured line settings.
#[derive(Debug, Clone, Default)]
pub struct MasimoDriverFactory {
    line: LineSettings,
}

impl MasimoDriverFactory {
    pub fn new(line: LineSettings) -> Self {
        Self { line }
    }

    pub fn from_options(options: &ConfigMap) -> Result<Self> {
        Ok(Self::new(LineSettings::from_options(options)?))
    }

    pub fn line(&self) -> &LineSettings {
        &self.line
    }
}

impl DriverFactory for MasimoDriverFactory {
    fn create(&self, endpoint: &str) -> Result<Box<dyn Driver>> {
        Ok(Box::new(MasimoDriver::new(SerialSettings::new(
            endpoint, self.line,
        ))))
    }
}
