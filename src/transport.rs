//! Byte transport to the motor controller.
//!
//! The protocol layer only needs three capabilities from the link:
//! discard unread input, write a frame, and read up to a delimiter with a
//! deadline. [`MountTransport`] captures that contract so the command channel
//! can run against real hardware ([`SerialTransport`]), the protocol simulator
//! ([`crate::sim::SimulatedMount`]) or a scripted test double.
//!
//! # Example
//!
//! ```rust,ignore
//! use skywatcher_mount::transport::{open_serial_async, SerialTransport};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 9600).await?;
//! let transport = SerialTransport::new(Box::new(port));
//! ```

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Default baud rate of Sky-Watcher motor controllers.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Byte-level link to the motor controller.
///
/// Implementations are used by exactly one command channel; calls are never
/// concurrent.
#[async_trait]
pub trait MountTransport: Send {
    /// Discard any bytes received but not yet read.
    async fn flush_input(&mut self) -> Result<(), TransportError>;

    /// Write `data`, returning the number of bytes written.
    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read until `delimiter` (inclusive) or fail after `timeout`.
    async fn read_until(
        &mut self,
        delimiter: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Read exactly one byte or fail after `timeout`.
    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError>;
}

#[async_trait]
impl<T: MountTransport + ?Sized> MountTransport for Box<T> {
    async fn flush_input(&mut self) -> Result<(), TransportError> {
        (**self).flush_input().await
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write_bytes(data).await
    }

    async fn read_until(
        &mut self,
        delimiter: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).read_until(delimiter, timeout).await
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        (**self).read_byte(timeout).await
    }
}

// =============================================================================
// Serial implementation
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can back a
/// [`SerialTransport`], including `tokio_serial::SerialStream` and
/// `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// [`MountTransport`] over an async byte stream.
pub struct SerialTransport {
    port: BufReader<DynSerial>,
    drain_window: Duration,
}

impl SerialTransport {
    /// Wrap an opened port.
    pub fn new(port: DynSerial) -> Self {
        Self {
            port: BufReader::new(port),
            drain_window: Duration::from_millis(10),
        }
    }

    /// Time spent collecting stale bytes in [`MountTransport::flush_input`].
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }
}

#[async_trait]
impl MountTransport for SerialTransport {
    async fn flush_input(&mut self) -> Result<(), TransportError> {
        // Bytes already pulled into the BufReader count as unread input too
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);

        let discarded = buffered + drain_serial_buffer(self.port.get_mut(), self.drain_window).await;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded stale bytes before exchange");
        }
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let writer = self.port.get_mut();
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(data.len())
    }

    async fn read_until(
        &mut self,
        delimiter: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut response = Vec::with_capacity(32);
        match tokio::time::timeout(timeout, self.port.read_until(delimiter, &mut response)).await {
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(_)) => Ok(response),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        match tokio::time::timeout(timeout, self.port.read_u8()).await {
            Ok(Ok(byte)) => Ok(byte),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Open a serial port with the controller's line settings (8N1, no flow control).
///
/// Opening runs in `spawn_blocking` so it does not stall the runtime.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open mount serial port: {}", port_path_owned))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read and discard whatever arrives within `window`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    window: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total_discarded
}
