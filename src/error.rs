//! Error types for the mount driver.
//!
//! `MountError` is the single error type returned by every public operation.
//! It separates the three failure classes the protocol distinguishes:
//!
//! - **Transport failures** (`Transport`): write errors, read timeouts and short
//!   frames. These are retried by the command channel and only surface once the
//!   retry budget is exhausted.
//! - **Device-reported errors** (`Device`): the controller answered with a
//!   `!`-prefixed frame. These are never retried.
//! - **Calibration errors** (`Calibration`): the controller returned a zero value
//!   during bring-up. The session is unusable until the hardware is power-cycled
//!   and bring-up is run again.
//!
//! The remaining variants cover local misuse (`NotInitialized`, `InvalidArgument`),
//! the bounded stop-and-wait (`StopTimeout`) and configuration problems.

use crate::protocol::Axis;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type MountResult<T> = std::result::Result<T, MountError>;

/// Device error messages, indexed by the digit following `!` in a reply.
static DEVICE_ERROR_MESSAGES: [&str; 6] = [
    "Unknown command",
    "Command length error",
    "Motor not stopped",
    "Invalid character",
    "Not initialized",
    "Driver sleeping",
];

/// Look up the message for a device error code.
///
/// Returns `None` for codes outside the table; callers must not assume every
/// code the controller sends is known.
pub fn device_error_message(code: u8) -> Option<&'static str> {
    DEVICE_ERROR_MESSAGES.get(usize::from(code)).copied()
}

/// A logical rejection reported by the motor controller (`!` reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    /// Numeric error code, if the reply carried one.
    pub code: Option<u8>,
}

impl DeviceError {
    /// Decode the error from the bytes following the `!` marker.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            code: payload.first().map(|b| b.wrapping_sub(b'0')),
        }
    }

    /// Human readable message for known codes.
    pub fn message(&self) -> Option<&'static str> {
        self.code.and_then(device_error_message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.message()) {
            (Some(code), Some(message)) => write!(f, "mount error {}: {}", code, message),
            (Some(code), None) => write!(f, "mount error {}: unrecognised code", code),
            (None, _) => write!(f, "mount error without code"),
        }
    }
}

/// Failures of a single exchange on the physical link.
///
/// All of these are treated alike by the retry policy.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying serial I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No delimiter arrived before the read deadline.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The reply was shorter than the minimum frame (`=` + CR).
    #[error("short response ({0} bytes)")]
    ShortResponse(usize),

    /// The reply started with neither `=` nor `!`.
    #[error("malformed response starting with byte 0x{0:02X}")]
    Malformed(u8),

    /// The peer closed the link.
    #[error("transport closed")]
    Closed,
}

/// Primary error type for mount operations.
#[derive(Error, Debug)]
pub enum MountError {
    /// Every attempt of an exchange failed at the transport level.
    ///
    /// **Recovery Strategy**: check cabling and power; the command channel has
    /// already retried, nothing above it retries again.
    #[error("communication with axis {axis} failed after {attempts} attempts: {source}")]
    Transport {
        /// Axis the exchange was addressed to.
        axis: Axis,
        /// Number of attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        source: TransportError,
    },

    /// The controller rejected the command.
    #[error("{0}")]
    Device(DeviceError),

    /// A reply was framed correctly but its payload could not be decoded.
    #[error("malformed response payload {payload:?}: {reason}")]
    MalformedResponse {
        /// Raw payload text.
        payload: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The controller reported an unusable calibration value during bring-up.
    ///
    /// **Recovery Strategy**: cycle power on the mount and run bring-up again.
    #[error("invalid {quantity} value from mount for axis {axis}; cycle power and reconnect")]
    Calibration {
        /// Axis whose calibration failed.
        axis: Axis,
        /// Name of the calibration quantity.
        quantity: &'static str,
    },

    /// The motor-type probe saw neither an echo nor silence.
    #[error("motor type probe failed: {0}")]
    MotorProbe(String),

    /// A motion or calibration dependent operation was requested before
    /// bring-up completed successfully.
    #[error("mount is not initialized")]
    NotInitialized,

    /// The axis did not report a full stop within the allowed time.
    ///
    /// **Recovery Strategy**: escalate to an instant stop or inspect the hardware.
    #[error("axis {axis} did not stop within {waited:?}")]
    StopTimeout {
        /// Axis that kept running.
        axis: Axis,
        /// Time spent waiting.
        waited: Duration,
    },

    /// An argument could not be converted into a valid command.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MountError {
    /// Device error details, if this is a device rejection.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            MountError::Device(e) => Some(e),
            _ => None,
        }
    }
}
