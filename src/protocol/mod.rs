//! Sky-Watcher motor controller wire protocol.
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232 (9600 baud, 8N1, no flow control)
//! - Request: `:` + opcode + axis (`1`|`2`) + payload + CR
//! - Response: `=` + payload + CR on success, `!` + error digit + CR on rejection
//! - Advanced firmware (3.22 and later) adds commands under opcode `X`, selected by
//!   a command word at the start of the payload
//!
//! Example: `:f1\r` (read status of axis 1) answered by `=101\r`.

pub mod channel;
pub mod codec;

pub use channel::{CommandChannel, RetryPolicy};

use crate::error::{DeviceError, MountError, TransportError};
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// Start of every request frame.
pub const START_CHAR_OUT: u8 = b':';
/// Start of a successful response.
pub const START_CHAR_IN: u8 = b'=';
/// Start of a rejected response.
pub const ERROR_CHAR: u8 = b'!';
/// Terminator of requests and responses.
pub const END_CHAR: u8 = 0x0D;

// =============================================================================
// Axes
// =============================================================================

/// One of the two motor channels of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Right ascension / azimuth.
    Primary,
    /// Declination / altitude.
    Secondary,
}

impl Axis {
    /// Both axes in wire order.
    pub const ALL: [Axis; 2] = [Axis::Primary, Axis::Secondary];

    /// Axis selector character used on the wire.
    pub fn as_char(self) -> char {
        match self {
            Axis::Primary => '1',
            Axis::Secondary => '2',
        }
    }

    /// Index into per-axis containers.
    pub fn index(self) -> usize {
        match self {
            Axis::Primary => 0,
            Axis::Secondary => 1,
        }
    }

    /// Parse the wire selector (`1` or `2`).
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '1' => Some(Axis::Primary),
            '2' => Some(Axis::Secondary),
            _ => None,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Fixed two-element container indexed by [`Axis`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerAxis<T>([T; 2]);

impl<T> PerAxis<T> {
    /// Build from the primary and secondary values.
    pub fn new(primary: T, secondary: T) -> Self {
        Self([primary, secondary])
    }

    /// Iterate over `(axis, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, &T)> {
        Axis::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<Axis> for PerAxis<T> {
    type Output = T;

    fn index(&self, axis: Axis) -> &T {
        &self.0[axis.index()]
    }
}

impl<T> IndexMut<Axis> for PerAxis<T> {
    fn index_mut(&mut self, axis: Axis) -> &mut T {
        &mut self.0[axis.index()]
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// Single-character command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// `E` - set axis position (BCD).
    SetEncoder = b'E',
    /// `F` - mark motor controller initialization done.
    InitializationDone = b'F',
    /// `G` - set motion mode and direction.
    SetMotionMode = b'G',
    /// `H` - set goto target offset (BCD).
    SetGotoTargetOffset = b'H',
    /// `I` - set clock ticks per microstep (BCD).
    SetStepPeriod = b'I',
    /// `J` - start motion in the selected mode.
    StartMotion = b'J',
    /// `K` - decelerate to a stop.
    StopMotion = b'K',
    /// `L` - stop immediately.
    InstantStop = b'L',
    /// `M` - goto-mode deceleration ramp length (BCD).
    SetGotoRampLength = b'M',
    /// `O` - auxiliary / camera switch.
    SetSwitch = b'O',
    /// `U` - slew-mode deceleration ramp length (BCD).
    SetSlewRampLength = b'U',
    /// `X` - advanced command set; payload starts with a command word.
    Advanced = b'X',
    /// `a` - microsteps per revolution.
    GetMicrostepsPerRevolution = b'a',
    /// `b` - stepper timer interrupt frequency.
    GetStepperClockFrequency = b'b',
    /// `e` - motor board firmware version.
    GetFirmwareVersion = b'e',
    /// `f` - axis status.
    GetStatus = b'f',
    /// `g` - high speed ratio.
    GetHighSpeedRatio = b'g',
    /// `j` - axis position.
    GetEncoder = b'j',
    /// `s` - microsteps per worm revolution.
    GetMicrostepsPerWormRevolution = b's',
}

impl Opcode {
    /// Opcode character as sent on the wire.
    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

/// Command words of the advanced command set (`:Xn` + word + data).
pub mod words {
    /// Read microsteps per revolution.
    pub const READ_RESOLUTION: &str = "0002";
    /// Read axis position in microsteps.
    pub const READ_ENCODER: &str = "0003";
    /// Read microsteps per worm revolution.
    pub const READ_WORM_RESOLUTION: &str = "000E";
    /// Set the axis position (`pppppppp`).
    pub const SET_ENCODER: &str = "01";
    /// Slew at `vvvvvvvvvvvvvvvv` microsteps per 1024 seconds.
    pub const SET_SPEED: &str = "02";
    /// Goto `pppppppp`, then continue at `vvvvvvvvvvvvvvvv`.
    ///
    /// The documented frame is `:Xnppppppppvvvvvvvvvvvvvvvv`, with no word.
    pub const GOTO_SLEW: &str = "";
    /// Stop.
    pub const STOP: &str = "0504";
    /// Initialize.
    pub const INITIALIZE: &str = "0505";
}

// =============================================================================
// Commands and frames
// =============================================================================

/// A command ready to be addressed to an axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command code.
    pub opcode: Opcode,
    /// Parameter payload (already encoded).
    pub payload: String,
}

impl Command {
    /// Command without parameters.
    pub fn bare(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: String::new(),
        }
    }

    /// Command with an encoded payload.
    pub fn with_payload(opcode: Opcode, payload: impl Into<String>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Advanced command: `X` + word + data.
    pub fn advanced(word: &str, data: &str) -> Self {
        Self {
            opcode: Opcode::Advanced,
            payload: format!("{}{}", word, data),
        }
    }

    /// Serialize into a request frame for `axis`.
    pub fn frame(&self, axis: Axis) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 4);
        frame.push(START_CHAR_OUT);
        frame.push(self.opcode as u8);
        frame.push(axis.as_char() as u8);
        frame.extend_from_slice(self.payload.as_bytes());
        frame.push(END_CHAR);
        frame
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.opcode.as_char(), self.payload)
    }
}

/// Outcome of decoding a complete reply frame.
#[derive(Debug)]
pub enum Reply {
    /// `=` frame; payload without marker and terminator.
    Ok(String),
    /// `!` frame.
    Rejected(DeviceError),
}

/// Decode a reply frame read up to and including the CR terminator.
///
/// Frames shorter than two bytes, or starting with anything but `=` or `!`,
/// are a transport-level failure so that the channel retries them like a
/// timeout.
pub fn parse_reply(frame: &[u8]) -> Result<Reply, TransportError> {
    if frame.len() < 2 {
        return Err(TransportError::ShortResponse(frame.len()));
    }

    let body = match frame.last() {
        Some(&END_CHAR) => &frame[1..frame.len() - 1],
        _ => &frame[1..],
    };

    match frame[0] {
        START_CHAR_IN => Ok(Reply::Ok(String::from_utf8_lossy(body).into_owned())),
        ERROR_CHAR => Ok(Reply::Rejected(DeviceError::from_payload(body))),
        other => Err(TransportError::Malformed(other)),
    }
}

/// Convert a device rejection into the driver error.
impl From<DeviceError> for MountError {
    fn from(e: DeviceError) -> Self {
        MountError::Device(e)
    }
}
