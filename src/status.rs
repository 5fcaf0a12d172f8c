//! Per-axis motion state.
//!
//! The state is refreshed from the controller's status reply and updated
//! optimistically after motion commands. A stopped axis has no direction or
//! speed mode; [`MotionState`] makes that unrepresentable.

use crate::error::{MountError, MountResult};
use serde::Serialize;

/// Direction and speed mode of a running axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Motion {
    /// Encoder counts increase while moving.
    pub forward: bool,
    /// Running in the high speed sub-mode.
    pub high_speed: bool,
}

/// Mutually exclusive motion states of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MotionState {
    /// Not moving.
    #[default]
    FullStop,
    /// Continuous slew at a rate.
    Slewing(Motion),
    /// Point-to-point move towards a target.
    SlewingTo(Motion),
}

/// Status of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisStatus {
    state: MotionState,
    not_initialized: bool,
}

impl Default for AxisStatus {
    /// Stopped, with the controller assumed not initialized.
    fn default() -> Self {
        Self {
            state: MotionState::FullStop,
            not_initialized: true,
        }
    }
}

impl AxisStatus {
    /// Decode the 3-digit reply of the status query.
    ///
    /// Each digit is a hex nibble:
    /// - digit 0: bit 0 continuous slew (else goto), bit 1 reverse, bit 2 high speed
    /// - digit 1: bit 0 running
    /// - digit 2: bit 0 initialized
    ///
    /// Direction and speed bits are ignored when the axis is stopped.
    pub fn decode(payload: &str) -> MountResult<Self> {
        let malformed = |reason| MountError::MalformedResponse {
            payload: payload.to_string(),
            reason,
        };

        let bytes = payload.as_bytes();
        if bytes.len() < 3 {
            return Err(malformed("status needs 3 digits"));
        }
        let mut nibbles = [0u32; 3];
        for (slot, &b) in nibbles.iter_mut().zip(bytes) {
            *slot = (b as char)
                .to_digit(16)
                .ok_or_else(|| malformed("non-hex status digit"))?;
        }
        let [mode, run, init] = nibbles;

        let state = if run & 0x01 != 0 {
            let motion = Motion {
                forward: mode & 0x02 == 0,
                high_speed: mode & 0x04 != 0,
            };
            if mode & 0x01 != 0 {
                MotionState::Slewing(motion)
            } else {
                MotionState::SlewingTo(motion)
            }
        } else {
            MotionState::FullStop
        };

        Ok(Self {
            state,
            not_initialized: init & 0x01 == 0,
        })
    }

    /// Current motion state.
    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Direction and speed mode, `None` when stopped.
    pub fn motion(&self) -> Option<Motion> {
        match self.state {
            MotionState::FullStop => None,
            MotionState::Slewing(m) | MotionState::SlewingTo(m) => Some(m),
        }
    }

    /// Not moving.
    pub fn is_full_stop(&self) -> bool {
        matches!(self.state, MotionState::FullStop)
    }

    /// Continuous slew.
    pub fn is_slewing(&self) -> bool {
        matches!(self.state, MotionState::Slewing(_))
    }

    /// Goto in progress.
    pub fn is_slewing_to(&self) -> bool {
        matches!(self.state, MotionState::SlewingTo(_))
    }

    /// Slewing or slewing to a target.
    pub fn is_in_motion(&self) -> bool {
        !self.is_full_stop()
    }

    /// High speed sub-mode; always false when stopped.
    pub fn high_speed(&self) -> bool {
        self.motion().is_some_and(|m| m.high_speed)
    }

    /// Controller reports its own init flag as not set.
    pub fn not_initialized(&self) -> bool {
        self.not_initialized
    }

    /// Whether a running axis must be stopped before starting a move in
    /// `forward` direction and `high_speed` mode.
    ///
    /// A goto in progress, high speed running, a high speed request or a
    /// reversal all need a stop. A stopped axis never does.
    pub fn needs_stop_for(&self, forward: bool, high_speed: bool) -> bool {
        match self.state {
            MotionState::FullStop => false,
            MotionState::SlewingTo(_) => true,
            MotionState::Slewing(m) => m.high_speed || high_speed || m.forward != forward,
        }
    }

    /// Record a stop without querying the controller.
    pub fn mark_stopped(&mut self) {
        self.state = MotionState::FullStop;
    }

    /// Record a continuous slew.
    pub fn mark_slewing(&mut self, forward: bool, high_speed: bool) {
        self.state = MotionState::Slewing(Motion { forward, high_speed });
    }

    /// Record a goto.
    pub fn mark_slewing_to(&mut self, forward: bool, high_speed: bool) {
        self.state = MotionState::SlewingTo(Motion { forward, high_speed });
    }
}
