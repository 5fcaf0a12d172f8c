//! Per-axis calibration and unit conversion.
//!
//! Angles and rates are converted to motor units through the per-axis
//! calibration read during bring-up. Conversions to integer motor units round
//! to the nearest microstep / clock tick.

use crate::error::{MountError, MountResult};
use crate::protocol::Axis;
use crate::session::MountFamily;
use std::f64::consts::PI;

/// Sidereal tracking rate in radians per second.
pub const SIDEREAL_RATE: f64 = 2.0 * PI / 86164.09065;

/// Fastest slew rate accepted, in radians per second.
pub const MAX_SPEED: f64 = 500.0;

/// Rates above this (radians per second) are eligible for high speed mode.
pub const LOW_SPEED_MARGIN: f64 = 128.0 * SIDEREAL_RATE;

/// Seconds of slewing at 128x sidereal that define the goto margin.
const GOTO_MARGIN_SECONDS: f64 = 5.0;

/// Microsteps per revolution reported for every 114GT, regardless of what it sends.
pub const MICROSTEPS_PER_REVOLUTION_114GT: u32 = 0x205318;

/// Scale applied to the microsteps per revolution of Merlin family controllers.
pub const MERLIN_MICROSTEP_SCALE: f64 = 0.655;

/// Apply mount family corrections to a raw microsteps-per-revolution reading.
///
/// The 114GT override is applied first, then the Merlin scale. The 114GT code
/// is inside the Merlin range so both corrections apply to it.
pub fn corrected_microsteps_per_revolution(raw: u32, family: MountFamily) -> u32 {
    let mut microsteps = raw;
    if family.is_114gt() {
        microsteps = MICROSTEPS_PER_REVOLUTION_114GT;
    }
    if family.is_merlin() {
        microsteps = (f64::from(microsteps) * MERLIN_MICROSTEP_SCALE) as u32;
    }
    microsteps
}

/// Calibration constants of one axis, fixed after bring-up.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisCalibration {
    microsteps_per_revolution: u32,
    stepper_clock_frequency: u32,
    high_speed_ratio: u32,
    microsteps_per_worm_revolution: Option<u32>,
    microsteps_per_radian: f64,
    radians_per_microstep: f64,
    microsteps_per_degree: f64,
    degrees_per_microstep: f64,
    low_speed_goto_margin: i64,
}

impl AxisCalibration {
    /// Build the calibration from raw controller readings.
    ///
    /// Mount family corrections are applied to `raw_microsteps_per_revolution`
    /// before the per-unit constants are derived.
    ///
    /// # Errors
    /// [`MountError::Calibration`] if any reading (or the corrected
    /// microsteps per revolution) is zero.
    pub fn try_new(
        axis: Axis,
        raw_microsteps_per_revolution: u32,
        stepper_clock_frequency: u32,
        high_speed_ratio: u32,
        microsteps_per_worm_revolution: Option<u32>,
        family: MountFamily,
    ) -> MountResult<Self> {
        let require = |value: u32, quantity: &'static str| {
            if value == 0 {
                tracing::error!(%axis, quantity, "Invalid value from mount. Cycle power and reconnect again.");
                Err(MountError::Calibration { axis, quantity })
            } else {
                Ok(value)
            }
        };

        require(raw_microsteps_per_revolution, "microsteps per revolution")?;
        let microsteps_per_revolution = require(
            corrected_microsteps_per_revolution(raw_microsteps_per_revolution, family),
            "microsteps per revolution",
        )?;
        let stepper_clock_frequency = require(stepper_clock_frequency, "stepper clock frequency")?;
        let high_speed_ratio = require(high_speed_ratio, "high speed ratio")?;
        if let Some(worm) = microsteps_per_worm_revolution {
            require(worm, "microsteps per worm revolution")?;
        }

        let steps = f64::from(microsteps_per_revolution);
        let microsteps_per_radian = steps / (2.0 * PI);
        let low_speed_goto_margin =
            (GOTO_MARGIN_SECONDS * 128.0 * SIDEREAL_RATE * microsteps_per_radian) as i64;

        tracing::debug!(
            %axis,
            microsteps_per_degree = steps / 360.0,
            microsteps_per_arcsec = steps / 360.0 / 3600.0,
            low_speed_goto_margin,
            "Axis calibrated"
        );

        Ok(Self {
            microsteps_per_revolution,
            stepper_clock_frequency,
            high_speed_ratio,
            microsteps_per_worm_revolution,
            microsteps_per_radian,
            radians_per_microstep: 2.0 * PI / steps,
            microsteps_per_degree: steps / 360.0,
            degrees_per_microstep: 360.0 / steps,
            low_speed_goto_margin,
        })
    }

    /// Microsteps per revolution after mount family corrections.
    pub fn microsteps_per_revolution(&self) -> u32 {
        self.microsteps_per_revolution
    }

    /// Stepper timer interrupt frequency in ticks per second.
    pub fn stepper_clock_frequency(&self) -> u32 {
        self.stepper_clock_frequency
    }

    /// Speed multiplier of high speed mode.
    pub fn high_speed_ratio(&self) -> u32 {
        self.high_speed_ratio
    }

    /// Microsteps per worm revolution; `None` on DC motor hardware.
    pub fn microsteps_per_worm_revolution(&self) -> Option<u32> {
        self.microsteps_per_worm_revolution
    }

    /// Microsteps per radian.
    pub fn microsteps_per_radian(&self) -> f64 {
        self.microsteps_per_radian
    }

    /// Radians per microstep.
    pub fn radians_per_microstep(&self) -> f64 {
        self.radians_per_microstep
    }

    /// Microsteps per degree.
    pub fn microsteps_per_degree(&self) -> f64 {
        self.microsteps_per_degree
    }

    /// Degrees per microstep.
    pub fn degrees_per_microstep(&self) -> f64 {
        self.degrees_per_microstep
    }

    /// Goto offsets above this many microsteps may use high speed mode.
    pub fn low_speed_goto_margin(&self) -> i64 {
        self.low_speed_goto_margin
    }

    /// Angle in radians to the nearest microstep.
    pub fn radians_to_microsteps(&self, radians: f64) -> i64 {
        (radians * self.microsteps_per_radian).round() as i64
    }

    /// Microsteps to radians.
    pub fn microsteps_to_radians(&self, microsteps: i64) -> f64 {
        microsteps as f64 * self.radians_per_microstep
    }

    /// Angle in degrees to the nearest microstep.
    pub fn degrees_to_microsteps(&self, degrees: f64) -> i64 {
        (degrees * self.microsteps_per_degree).round() as i64
    }

    /// Microsteps to degrees.
    pub fn microsteps_to_degrees(&self, microsteps: i64) -> f64 {
        microsteps as f64 * self.degrees_per_microstep
    }

    /// Stepper clock ticks between microsteps for a rate in radians per second.
    ///
    /// # Errors
    /// [`MountError::InvalidArgument`] for a zero or non-finite rate.
    pub fn radians_per_second_to_clock_ticks(&self, radians_per_second: f64) -> MountResult<i64> {
        self.clock_ticks(radians_per_second * self.microsteps_per_radian)
    }

    /// Stepper clock ticks between microsteps for a rate in degrees per second.
    pub fn degrees_per_second_to_clock_ticks(&self, degrees_per_second: f64) -> MountResult<i64> {
        self.clock_ticks(degrees_per_second * self.microsteps_per_degree)
    }

    fn clock_ticks(&self, microsteps_per_second: f64) -> MountResult<i64> {
        if microsteps_per_second == 0.0 || !microsteps_per_second.is_finite() {
            return Err(MountError::InvalidArgument(format!(
                "cannot convert a rate of {} microsteps/s to clock ticks",
                microsteps_per_second
            )));
        }
        Ok((f64::from(self.stepper_clock_frequency) / microsteps_per_second).round() as i64)
    }

    /// Rate in the advanced encoding: microsteps per 1024 seconds.
    pub fn advanced_rate(&self, radians_per_second: f64) -> i64 {
        (radians_per_second * self.microsteps_per_radian * 1024.0).round() as i64
    }
}
