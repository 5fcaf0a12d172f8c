//! Legacy command set: one opcode per operation, 6-digit byte-swapped values.
//!
//! Motion runs in two steps. First the motion mode (`G`) is selected while the
//! axis is stopped, then the rate (`I`) or goto target (`H`, `M`) is pushed and
//! motion is started with `J`.

use super::{log_goto, Dialect};
use crate::error::{MountError, MountResult};
use crate::protocol::codec::{decode_legacy_u24, encode_legacy_u24, LEGACY_MAX};
use crate::protocol::{Axis, Command, Opcode};
use crate::session::{DialectKind, Mount};
use crate::units::{LOW_SPEED_MARGIN, SIDEREAL_RATE};
use async_trait::async_trait;

/// Encoder value of an initialized axis at its reference position.
pub const REFERENCE_POSITION: i64 = 0x80_0000;

/// Smallest clock tick count the controller accepts.
pub const MIN_CLOCK_TICKS: i64 = 6;

/// Firmware specific tick correction for 1.6.00 and 1.6.01.
const TICK_CORRECTION: i64 = 3;

/// Goto deceleration ramp ceilings in microsteps.
const HIGH_SPEED_GOTO_RAMP: i64 = 3200;
const LOW_SPEED_GOTO_RAMP: i64 = 200;

/// Rates at or below this are treated as a stop request.
const NEGLIGIBLE_RATE: f64 = SIDEREAL_RATE / 1000.0;

/// `G` function digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionMode {
    HighSpeedGoto,
    LowSpeedSlew,
    LowSpeedGoto,
    HighSpeedSlew,
}

impl MotionMode {
    fn slew(high_speed: bool) -> Self {
        if high_speed {
            Self::HighSpeedSlew
        } else {
            Self::LowSpeedSlew
        }
    }

    fn goto(high_speed: bool) -> Self {
        if high_speed {
            Self::HighSpeedGoto
        } else {
            Self::LowSpeedGoto
        }
    }

    fn command(self, forward: bool) -> Command {
        let func = match self {
            Self::HighSpeedGoto => '0',
            Self::LowSpeedSlew => '1',
            Self::LowSpeedGoto => '2',
            Self::HighSpeedSlew => '3',
        };
        let direction = if forward { '0' } else { '1' };
        Command::with_payload(Opcode::SetMotionMode, format!("{}{}", func, direction))
    }
}

fn legacy_value(value: i64, what: &str) -> MountResult<String> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v <= LEGACY_MAX)
        .map(encode_legacy_u24)
        .ok_or_else(|| MountError::InvalidArgument(format!("{} {} does not fit in 24 bits", what, value)))
}

/// Strategy for firmware before 3.22.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyDialect;

impl LegacyDialect {
    /// Stop the axis if needed and select the slew mode.
    ///
    /// An axis already running compatibly keeps running and its mode is left
    /// unchanged. `high_speed` must already reflect silent mode, so a silent
    /// mount never stops a low speed slew just because the rate is large.
    async fn prepare_for_slewing(
        &self,
        mount: &mut Mount,
        axis: Axis,
        forward: bool,
        high_speed: bool,
    ) -> MountResult<()> {
        if !mount
            .stop_if_incompatible(self, axis, forward, high_speed)
            .await?
        {
            return Ok(());
        }
        mount
            .talk(axis, &MotionMode::slew(high_speed).command(forward))
            .await
            .map(drop)
    }
}

#[async_trait]
impl Dialect for LegacyDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Legacy
    }

    fn reference_position(&self) -> i64 {
        REFERENCE_POSITION
    }

    fn resolution_query(&self) -> Command {
        Command::bare(Opcode::GetMicrostepsPerRevolution)
    }

    fn worm_resolution_query(&self) -> Command {
        Command::bare(Opcode::GetMicrostepsPerWormRevolution)
    }

    fn decode_calibration(&self, payload: &str) -> MountResult<u32> {
        decode_legacy_u24(payload)
    }

    fn encoder_query(&self) -> Command {
        Command::bare(Opcode::GetEncoder)
    }

    fn decode_encoder(&self, payload: &str) -> MountResult<Option<i64>> {
        let value = decode_legacy_u24(payload)?;
        Ok((value > 0).then_some(i64::from(value)))
    }

    fn set_encoder_command(&self, microsteps: i64) -> MountResult<Command> {
        Ok(Command::with_payload(
            Opcode::SetEncoder,
            legacy_value(microsteps, "encoder position")?,
        ))
    }

    async fn slew(
        &self,
        mount: &mut Mount,
        axis: Axis,
        rate: f64,
        ignore_silent_mode: bool,
    ) -> MountResult<()> {
        if rate.abs() <= NEGLIGIBLE_RATE {
            return self.slow_stop(mount, axis).await;
        }

        let forward = rate > 0.0;
        let magnitude = rate.abs();
        let high_speed =
            magnitude > LOW_SPEED_MARGIN && (ignore_silent_mode || !mount.settings().silent_slew_mode);

        self.prepare_for_slewing(mount, axis, forward, high_speed)
            .await?;

        let calibration = mount.calibration(axis)?;
        let internal_rate = if high_speed {
            magnitude / f64::from(calibration.high_speed_ratio())
        } else {
            magnitude
        };
        let mut ticks = calibration.radians_per_second_to_clock_ticks(internal_rate)?;
        let firmware = mount
            .identity()
            .map(|id| id.firmware)
            .ok_or(MountError::NotInitialized)?;
        if firmware.needs_tick_correction() {
            ticks -= TICK_CORRECTION;
        }
        let ticks = ticks.clamp(MIN_CLOCK_TICKS, i64::from(LEGACY_MAX));
        tracing::trace!(%axis, rate, high_speed, ticks, "Slew");

        mount
            .talk(
                axis,
                &Command::with_payload(Opcode::SetStepPeriod, legacy_value(ticks, "step period")?),
            )
            .await?;
        mount
            .talk(axis, &Command::bare(Opcode::StartMotion))
            .await?;

        let state = mount.axis_mut(axis);
        state.status.mark_slewing(forward, high_speed);
        state.slewing_rate = rate;
        Ok(())
    }

    async fn slew_to(
        &self,
        mount: &mut Mount,
        axis: Axis,
        offset: i64,
        verbose: bool,
    ) -> MountResult<()> {
        if offset == 0 {
            return Ok(());
        }
        let forward = offset > 0;
        let magnitude = offset.abs();
        let target_offset = legacy_value(magnitude, "goto offset")?;

        let margin = mount.calibration(axis)?.low_speed_goto_margin();
        let high_speed = magnitude > margin && !mount.settings().silent_slew_mode;

        let current = mount.axis(axis).current_encoder;
        let target = current + offset;
        mount.axis_mut(axis).last_slew_to_target = Some(target);
        log_goto(axis, offset, current, target, verbose);

        mount
            .stop_if_incompatible(self, axis, forward, high_speed)
            .await?;

        let ramp = magnitude.min(if high_speed {
            HIGH_SPEED_GOTO_RAMP
        } else {
            LOW_SPEED_GOTO_RAMP
        });

        mount
            .talk(axis, &MotionMode::goto(high_speed).command(forward))
            .await?;
        mount
            .talk(axis, &Command::with_payload(Opcode::SetGotoTargetOffset, target_offset))
            .await?;
        mount
            .talk(
                axis,
                &Command::with_payload(Opcode::SetGotoRampLength, legacy_value(ramp, "ramp length")?),
            )
            .await?;
        mount
            .talk(axis, &Command::bare(Opcode::StartMotion))
            .await?;

        mount.axis_mut(axis).status.mark_slewing_to(forward, high_speed);
        Ok(())
    }

    async fn slew_to_absolute(
        &self,
        mount: &mut Mount,
        axis: Axis,
        target: i64,
        verbose: bool,
    ) -> MountResult<()> {
        let current = mount.read_encoder(axis).await?;
        self.slew_to(mount, axis, target - current, verbose).await
    }

    async fn slow_stop(&self, mount: &mut Mount, axis: Axis) -> MountResult<()> {
        mount
            .talk(axis, &Command::bare(Opcode::StopMotion))
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_mode_frames() {
        assert_eq!(
            MotionMode::slew(true).command(true).frame(Axis::Primary),
            b":G130\r".to_vec()
        );
        assert_eq!(
            MotionMode::slew(false).command(false).frame(Axis::Primary),
            b":G111\r".to_vec()
        );
        assert_eq!(
            MotionMode::goto(true).command(false).frame(Axis::Secondary),
            b":G201\r".to_vec()
        );
        assert_eq!(
            MotionMode::goto(false).command(true).frame(Axis::Secondary),
            b":G220\r".to_vec()
        );
    }

    #[test]
    fn test_encoder_zero_is_ignored() {
        let dialect = LegacyDialect;
        assert_eq!(dialect.decode_encoder("000000").unwrap(), None);
        assert_eq!(dialect.decode_encoder("000080").unwrap(), Some(0x800000));
    }

    #[test]
    fn test_set_encoder_range() {
        let dialect = LegacyDialect;
        assert_eq!(
            dialect.set_encoder_command(0x800000).unwrap().payload,
            "000080"
        );
        assert!(dialect.set_encoder_command(-1).is_err());
        assert!(dialect.set_encoder_command(0x100_0000).is_err());
    }
}
