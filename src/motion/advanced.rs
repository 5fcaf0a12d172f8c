//! Advanced command set (firmware 3.22 and later).
//!
//! Values are plain fixed-width hex. Slewing is a single signed-rate command;
//! the controller switches modes internally, so no stop-and-wait is needed.

use super::{log_goto, Dialect};
use crate::error::{MountError, MountResult};
use crate::protocol::codec::{decode_hex_i32, decode_hex_u32, encode_hex_i32, encode_hex_i64};
use crate::protocol::{words, Axis, Command};
use crate::session::{DialectKind, Mount};
use async_trait::async_trait;

/// Velocity after a goto: stop at the target.
const ZERO_VELOCITY: &str = "0000000000000000";

fn encoder_value(microsteps: i64) -> MountResult<i32> {
    i32::try_from(microsteps).map_err(|_| {
        MountError::InvalidArgument(format!("position {} does not fit in 32 bits", microsteps))
    })
}

/// Strategy for firmware 3.22 and later.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvancedDialect;

impl AdvancedDialect {
    /// Start a goto to `target`, with direction taken from a fresh `current`.
    async fn goto_from(
        &self,
        mount: &mut Mount,
        axis: Axis,
        current: i64,
        target: i64,
        verbose: bool,
    ) -> MountResult<()> {
        let destination = encoder_value(target)?;
        mount.axis_mut(axis).last_slew_to_target = Some(target);
        log_goto(axis, target - current, current, target, verbose);

        let data = format!("{}{}", encode_hex_i32(destination), ZERO_VELOCITY);
        mount
            .talk(axis, &Command::advanced(words::GOTO_SLEW, &data))
            .await?;

        mount
            .axis_mut(axis)
            .status
            .mark_slewing_to(target >= current, false);
        Ok(())
    }
}

#[async_trait]
impl Dialect for AdvancedDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Advanced
    }

    fn reference_position(&self) -> i64 {
        0
    }

    fn resolution_query(&self) -> Command {
        Command::advanced(words::READ_RESOLUTION, "")
    }

    fn worm_resolution_query(&self) -> Command {
        Command::advanced(words::READ_WORM_RESOLUTION, "")
    }

    fn decode_calibration(&self, payload: &str) -> MountResult<u32> {
        decode_hex_u32(payload)
    }

    fn encoder_query(&self) -> Command {
        Command::advanced(words::READ_ENCODER, "")
    }

    fn decode_encoder(&self, payload: &str) -> MountResult<Option<i64>> {
        decode_hex_i32(payload).map(|v| Some(i64::from(v)))
    }

    fn set_encoder_command(&self, microsteps: i64) -> MountResult<Command> {
        let value = encoder_value(microsteps)?;
        Ok(Command::advanced(words::SET_ENCODER, &encode_hex_i32(value)))
    }

    async fn slew(
        &self,
        mount: &mut Mount,
        axis: Axis,
        rate: f64,
        _ignore_silent_mode: bool,
    ) -> MountResult<()> {
        let encoded = mount.calibration(axis)?.advanced_rate(rate);
        tracing::trace!(%axis, rate, encoded, "Slew");
        mount
            .talk(axis, &Command::advanced(words::SET_SPEED, &encode_hex_i64(encoded)))
            .await?;

        let state = mount.axis_mut(axis);
        // A zero rate decelerates to a stop; the next refresh observes it
        if encoded != 0 {
            state.status.mark_slewing(encoded > 0, false);
        }
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
        let current = mount.read_encoder(axis).await?;
        self.goto_from(mount, axis, current, current + offset, verbose)
            .await
    }

    async fn slew_to_absolute(
        &self,
        mount: &mut Mount,
        axis: Axis,
        target: i64,
        verbose: bool,
    ) -> MountResult<()> {
        mount.calibration(axis)?;
        encoder_value(target)?;
        let current = mount.read_encoder(axis).await?;
        self.goto_from(mount, axis, current, target, verbose).await
    }

    async fn slow_stop(&self, mount: &mut Mount, axis: Axis) -> MountResult<()> {
        self.slew(mount, axis, 0.0, true).await
    }
}
