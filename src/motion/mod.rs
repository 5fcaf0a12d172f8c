//! Motion control.
//!
//! Public operations live on [`Mount`]; everything that differs between the
//! legacy and advanced command sets is behind the [`Dialect`] trait, chosen
//! once at bring-up.

pub mod advanced;
pub mod legacy;

use crate::error::{MountError, MountResult};
use crate::protocol::codec::{encode_legacy_u24, LEGACY_MAX};
use crate::protocol::{Axis, Command, Opcode};
use crate::session::{DialectKind, Mount};
use crate::units::MAX_SPEED;
use async_trait::async_trait;
use tracing::instrument;

/// Command set specific behaviour.
///
/// Implementations receive the mount explicitly so they can exchange commands
/// and update axis state; they hold no state of their own.
#[async_trait]
pub trait Dialect: Send + Sync {
    /// Which command set this is.
    fn kind(&self) -> DialectKind;

    /// Reference position assumed when the controller was already initialized.
    fn reference_position(&self) -> i64;

    /// Query for microsteps per revolution.
    fn resolution_query(&self) -> Command;

    /// Query for microsteps per worm revolution.
    fn worm_resolution_query(&self) -> Command;

    /// Decode a resolution style calibration reply.
    fn decode_calibration(&self, payload: &str) -> MountResult<u32>;

    /// Query for the axis position.
    fn encoder_query(&self) -> Command;

    /// Decode an encoder reply. `None` means the reading must be ignored.
    fn decode_encoder(&self, payload: &str) -> MountResult<Option<i64>>;

    /// Command setting the axis position.
    fn set_encoder_command(&self, microsteps: i64) -> MountResult<Command>;

    /// Slew at `rate` radians per second; the rate is already clamped.
    async fn slew(
        &self,
        mount: &mut Mount,
        axis: Axis,
        rate: f64,
        ignore_silent_mode: bool,
    ) -> MountResult<()>;

    /// Goto by a nonzero `offset` in microsteps from the current position.
    async fn slew_to(
        &self,
        mount: &mut Mount,
        axis: Axis,
        offset: i64,
        verbose: bool,
    ) -> MountResult<()>;

    /// Goto the absolute position `target` in microsteps.
    async fn slew_to_absolute(
        &self,
        mount: &mut Mount,
        axis: Axis,
        target: i64,
        verbose: bool,
    ) -> MountResult<()>;

    /// Decelerate to a stop without waiting for it.
    async fn slow_stop(&self, mount: &mut Mount, axis: Axis) -> MountResult<()>;
}

/// Clamp a rate to +/- [`MAX_SPEED`].
pub fn clamp_rate(rate: f64) -> f64 {
    rate.clamp(-MAX_SPEED, MAX_SPEED)
}

/// Log a goto request at debug level when `verbose`, trace otherwise.
pub(crate) fn log_goto(axis: Axis, offset: i64, current: i64, target: i64, verbose: bool) {
    if verbose {
        tracing::debug!(%axis, offset, current, target, "SlewTo");
    } else {
        tracing::trace!(%axis, offset, current, target, "SlewTo");
    }
}

impl Mount {
    /// Slew `axis` continuously at `rate` radians per second.
    ///
    /// The rate is clamped to +/- [`MAX_SPEED`]. High speed mode is only used
    /// when silent slew mode is off or `ignore_silent_mode` is set.
    #[instrument(skip(self), err)]
    pub async fn slew(&mut self, axis: Axis, rate: f64, ignore_silent_mode: bool) -> MountResult<()> {
        if !rate.is_finite() {
            return Err(MountError::InvalidArgument(format!("slew rate {}", rate)));
        }
        let dialect = self.dialect()?;
        let rate = clamp_rate(rate);
        dialect.slew(self, axis, rate, ignore_silent_mode).await
    }

    /// Slew `axis` at `rate` degrees per second.
    pub async fn slew_degrees(
        &mut self,
        axis: Axis,
        degrees_per_second: f64,
        ignore_silent_mode: bool,
    ) -> MountResult<()> {
        self.slew(axis, degrees_per_second.to_radians(), ignore_silent_mode)
            .await
    }

    /// Goto by `offset` microsteps relative to the current position.
    ///
    /// An offset of zero does nothing.
    #[instrument(skip(self), err)]
    pub async fn slew_to(&mut self, axis: Axis, offset: i64, verbose: bool) -> MountResult<()> {
        if offset == 0 {
            return Ok(());
        }
        let dialect = self.dialect()?;
        dialect.slew_to(self, axis, offset, verbose).await
    }

    /// Goto the absolute encoder position `target`.
    #[instrument(skip(self), err)]
    pub async fn slew_to_absolute(&mut self, axis: Axis, target: i64, verbose: bool) -> MountResult<()> {
        let dialect = self.dialect()?;
        dialect.slew_to_absolute(self, axis, target, verbose).await
    }

    /// Decelerate `axis` to a stop. Does not wait for the stop.
    #[instrument(skip(self), err)]
    pub async fn slow_stop(&mut self, axis: Axis) -> MountResult<()> {
        let dialect = self.dialect()?;
        dialect.slow_stop(self, axis).await
    }

    /// Stop `axis` immediately, skipping the deceleration ramp.
    ///
    /// Only for emergencies: stopping a heavy load without a ramp stresses the
    /// gears. Works before bring-up.
    #[instrument(skip(self), err)]
    pub async fn instant_stop(&mut self, axis: Axis) -> MountResult<()> {
        tracing::warn!(%axis, "Instant stop");
        self.talk(axis, &Command::bare(Opcode::InstantStop)).await?;
        self.axis_mut(axis).status.mark_stopped();
        Ok(())
    }

    /// Whether `axis` is slewing or on a goto, from local state only.
    pub fn is_in_motion(&self, axis: Axis) -> bool {
        self.axis(axis).status.is_in_motion()
    }

    /// Rate of the last slew command on `axis`, radians per second.
    pub fn slewing_rate(&self, axis: Axis) -> f64 {
        self.axis(axis).slewing_rate
    }

    /// Poll the status of `axis` until it reports a full stop.
    ///
    /// Polls every `poll_interval` and gives up after `stop_timeout`.
    ///
    /// # Errors
    /// [`MountError::StopTimeout`] if the axis is still running at the
    /// deadline; callers may escalate to [`Mount::instant_stop`].
    pub async fn wait_for_full_stop(&mut self, axis: Axis) -> MountResult<()> {
        let timeout = self.settings().stop_timeout;
        let interval = self.settings().poll_interval;
        let start = tokio::time::Instant::now();
        loop {
            if self.refresh_status(axis).await?.is_full_stop() {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                tracing::warn!(%axis, ?waited, "Axis did not stop in time");
                return Err(MountError::StopTimeout { axis, waited });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Stop `axis` if it is running in a way incompatible with a new move in
    /// `forward` direction and `high_speed` mode, and wait for the stop.
    ///
    /// Returns `true` if the axis is now stopped, `false` if it is still
    /// running compatibly.
    pub(crate) async fn stop_if_incompatible(
        &mut self,
        dialect: &dyn Dialect,
        axis: Axis,
        forward: bool,
        high_speed: bool,
    ) -> MountResult<bool> {
        let status = self.refresh_status(axis).await?;
        if status.is_full_stop() {
            return Ok(true);
        }
        if !status.needs_stop_for(forward, high_speed) {
            return Ok(false);
        }
        tracing::debug!(%axis, state = ?status.state(), "Stopping axis before mode change");
        dialect.slow_stop(self, axis).await?;
        self.wait_for_full_stop(axis).await?;
        Ok(true)
    }

    /// Set the encoder position of `axis`.
    #[instrument(skip(self), err)]
    pub async fn set_encoder(&mut self, axis: Axis, microsteps: i64) -> MountResult<()> {
        let dialect = self.dialect()?;
        let command = dialect.set_encoder_command(microsteps)?;
        self.talk(axis, &command).await?;
        self.axis_mut(axis).current_encoder = microsteps;
        Ok(())
    }

    /// Set the slew mode deceleration ramp length of `axis`.
    pub async fn set_slew_deceleration_ramp(&mut self, axis: Axis, microsteps: u32) -> MountResult<()> {
        let command = Command::with_payload(
            Opcode::SetSlewRampLength,
            encode_legacy_u24(microsteps.min(LEGACY_MAX)),
        );
        self.talk(axis, &command).await.map(drop)
    }

    /// Switch the auxiliary (camera) output.
    pub async fn set_switch(&mut self, on: bool) -> MountResult<()> {
        let payload = if on { "1" } else { "0" };
        self.talk(Axis::Primary, &Command::with_payload(Opcode::SetSwitch, payload))
            .await
            .map(drop)
    }
}
