//! Mount session: identity, calibration and per-axis state.
//!
//! A [`Mount`] owns the command channel and everything learned from the
//! controller. [`Mount::initialize`] runs the bring-up sequence:
//!
//! 1. Probe the motor type (DC motors echo a lone `:`; steppers stay silent)
//! 2. Read the firmware version and pick the command dialect
//! 3. Fetch per-axis calibration
//! 4. Apply mount family corrections and derive unit constants
//! 5. Establish the reference position, initializing the controller if needed
//! 6. Derive the goto margins
//!
//! Any failure aborts bring-up and leaves the mount uninitialized; motion
//! operations then fail with [`MountError::NotInitialized`] until bring-up is
//! run again from scratch.

use crate::config::MountConfig;
use crate::error::{MountError, MountResult, TransportError};
use crate::motion::{advanced::AdvancedDialect, legacy::LegacyDialect, Dialect};
use crate::protocol::codec::{decode_legacy_u24, decode_legacy_u8, repack_firmware_word};
use crate::protocol::{Axis, Command, CommandChannel, Opcode, PerAxis, RetryPolicy, START_CHAR_OUT};
use crate::status::AxisStatus;
use crate::transport::{open_serial_async, MountTransport, SerialTransport};
use crate::units::AxisCalibration;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Firmware word of the motor controller: `major.minor.mount_code`, one byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FirmwareVersion(pub u32);

impl FirmwareVersion {
    /// First firmware with the advanced command set (3.22).
    pub const ADVANCED_COMMAND_SET: FirmwareVersion = FirmwareVersion(0x03_22_00);

    /// Decode the reply of the firmware version query.
    pub fn from_payload(payload: &str) -> MountResult<Self> {
        decode_legacy_u24(payload).map(|v| Self(repack_firmware_word(v)))
    }

    /// Major version byte.
    pub fn major(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Minor version byte.
    pub fn minor(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Mount model code carried in the low byte.
    pub fn mount_code(self) -> u8 {
        self.0 as u8
    }

    /// Mount family derived from the model code.
    pub fn family(self) -> MountFamily {
        MountFamily(self.mount_code())
    }

    /// Whether the advanced (hex) command set is available.
    pub fn supports_advanced(self) -> bool {
        self >= Self::ADVANCED_COMMAND_SET
    }

    /// Firmware 1.6.00 / 1.6.01 run slow by 3 clock ticks per microstep.
    pub fn needs_tick_correction(self) -> bool {
        matches!(self.0, 0x01_06_00 | 0x01_06_01)
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}.{:02X}.{:02X}", self.major(), self.minor(), self.mount_code())
    }
}

/// Mount model code reported in the firmware word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MountFamily(pub u8);

impl MountFamily {
    /// EQ6.
    pub const EQ6: MountFamily = MountFamily(0x00);
    /// HEQ5.
    pub const HEQ5: MountFamily = MountFamily(0x01);
    /// EQ5.
    pub const EQ5: MountFamily = MountFamily(0x02);
    /// EQ3.
    pub const EQ3: MountFamily = MountFamily(0x03);
    /// AZ-EQ6.
    pub const AZEQ6: MountFamily = MountFamily(0x22);
    /// GT (Merlin).
    pub const GT: MountFamily = MountFamily(0x80);
    /// Multi-function (Merlin).
    pub const MF: MountFamily = MountFamily(0x81);
    /// 114GT (Merlin).
    pub const GT_114: MountFamily = MountFamily(0x82);
    /// Dobsonian.
    pub const DOB: MountFamily = MountFamily(0x90);

    /// Merlin family controllers (codes 0x80 to 0x8F).
    pub fn is_merlin(self) -> bool {
        (0x80..0x90).contains(&self.0)
    }

    /// The 114GT, which misreports its resolution.
    pub fn is_114gt(self) -> bool {
        self == Self::GT_114
    }

    /// Model name for known codes.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::EQ6 => "EQ6",
            Self::HEQ5 => "HEQ5",
            Self::EQ5 => "EQ5",
            Self::EQ3 => "EQ3",
            Self::AZEQ6 => "AZ-EQ6",
            Self::GT => "GT",
            Self::MF => "MF",
            Self::GT_114 => "114GT",
            Self::DOB => "DOB",
            _ => return None,
        })
    }
}

impl std::fmt::Display for MountFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:02X})", name, self.0),
            None => write!(f, "unknown (0x{:02X})", self.0),
        }
    }
}

/// Drive hardware detected by the motor probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorKind {
    /// Stepper motors with worm gear periodic error data.
    Stepper,
    /// DC servo motors; no worm revolution calibration.
    Dc,
}

/// Command dialect chosen from the firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DialectKind {
    /// 6-digit byte-swapped values, one opcode per operation.
    Legacy,
    /// Fixed width hex values under opcode `X`.
    Advanced,
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialectKind::Legacy => write!(f, "legacy"),
            DialectKind::Advanced => write!(f, "advanced"),
        }
    }
}

/// Positive rotation sense of an axis as seen from the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RotationSense {
    /// Clockwise.
    Clockwise,
    /// Anticlockwise.
    Anticlockwise,
}

/// What bring-up learned about the mount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MountIdentity {
    /// Firmware word.
    pub firmware: FirmwareVersion,
    /// Mount model.
    pub family: MountFamily,
    /// Motor type.
    pub motor: MotorKind,
    /// Command dialect in use.
    pub dialect: DialectKind,
}

/// Behavioural settings of a [`Mount`].
#[derive(Debug, Clone, PartialEq)]
pub struct MountSettings {
    /// Force low speed mode unless a caller explicitly overrides it.
    pub silent_slew_mode: bool,
    /// How long the motor probe waits for an echo.
    pub probe_timeout: Duration,
    /// Deadline for stop-and-wait sequences.
    pub stop_timeout: Duration,
    /// Status polling period while waiting for a stop.
    pub poll_interval: Duration,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            silent_slew_mode: true,
            probe_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Mutable state of one axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AxisState {
    /// Last known motion state.
    pub status: AxisStatus,
    /// Encoder value from the last successful read.
    pub current_encoder: i64,
    /// Reference ("Polaris") position fixed at bring-up.
    pub reference_encoder: i64,
    /// Zero position fixed at bring-up.
    pub zero_encoder: i64,
    /// Absolute target of the last goto.
    pub last_slew_to_target: Option<i64>,
    /// Rate of the last slew command, radians per second.
    pub slewing_rate: f64,
}

struct Session {
    identity: MountIdentity,
    calibration: PerAxis<AxisCalibration>,
    dialect: Arc<dyn Dialect>,
}

/// A Sky-Watcher mount reached through one command channel.
pub struct Mount {
    channel: CommandChannel,
    axes: PerAxis<AxisState>,
    session: Option<Session>,
    settings: MountSettings,
}

impl Mount {
    /// Mount over `channel`. Call [`Mount::initialize`] before moving it.
    pub fn new(channel: CommandChannel, settings: MountSettings) -> Self {
        Self {
            channel,
            axes: PerAxis::default(),
            session: None,
            settings,
        }
    }

    /// Mount over `transport` with retry, timeouts and settings from `config`.
    pub fn with_config(transport: Box<dyn MountTransport>, config: &MountConfig) -> Self {
        let channel = CommandChannel::new(transport)
            .with_retry_policy(RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_delay: config.retry_backoff(),
            })
            .with_read_timeout(config.read_timeout());
        Self::new(channel, config.settings())
    }

    /// Open the configured serial port. Bring-up is not run.
    pub async fn connect(config: &MountConfig) -> anyhow::Result<Self> {
        let port = open_serial_async(&config.port, config.baud_rate).await?;
        tracing::info!(port = %config.port, baud = config.baud_rate, "Opened mount serial port");
        let transport = SerialTransport::new(Box::new(port));
        Ok(Self::with_config(Box::new(transport), config))
    }

    /// Current settings.
    pub fn settings(&self) -> &MountSettings {
        &self.settings
    }

    /// Enable or disable silent slew mode.
    pub fn set_silent_slew_mode(&mut self, silent: bool) {
        self.settings.silent_slew_mode = silent;
    }

    /// Whether bring-up completed.
    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Identity learned at bring-up.
    pub fn identity(&self) -> Option<&MountIdentity> {
        self.session.as_ref().map(|s| &s.identity)
    }

    /// Calibration of `axis`.
    pub fn calibration(&self, axis: Axis) -> MountResult<&AxisCalibration> {
        self.session
            .as_ref()
            .map(|s| &s.calibration[axis])
            .ok_or(MountError::NotInitialized)
    }

    /// State of `axis`.
    pub fn axis(&self, axis: Axis) -> &AxisState {
        &self.axes[axis]
    }

    pub(crate) fn axis_mut(&mut self, axis: Axis) -> &mut AxisState {
        &mut self.axes[axis]
    }

    pub(crate) fn dialect(&self) -> MountResult<Arc<dyn Dialect>> {
        self.session
            .as_ref()
            .map(|s| s.dialect.clone())
            .ok_or(MountError::NotInitialized)
    }

    /// Positive rotation sense of `axis`.
    pub fn positive_rotation_direction(&self, _axis: Axis) -> MountResult<RotationSense> {
        let identity = self.identity().ok_or(MountError::NotInitialized)?;
        Ok(if identity.family.is_114gt() {
            RotationSense::Clockwise
        } else {
            RotationSense::Anticlockwise
        })
    }

    /// Exchange one command with `axis`.
    pub async fn talk(&mut self, axis: Axis, command: &Command) -> MountResult<String> {
        self.channel.talk(axis, command).await
    }

    /// Run the bring-up sequence, replacing any previous session.
    #[instrument(skip(self), err)]
    pub async fn initialize(&mut self) -> MountResult<MountIdentity> {
        self.session = None;
        self.axes = PerAxis::default();

        let motor = self.probe_motor().await?;

        let payload = self
            .talk(Axis::Primary, &Command::bare(Opcode::GetFirmwareVersion))
            .await?;
        let firmware = FirmwareVersion::from_payload(&payload)?;
        let family = firmware.family();
        let dialect: Arc<dyn Dialect> = if firmware.supports_advanced() {
            Arc::new(AdvancedDialect)
        } else {
            Arc::new(LegacyDialect)
        };
        tracing::info!(%firmware, %family, ?motor, dialect = %dialect.kind(), "Motor controller identified");

        let mut resolution = PerAxis::new(0, 0);
        for axis in Axis::ALL {
            let payload = self.talk(axis, &dialect.resolution_query()).await?;
            resolution[axis] = dialect.decode_calibration(&payload)?;
        }

        let mut clock = PerAxis::new(0, 0);
        for axis in Axis::ALL {
            let payload = self
                .talk(axis, &Command::bare(Opcode::GetStepperClockFrequency))
                .await?;
            clock[axis] = decode_legacy_u24(&payload)?;
        }

        let mut ratio = PerAxis::new(0, 0);
        for axis in Axis::ALL {
            let payload = self
                .talk(axis, &Command::bare(Opcode::GetHighSpeedRatio))
                .await?;
            ratio[axis] = u32::from(decode_legacy_u8(&payload)?);
        }

        // DC motor controllers have no PEC support
        let mut worm = PerAxis::new(None, None);
        if motor == MotorKind::Stepper {
            for axis in Axis::ALL {
                let payload = self.talk(axis, &dialect.worm_resolution_query()).await?;
                worm[axis] = Some(dialect.decode_calibration(&payload)?);
            }
        }

        let calibration = PerAxis::new(
            AxisCalibration::try_new(
                Axis::Primary,
                resolution[Axis::Primary],
                clock[Axis::Primary],
                ratio[Axis::Primary],
                worm[Axis::Primary],
                family,
            )?,
            AxisCalibration::try_new(
                Axis::Secondary,
                resolution[Axis::Secondary],
                clock[Axis::Secondary],
                ratio[Axis::Secondary],
                worm[Axis::Secondary],
                family,
            )?,
        );

        for axis in Axis::ALL {
            self.refresh_status(axis).await?;
        }

        if Axis::ALL.iter().all(|&a| self.axes[a].status.not_initialized()) {
            for axis in Axis::ALL {
                self.read_encoder_with(dialect.as_ref(), axis).await?;
            }
            tracing::debug!(
                axis1 = self.axes[Axis::Primary].current_encoder,
                axis2 = self.axes[Axis::Secondary].current_encoder,
                "Encoders before init"
            );
            for axis in Axis::ALL {
                let state = &mut self.axes[axis];
                state.reference_encoder = state.current_encoder;
                state.zero_encoder = state.current_encoder;
            }
            for axis in Axis::ALL {
                self.talk(axis, &Command::bare(Opcode::InitializationDone))
                    .await?;
            }
        } else {
            let reference = dialect.reference_position();
            for axis in Axis::ALL {
                let state = &mut self.axes[axis];
                state.reference_encoder = reference;
                state.zero_encoder = reference;
            }
        }

        let identity = MountIdentity {
            firmware,
            family,
            motor,
            dialect: dialect.kind(),
        };
        self.session = Some(Session {
            identity: identity.clone(),
            calibration,
            dialect,
        });
        tracing::info!(
            goto_margin_axis1 = self.calibration(Axis::Primary)?.low_speed_goto_margin(),
            goto_margin_axis2 = self.calibration(Axis::Secondary)?.low_speed_goto_margin(),
            "Mount initialized"
        );
        Ok(identity)
    }

    /// Send a lone start character and classify the reaction.
    async fn probe_motor(&mut self) -> MountResult<MotorKind> {
        let timeout = self.settings.probe_timeout;
        let probe_failed = |e: TransportError| MountError::MotorProbe(e.to_string());
        let transport = self.channel.transport_mut();

        transport.flush_input().await.map_err(probe_failed)?;
        transport
            .write_bytes(&[START_CHAR_OUT])
            .await
            .map_err(probe_failed)?;

        // Only a bare echo marks a DC controller; silence marks a stepper.
        match transport.read_byte(timeout).await {
            Ok(START_CHAR_OUT) => Ok(MotorKind::Dc),
            Ok(other) => Err(MountError::MotorProbe(format!(
                "unexpected reply byte 0x{:02X}",
                other
            ))),
            Err(TransportError::Timeout(_)) => Ok(MotorKind::Stepper),
            Err(e) => Err(probe_failed(e)),
        }
    }

    /// Query the controller status of `axis` and store it.
    ///
    /// A stop observed right after a goto triggers an encoder read to log how
    /// far the axis ended up from its target.
    pub async fn refresh_status(&mut self, axis: Axis) -> MountResult<AxisStatus> {
        let payload = self.talk(axis, &Command::bare(Opcode::GetStatus)).await?;
        let status = AxisStatus::decode(&payload)?;
        let previous = std::mem::replace(&mut self.axes[axis].status, status);

        if status.is_full_stop() && previous.is_slewing_to() {
            if let (Ok(dialect), Some(target)) = (self.dialect(), self.axes[axis].last_slew_to_target) {
                match self.read_encoder_with(dialect.as_ref(), axis).await {
                    Ok(encoder) => tracing::debug!(
                        %axis,
                        target,
                        encoder,
                        offset = target - encoder,
                        "Goto complete"
                    ),
                    Err(e) => tracing::debug!(%axis, error = %e, "Could not read encoder after goto"),
                }
            }
        }
        Ok(status)
    }

    /// Read the encoder of `axis` into its current position.
    pub async fn read_encoder(&mut self, axis: Axis) -> MountResult<i64> {
        let dialect = self.dialect()?;
        self.read_encoder_with(dialect.as_ref(), axis).await
    }

    async fn read_encoder_with(&mut self, dialect: &dyn Dialect, axis: Axis) -> MountResult<i64> {
        let payload = self.talk(axis, &dialect.encoder_query()).await?;
        match dialect.decode_encoder(&payload)? {
            Some(encoder) => self.axes[axis].current_encoder = encoder,
            None => tracing::warn!(%axis, "Ignoring zero encoder reading"),
        }
        Ok(self.axes[axis].current_encoder)
    }
}
