//! Protocol-level mount simulator.
//!
//! [`SimulatedMount`] implements [`MountTransport`] by parsing each request
//! frame and answering like a motor controller. It understands both command
//! sets, both motor types and keeps a simple per-axis model: gotos complete
//! and slow stops take effect after a configurable number of status polls.
//!
//! A [`SimHandle`] shares the simulator state so tests can inspect the frame
//! log and axis registers, or inject faults into upcoming exchanges.

use crate::error::TransportError;
use crate::protocol::codec::{
    decode_hex_i32, decode_legacy_u24, encode_hex_i32, encode_hex_u32, encode_legacy_u24,
    repack_firmware_word, LEGACY_MAX,
};
use crate::protocol::{words, Axis, END_CHAR, ERROR_CHAR, START_CHAR_IN, START_CHAR_OUT};
use crate::session::{FirmwareVersion, MotorKind};
use crate::transport::MountTransport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Device error codes used by the simulator.
mod code {
    pub const UNKNOWN_COMMAND: u8 = 0;
    pub const LENGTH_ERROR: u8 = 1;
    pub const MOTOR_NOT_STOPPED: u8 = 2;
    pub const INVALID_CHARACTER: u8 = 3;
}

/// Hardware being simulated.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Firmware word (`major.minor.mount_code`).
    pub firmware: FirmwareVersion,
    /// Motor type; DC motors echo the probe byte.
    pub motor: MotorKind,
    /// Raw microsteps per revolution reported by both axes.
    pub microsteps_per_revolution: u32,
    /// Stepper clock frequency.
    pub stepper_clock_frequency: u32,
    /// High speed ratio.
    pub high_speed_ratio: u8,
    /// Microsteps per worm revolution.
    pub microsteps_per_worm_revolution: u32,
    /// Controller already initialized at power-on.
    pub initialized: bool,
    /// Encoder values at power-on.
    pub initial_encoders: [i64; 2],
    /// Status polls a slow stop takes; `None` never stops.
    pub stop_after_polls: Option<u32>,
    /// Status polls a goto takes to arrive.
    pub goto_after_polls: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::legacy()
    }
}

impl SimConfig {
    /// EQ6 with legacy firmware 3.10, freshly powered on.
    pub fn legacy() -> Self {
        Self {
            firmware: FirmwareVersion(0x03_10_00),
            motor: MotorKind::Stepper,
            microsteps_per_revolution: 9_024_000,
            stepper_clock_frequency: 64_935,
            high_speed_ratio: 16,
            microsteps_per_worm_revolution: 50_133,
            initialized: false,
            initial_encoders: [0x80_0000, 0x80_0000],
            stop_after_polls: Some(2),
            goto_after_polls: 3,
        }
    }

    /// EQ6 with advanced firmware 3.22, freshly powered on.
    pub fn advanced() -> Self {
        Self {
            firmware: FirmwareVersion(0x03_22_00),
            initial_encoders: [0, 0],
            ..Self::legacy()
        }
    }
}

/// Fault applied to the next exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Swallow the request; the read times out.
    Timeout,
    /// Answer `!` with this code.
    Reject(u8),
    /// Answer with these raw bytes.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
struct SimAxis {
    encoder: i64,
    running: bool,
    slewing: bool,
    forward: bool,
    high_speed: bool,
    mode_function: u8,
    mode_forward: bool,
    step_period: u32,
    goto_offset: u32,
    goto_ramp: u32,
    slew_ramp: u32,
    speed: i64,
    goto_target: Option<i64>,
    stop_countdown: Option<u32>,
    goto_countdown: Option<u32>,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    initialized: bool,
    axes: [SimAxis; 2],
    frames: Vec<String>,
    faults: VecDeque<SimFault>,
    switch_on: bool,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let axes = [
            SimAxis {
                encoder: config.initial_encoders[0],
                forward: true,
                mode_forward: true,
                ..SimAxis::default()
            },
            SimAxis {
                encoder: config.initial_encoders[1],
                forward: true,
                mode_forward: true,
                ..SimAxis::default()
            },
        ];
        Self {
            initialized: config.initialized,
            config,
            axes,
            frames: Vec::new(),
            faults: VecDeque::new(),
            switch_on: false,
        }
    }

    fn advanced(&self) -> bool {
        self.config.firmware.supports_advanced()
    }

    /// Answer one request frame (without terminator).
    fn respond(&mut self, frame: &[u8]) -> Result<String, u8> {
        if frame.len() < 3 || frame[0] != START_CHAR_OUT {
            return Err(code::LENGTH_ERROR);
        }
        let opcode = frame[1];
        let axis = Axis::from_char(frame[2] as char).ok_or(code::INVALID_CHARACTER)?;
        let payload = std::str::from_utf8(&frame[3..])
            .ok()
            .filter(|p| p.is_ascii())
            .ok_or(code::INVALID_CHARACTER)?;
        let idx = axis.index();
        let legacy_arg = || decode_legacy_u24(payload).map_err(|_| code::LENGTH_ERROR);

        match opcode {
            b'e' => Ok(encode_legacy_u24(repack_firmware_word(self.config.firmware.0))),
            b'a' => Ok(encode_legacy_u24(self.config.microsteps_per_revolution)),
            b'b' => Ok(encode_legacy_u24(self.config.stepper_clock_frequency)),
            b'g' => Ok(encode_legacy_u24(u32::from(self.config.high_speed_ratio))),
            b's' if self.config.motor == MotorKind::Stepper => {
                Ok(encode_legacy_u24(self.config.microsteps_per_worm_revolution))
            }
            b'j' => Ok(encode_legacy_u24((self.axes[idx].encoder as u32) & LEGACY_MAX)),
            b'f' => Ok(self.poll_status(idx)),
            b'F' => {
                self.initialized = true;
                Ok(String::new())
            }
            b'E' => {
                self.axes[idx].encoder = i64::from(legacy_arg()?);
                Ok(String::new())
            }
            b'G' => {
                let bytes = payload.as_bytes();
                if bytes.len() != 2 || !(b'0'..=b'3').contains(&bytes[0]) {
                    return Err(code::INVALID_CHARACTER);
                }
                let axis = &mut self.axes[idx];
                if axis.running {
                    return Err(code::MOTOR_NOT_STOPPED);
                }
                axis.mode_function = bytes[0] - b'0';
                axis.mode_forward = bytes[1] == b'0';
                Ok(String::new())
            }
            b'I' => {
                self.axes[idx].step_period = legacy_arg()?;
                Ok(String::new())
            }
            b'H' => {
                self.axes[idx].goto_offset = legacy_arg()?;
                Ok(String::new())
            }
            b'M' => {
                self.axes[idx].goto_ramp = legacy_arg()?;
                Ok(String::new())
            }
            b'U' => {
                self.axes[idx].slew_ramp = legacy_arg()?;
                Ok(String::new())
            }
            b'J' => {
                self.start(idx);
                Ok(String::new())
            }
            b'K' => {
                self.begin_stop(idx);
                Ok(String::new())
            }
            b'L' => {
                self.halt(idx);
                Ok(String::new())
            }
            b'O' => {
                self.switch_on = payload == "1";
                Ok(String::new())
            }
            b'X' if self.advanced() => self.respond_advanced(idx, payload),
            _ => Err(code::UNKNOWN_COMMAND),
        }
    }

    fn respond_advanced(&mut self, idx: usize, payload: &str) -> Result<String, u8> {
        // Goto carries no command word: 8 digit target + 16 digit velocity
        if payload.len() == 24 {
            let target = decode_hex_i32(&payload[..8]).map_err(|_| code::INVALID_CHARACTER)?;
            let goto_after = self.config.goto_after_polls;
            let axis = &mut self.axes[idx];
            let target = i64::from(target);
            axis.forward = target >= axis.encoder;
            axis.slewing = false;
            axis.high_speed = false;
            axis.running = true;
            axis.goto_target = Some(target);
            axis.goto_countdown = Some(goto_after);
            axis.stop_countdown = None;
            return Ok(String::new());
        }

        let (word, data) = if payload.starts_with(words::SET_ENCODER)
            || payload.starts_with(words::SET_SPEED)
        {
            payload.split_at(2)
        } else {
            payload.split_at(payload.len().min(4))
        };

        match word {
            words::READ_RESOLUTION => Ok(encode_hex_u32(self.config.microsteps_per_revolution)),
            words::READ_WORM_RESOLUTION if self.config.motor == MotorKind::Stepper => {
                Ok(encode_hex_u32(self.config.microsteps_per_worm_revolution))
            }
            words::READ_ENCODER => Ok(encode_hex_i32(self.axes[idx].encoder as i32)),
            words::SET_ENCODER => {
                let value = decode_hex_i32(data).map_err(|_| code::INVALID_CHARACTER)?;
                self.axes[idx].encoder = i64::from(value);
                Ok(String::new())
            }
            words::SET_SPEED => {
                if data.len() != 16 {
                    return Err(code::LENGTH_ERROR);
                }
                let speed = u64::from_str_radix(data, 16).map_err(|_| code::INVALID_CHARACTER)? as i64;
                let axis = &mut self.axes[idx];
                axis.speed = speed;
                if speed == 0 {
                    self.begin_stop(idx);
                } else {
                    axis.running = true;
                    axis.slewing = true;
                    axis.forward = speed > 0;
                    axis.high_speed = false;
                    axis.goto_countdown = None;
                    axis.stop_countdown = None;
                }
                Ok(String::new())
            }
            words::STOP => {
                self.begin_stop(idx);
                Ok(String::new())
            }
            words::INITIALIZE => {
                self.initialized = true;
                Ok(String::new())
            }
            _ => Err(code::UNKNOWN_COMMAND),
        }
    }

    fn start(&mut self, idx: usize) {
        let goto_after = self.config.goto_after_polls;
        let axis = &mut self.axes[idx];
        let function = axis.mode_function;
        axis.running = true;
        axis.slewing = function == 1 || function == 3;
        axis.high_speed = function == 0 || function == 3;
        axis.forward = axis.mode_forward;
        axis.stop_countdown = None;
        if axis.slewing {
            axis.goto_countdown = None;
            axis.goto_target = None;
        } else {
            let offset = i64::from(axis.goto_offset);
            axis.goto_target = Some(if axis.forward {
                axis.encoder + offset
            } else {
                axis.encoder - offset
            });
            axis.goto_countdown = Some(goto_after);
        }
    }

    fn begin_stop(&mut self, idx: usize) {
        if !self.axes[idx].running {
            return;
        }
        match self.config.stop_after_polls {
            Some(0) => self.halt(idx),
            Some(n) => self.axes[idx].stop_countdown = Some(n),
            None => {}
        }
    }

    fn halt(&mut self, idx: usize) {
        let axis = &mut self.axes[idx];
        axis.running = false;
        axis.speed = 0;
        axis.stop_countdown = None;
        axis.goto_countdown = None;
    }

    fn poll_status(&mut self, idx: usize) -> String {
        let axis = &mut self.axes[idx];
        if axis.running {
            if let Some(n) = axis.goto_countdown {
                if n == 0 {
                    if let Some(target) = axis.goto_target {
                        axis.encoder = target;
                    }
                    axis.running = false;
                    axis.goto_countdown = None;
                } else {
                    axis.goto_countdown = Some(n - 1);
                }
            }
            if let Some(n) = axis.stop_countdown {
                if n == 0 {
                    axis.running = false;
                    axis.speed = 0;
                    axis.stop_countdown = None;
                    axis.goto_countdown = None;
                } else {
                    axis.stop_countdown = Some(n - 1);
                }
            }
        }

        let mode = u8::from(axis.slewing) | (u8::from(!axis.forward) << 1) | (u8::from(axis.high_speed) << 2);
        format!(
            "{:X}{:X}{:X}",
            mode,
            u8::from(axis.running),
            u8::from(self.initialized)
        )
    }
}

/// Shared view of a simulator's state.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every frame received, without the terminator.
    pub fn frames(&self) -> Vec<String> {
        self.lock().frames.clone()
    }

    /// Forget the frame log.
    pub fn clear_frames(&self) {
        self.lock().frames.clear();
    }

    /// Apply `fault` to the next exchange that has not been faulted yet.
    pub fn inject(&self, fault: SimFault) {
        self.lock().faults.push_back(fault);
    }

    /// Change how many polls a slow stop takes.
    pub fn set_stop_after_polls(&self, polls: Option<u32>) {
        self.lock().config.stop_after_polls = polls;
    }

    /// Controller init flag.
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Encoder register of `axis`.
    pub fn encoder(&self, axis: Axis) -> i64 {
        self.lock().axes[axis.index()].encoder
    }

    /// Overwrite the encoder register of `axis` behind the driver's back.
    pub fn set_encoder(&self, axis: Axis, value: i64) {
        self.lock().axes[axis.index()].encoder = value;
    }

    /// Whether `axis` is moving.
    pub fn is_running(&self, axis: Axis) -> bool {
        self.lock().axes[axis.index()].running
    }

    /// Last step period (`I`) of `axis`.
    pub fn step_period(&self, axis: Axis) -> u32 {
        self.lock().axes[axis.index()].step_period
    }

    /// Last goto offset (`H`) of `axis`.
    pub fn goto_offset(&self, axis: Axis) -> u32 {
        self.lock().axes[axis.index()].goto_offset
    }

    /// Last goto ramp length (`M`) of `axis`.
    pub fn goto_ramp(&self, axis: Axis) -> u32 {
        self.lock().axes[axis.index()].goto_ramp
    }

    /// Last slew ramp length (`U`) of `axis`.
    pub fn slew_ramp(&self, axis: Axis) -> u32 {
        self.lock().axes[axis.index()].slew_ramp
    }

    /// Last advanced speed of `axis`, microsteps per 1024 s.
    pub fn speed(&self, axis: Axis) -> i64 {
        self.lock().axes[axis.index()].speed
    }

    /// Auxiliary switch state.
    pub fn switch_on(&self) -> bool {
        self.lock().switch_on
    }

    /// Put `axis` into a running slew, as if another client had started it.
    pub fn force_slewing(&self, axis: Axis, forward: bool, high_speed: bool) {
        let mut state = self.lock();
        let axis = &mut state.axes[axis.index()];
        axis.running = true;
        axis.slewing = true;
        axis.forward = forward;
        axis.high_speed = high_speed;
    }
}

/// Simulated motor controller behind a [`MountTransport`].
pub struct SimulatedMount {
    state: Arc<Mutex<SimState>>,
    pending: VecDeque<Vec<u8>>,
}

impl SimulatedMount {
    /// Power on a simulated controller.
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
            pending: VecDeque::new(),
        }
    }

    /// Handle sharing this simulator's state.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }

    fn reply(&mut self, data: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = data.strip_suffix(&[END_CHAR]).unwrap_or(data);
        state.frames.push(String::from_utf8_lossy(frame).into_owned());

        if frame == [START_CHAR_OUT] {
            if state.config.motor == MotorKind::Dc {
                self.pending.push_back(vec![START_CHAR_OUT]);
            }
            return;
        }

        let response = match state.faults.pop_front() {
            Some(SimFault::Timeout) => return,
            Some(SimFault::Raw(bytes)) => bytes,
            Some(SimFault::Reject(code)) => vec![ERROR_CHAR, b'0' + code, END_CHAR],
            None => match state.respond(frame) {
                Ok(payload) => {
                    let mut out = Vec::with_capacity(payload.len() + 2);
                    out.push(START_CHAR_IN);
                    out.extend_from_slice(payload.as_bytes());
                    out.push(END_CHAR);
                    out
                }
                Err(code) => vec![ERROR_CHAR, b'0' + code, END_CHAR],
            },
        };
        self.pending.push_back(response);
    }
}

#[async_trait]
impl MountTransport for SimulatedMount {
    async fn flush_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.reply(data);
        Ok(data.len())
    }

    async fn read_until(
        &mut self,
        _delimiter: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.pending
            .pop_front()
            .ok_or(TransportError::Timeout(timeout))
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        let frame = self
            .pending
            .front_mut()
            .ok_or(TransportError::Timeout(timeout))?;
        let byte = frame.remove(0);
        if frame.is_empty() {
            self.pending.pop_front();
        }
        Ok(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(sim: &mut SimulatedMount, frame: &[u8]) -> Vec<u8> {
        sim.flush_input().await.unwrap();
        sim.write_bytes(frame).await.unwrap();
        sim.read_until(END_CHAR, Duration::from_millis(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_answers_firmware_and_calibration() {
        let mut sim = SimulatedMount::new(SimConfig::legacy());
        assert_eq!(exchange(&mut sim, b":e1\r").await, b"=031000\r".to_vec());
        assert_eq!(exchange(&mut sim, b":g1\r").await, b"=100000\r".to_vec());
        assert_eq!(exchange(&mut sim, b":f2\r").await, b"=000\r".to_vec());
    }

    #[tokio::test]
    async fn test_start_char_echo_depends_on_motor() {
        let mut stepper = SimulatedMount::new(SimConfig::legacy());
        stepper.write_bytes(b":").await.unwrap();
        assert!(matches!(
            stepper.read_byte(Duration::from_millis(1)).await,
            Err(TransportError::Timeout(_))
        ));

        let mut dc = SimulatedMount::new(SimConfig {
            motor: MotorKind::Dc,
            ..SimConfig::legacy()
        });
        dc.write_bytes(b":").await.unwrap();
        assert_eq!(dc.read_byte(Duration::from_millis(1)).await.unwrap(), b':');
        assert!(dc.read_byte(Duration::from_millis(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_read_byte_walks_through_frame() {
        let mut sim = SimulatedMount::new(SimConfig::legacy());
        sim.write_bytes(b":f1\r").await.unwrap();
        let mut bytes = Vec::new();
        while let Ok(byte) = sim.read_byte(Duration::from_millis(1)).await {
            bytes.push(byte);
        }
        assert_eq!(bytes, b"=000\r".to_vec());
    }

    #[tokio::test]
    async fn test_mode_change_while_running_is_rejected() {
        let mut sim = SimulatedMount::new(SimConfig::legacy());
        assert_eq!(exchange(&mut sim, b":G110\r").await, b"=\r".to_vec());
        assert_eq!(exchange(&mut sim, b":J1\r").await, b"=\r".to_vec());
        assert_eq!(exchange(&mut sim, b":G110\r").await, b"!2\r".to_vec());
    }

    #[tokio::test]
    async fn test_advanced_words_need_new_firmware() {
        let mut legacy = SimulatedMount::new(SimConfig::legacy());
        assert_eq!(exchange(&mut legacy, b":X10002\r").await, b"!0\r".to_vec());

        let mut advanced = SimulatedMount::new(SimConfig::advanced());
        assert_eq!(
            exchange(&mut advanced, b":X10002\r").await,
            b"=0089B200\r".to_vec()
        );
    }

    #[tokio::test]
    async fn test_injected_faults_apply_in_order() {
        let mut sim = SimulatedMount::new(SimConfig::legacy());
        let handle = sim.handle();
        handle.inject(SimFault::Reject(4));
        handle.inject(SimFault::Timeout);

        assert_eq!(exchange(&mut sim, b":f1\r").await, b"!4\r".to_vec());
        sim.write_bytes(b":f1\r").await.unwrap();
        assert!(sim.read_until(END_CHAR, Duration::from_millis(1)).await.is_err());
        assert_eq!(exchange(&mut sim, b":f1\r").await, b"=000\r".to_vec());
        assert_eq!(handle.frames(), vec![":f1", ":f1", ":f1"]);
    }
}
