//! # Sky-Watcher Mount Driver
//!
//! Protocol layer for two-axis Sky-Watcher / Synta telescope mount motor
//! controllers reached over a serial link. It turns motion requests (slew at
//! a rate, goto, stop) into the controller's wire protocol, tracks per-axis
//! state and converts between physical units and motor units.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: axis ids, opcodes, frame building and parsing; the
//!   retrying [`protocol::CommandChannel`] and the payload codecs.
//! - **`transport`**: the byte link contract and its serial implementation.
//! - **`units`**: per-axis calibration and unit conversion.
//! - **`status`**: the per-axis motion state machine.
//! - **`session`**: [`Mount`], bring-up and mount identity.
//! - **`motion`**: slew, goto and stop operations, with one strategy per
//!   command set (legacy and advanced firmware).
//! - **`config`**: [`MountConfig`] loaded from TOML and environment.
//! - **`sim`**: a protocol-level controller simulator for tests and demos.
//!
//! ## Example
//!
//! ```rust,ignore
//! use skywatcher_mount::{Axis, Mount, MountConfig};
//!
//! let config = MountConfig::load(None)?;
//! let mut mount = Mount::connect(&config).await?;
//! mount.initialize().await?;
//! mount.slew_degrees(Axis::Primary, 1.0, false).await?;
//! ```

pub mod config;
pub mod error;
pub mod motion;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod status;
pub mod transport;
pub mod units;

pub use config::MountConfig;
pub use error::{MountError, MountResult, TransportError};
pub use protocol::Axis;
pub use session::{Mount, MountIdentity, MountSettings};
pub use sim::{SimConfig, SimulatedMount};
