//! Mount configuration.
//!
//! Settings are layered with figment: built-in defaults, then an optional TOML
//! file, then `SKYWATCHER_`-prefixed environment variables
//! (e.g. `SKYWATCHER_PORT=/dev/ttyUSB1`).
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! silent_slew_mode = false
//! stop_timeout_secs = 30
//! ```

use crate::error::{MountError, MountResult};
use crate::session::MountSettings;
use crate::transport::DEFAULT_BAUD_RATE;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SKYWATCHER_";

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Connection and behaviour settings of one mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Serial device path.
    pub port: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Per-read reply timeout.
    pub read_timeout_ms: u64,
    /// Motor probe echo timeout.
    pub probe_timeout_ms: u64,
    /// Attempts per exchange, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_backoff_ms: u64,
    /// Force low speed motion unless explicitly overridden.
    pub silent_slew_mode: bool,
    /// Deadline for stop-and-wait sequences.
    pub stop_timeout_secs: u64,
    /// Status polling period while waiting for a stop.
    pub poll_interval_ms: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 5000,
            probe_timeout_ms: 1000,
            max_attempts: 3,
            retry_backoff_ms: 100,
            silent_slew_mode: true,
            stop_timeout_secs: 60,
            poll_interval_ms: 100,
        }
    }
}

impl MountConfig {
    /// Load defaults, `path` (if given) and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(MountConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
            }
            debug!("Loading mount config from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        let config: MountConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("Failed to extract mount configuration")?;
        config.validate()?;

        info!(port = %config.port, baud = config.baud_rate, "Loaded mount config");
        Ok(config)
    }

    /// Parse a TOML string on top of the defaults.
    ///
    /// Useful for testing or embedded configs; environment overrides are not applied.
    pub fn from_toml_str(toml_content: &str) -> Result<Self> {
        let config: MountConfig =
            toml::from_str(toml_content).with_context(|| "Failed to parse TOML content")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work.
    pub fn validate(&self) -> MountResult<()> {
        let fail = |msg: &str| Err(MountError::Config(msg.to_string()));
        if self.port.trim().is_empty() {
            return fail("port must not be empty");
        }
        if self.baud_rate == 0 {
            return fail("baud_rate must be positive");
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }
        if self.read_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return fail("timeouts must be positive");
        }
        if self.stop_timeout_secs == 0 || self.poll_interval_ms == 0 {
            return fail("stop_timeout_secs and poll_interval_ms must be positive");
        }
        Ok(())
    }

    /// Per-read reply timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Delay between attempts.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Mount behaviour settings derived from this config.
    pub fn settings(&self) -> MountSettings {
        MountSettings {
            silent_slew_mode: self.silent_slew_mode,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
