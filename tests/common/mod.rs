//! Shared helpers for mount integration tests.

#![allow(dead_code)]

use skywatcher_mount::protocol::{CommandChannel, RetryPolicy};
use skywatcher_mount::sim::{SimConfig, SimHandle, SimulatedMount};
use skywatcher_mount::{Mount, MountSettings};
use std::time::Duration;

/// Settings with short timeouts so stop-and-wait paths finish quickly.
pub fn fast_settings() -> MountSettings {
    MountSettings {
        silent_slew_mode: true,
        probe_timeout: Duration::from_millis(1),
        stop_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(1),
    }
}

/// A mount talking to a fresh simulator.
pub fn simulated(config: SimConfig) -> (Mount, SimHandle) {
    let sim = SimulatedMount::new(config);
    let handle = sim.handle();
    let channel = CommandChannel::new(Box::new(sim))
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        })
        .with_read_timeout(Duration::from_millis(10));
    (Mount::new(channel, fast_settings()), handle)
}

/// A mount that completed bring-up, with the frame log cleared.
pub async fn initialized(config: SimConfig) -> (Mount, SimHandle) {
    let (mut mount, handle) = simulated(config);
    mount.initialize().await.unwrap();
    handle.clear_frames();
    (mount, handle)
}
