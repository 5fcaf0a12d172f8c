//! Integration tests for slew, goto and stop operations against the simulator.

mod common;

use common::{initialized, simulated};
use skywatcher_mount::protocol::codec::encode_legacy_u24;
use skywatcher_mount::session::FirmwareVersion;
use skywatcher_mount::sim::SimConfig;
use skywatcher_mount::units::{MAX_SPEED, SIDEREAL_RATE};
use skywatcher_mount::{Axis, MountError};

// =============================================================================
// Preconditions
// =============================================================================

#[tokio::test]
async fn test_motion_requires_bring_up() {
    let (mut mount, handle) = simulated(SimConfig::legacy());

    assert!(matches!(
        mount.slew(Axis::Primary, 0.01, false).await,
        Err(MountError::NotInitialized)
    ));
    assert!(matches!(
        mount.slew_to(Axis::Primary, 100, false).await,
        Err(MountError::NotInitialized)
    ));
    assert!(matches!(mount.slow_stop(Axis::Secondary).await, Err(MountError::NotInitialized)));
    assert!(handle.frames().is_empty());
}

#[tokio::test]
async fn test_instant_stop_works_before_bring_up() {
    let (mut mount, handle) = simulated(SimConfig::legacy());
    handle.force_slewing(Axis::Secondary, true, true);

    mount.instant_stop(Axis::Secondary).await.unwrap();
    assert_eq!(handle.frames(), vec![":L2"]);
    assert!(!handle.is_running(Axis::Secondary));
    assert!(!mount.is_in_motion(Axis::Secondary));
}

#[tokio::test]
async fn test_non_finite_rate_rejected() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    assert!(matches!(
        mount.slew(Axis::Primary, f64::NAN, false).await,
        Err(MountError::InvalidArgument(_))
    ));
    assert!(handle.frames().is_empty());
}

// =============================================================================
// Legacy slewing
// =============================================================================

#[tokio::test]
async fn test_legacy_slew_from_rest() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew(Axis::Primary, SIDEREAL_RATE, false).await.unwrap();

    let ticks = mount
        .calibration(Axis::Primary)
        .unwrap()
        .radians_per_second_to_clock_ticks(SIDEREAL_RATE)
        .unwrap();
    let step_frame = format!(":I1{}", encode_legacy_u24(ticks as u32));
    assert_eq!(handle.frames(), vec![":f1", ":G110", step_frame.as_str(), ":J1"]);
    assert_eq!(i64::from(handle.step_period(Axis::Primary)), ticks);
    assert!(handle.is_running(Axis::Primary));
    assert!(mount.axis(Axis::Primary).status.is_slewing());
    assert_eq!(mount.slewing_rate(Axis::Primary), SIDEREAL_RATE);
}

#[tokio::test]
async fn test_rate_clamped_to_max_speed() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew(Axis::Primary, 10_000.0, true).await.unwrap();

    assert_eq!(mount.slewing_rate(Axis::Primary), MAX_SPEED);
    assert!(handle.frames().contains(&":G130".to_string()));
    // Far above the fastest rate the clock can express
    assert_eq!(handle.step_period(Axis::Primary), 6);
    assert!(mount.axis(Axis::Primary).status.high_speed());
}

#[tokio::test]
async fn test_silent_mode_keeps_fast_slew_low_speed() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew(Axis::Secondary, -0.2, false).await.unwrap();
    assert!(handle.frames().contains(&":G211".to_string()));
    assert!(!mount.axis(Axis::Secondary).status.high_speed());

    mount.set_silent_slew_mode(false);
    mount.slew(Axis::Primary, -0.2, false).await.unwrap();
    assert!(handle.frames().contains(&":G131".to_string()));
}

#[tokio::test]
async fn test_negligible_rate_stops_axis() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew(Axis::Primary, SIDEREAL_RATE / 2000.0, false).await.unwrap();
    assert_eq!(handle.frames(), vec![":K1"]);
}

#[tokio::test]
async fn test_compatible_slew_keeps_running() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    handle.force_slewing(Axis::Primary, true, false);

    mount.slew(Axis::Primary, SIDEREAL_RATE * 2.0, false).await.unwrap();

    let frames = handle.frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], ":f1");
    assert!(frames[1].starts_with(":I1"));
    assert_eq!(frames[2], ":J1");
}

#[tokio::test]
async fn test_silent_fast_slew_does_not_stop_running_low_speed_slew() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    handle.force_slewing(Axis::Primary, true, false);

    // Above the high speed threshold, but silent mode keeps it low speed
    mount.slew(Axis::Primary, 0.2, false).await.unwrap();

    let frames = handle.frames();
    assert!(!frames.contains(&":K1".to_string()));
    assert!(!frames.iter().any(|f| f.starts_with(":G1")));
    assert_eq!(frames.len(), 3);
    assert!(frames[1].starts_with(":I1"));
    assert!(!mount.axis(Axis::Primary).status.high_speed());
}

#[tokio::test]
async fn test_reversal_stops_before_mode_change() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    handle.force_slewing(Axis::Primary, true, false);

    mount.slew(Axis::Primary, -SIDEREAL_RATE, false).await.unwrap();

    let frames = handle.frames();
    let stop = frames.iter().position(|f| f == ":K1").unwrap();
    let mode = frames.iter().position(|f| f == ":G111").unwrap();
    assert!(stop < mode);
    // Polled until the controller reported the stop
    assert!(frames[stop..mode].iter().filter(|f| *f == ":f1").count() >= 2);
    assert!(handle.is_running(Axis::Primary));
}

#[tokio::test]
async fn test_stop_wait_is_bounded() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    handle.set_stop_after_polls(None);
    handle.force_slewing(Axis::Secondary, false, false);

    let err = mount
        .slew(Axis::Secondary, SIDEREAL_RATE, false)
        .await
        .unwrap_err();
    assert!(matches!(err, MountError::StopTimeout { axis: Axis::Secondary, .. }));
    assert!(!handle.frames().iter().any(|f| f.starts_with(":G")));

    mount.instant_stop(Axis::Secondary).await.unwrap();
    assert!(!handle.is_running(Axis::Secondary));
}

#[tokio::test]
async fn test_tick_correction_for_old_firmware() {
    let (mut normal, normal_handle) = initialized(SimConfig::legacy()).await;
    let (mut old, old_handle) = initialized(SimConfig {
        firmware: FirmwareVersion(0x01_06_00),
        ..SimConfig::legacy()
    })
    .await;

    normal.slew(Axis::Primary, SIDEREAL_RATE, false).await.unwrap();
    old.slew(Axis::Primary, SIDEREAL_RATE, false).await.unwrap();
    assert_eq!(
        normal_handle.step_period(Axis::Primary) - old_handle.step_period(Axis::Primary),
        3
    );

    // Correction never drops below the controller floor
    old.slew(Axis::Secondary, 10_000.0, true).await.unwrap();
    assert_eq!(old_handle.step_period(Axis::Secondary), 6);
}

#[tokio::test]
async fn test_slew_deceleration_ramp() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.set_slew_deceleration_ramp(Axis::Secondary, 1500).await.unwrap();
    assert_eq!(handle.slew_ramp(Axis::Secondary), 1500);
}

// =============================================================================
// Legacy goto
// =============================================================================

#[tokio::test]
async fn test_zero_offset_goto_sends_nothing() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew_to(Axis::Primary, 0, true).await.unwrap();
    assert!(handle.frames().is_empty());
}

#[tokio::test]
async fn test_goto_speed_follows_margin() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    mount.set_silent_slew_mode(false);
    let margin = mount.calibration(Axis::Primary).unwrap().low_speed_goto_margin();

    mount.slew_to(Axis::Primary, margin, false).await.unwrap();
    mount.slew_to(Axis::Secondary, margin + 1, false).await.unwrap();

    let frames = handle.frames();
    assert!(frames.contains(&":G120".to_string()));
    assert!(frames.contains(&":G200".to_string()));
    assert_eq!(i64::from(handle.goto_offset(Axis::Primary)), margin);
    assert_eq!(handle.goto_ramp(Axis::Primary), 200);
    assert_eq!(handle.goto_ramp(Axis::Secondary), 3200);
    assert!(mount.axis(Axis::Secondary).status.high_speed());
}

#[tokio::test]
async fn test_short_goto_ramp_is_offset() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew_to(Axis::Primary, -120, false).await.unwrap();

    assert_eq!(
        handle.frames(),
        vec![
            ":f1".to_string(),
            ":G121".to_string(),
            format!(":H1{}", encode_legacy_u24(120)),
            format!(":M1{}", encode_legacy_u24(120)),
            ":J1".to_string(),
        ]
    );
    assert!(mount.axis(Axis::Primary).status.is_slewing_to());
    assert_eq!(mount.axis(Axis::Primary).last_slew_to_target, Some(0x80_0000 - 120));
}

#[tokio::test]
async fn test_goto_arrives_at_target() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.slew_to(Axis::Secondary, 5000, true).await.unwrap();
    mount.wait_for_full_stop(Axis::Secondary).await.unwrap();

    assert_eq!(handle.encoder(Axis::Secondary), 0x80_0000 + 5000);
    // Arrival triggers a position read
    assert_eq!(mount.axis(Axis::Secondary).current_encoder, 0x80_0000 + 5000);
    assert!(!mount.is_in_motion(Axis::Secondary));
}

#[tokio::test]
async fn test_goto_interrupts_reverse_slew() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    handle.force_slewing(Axis::Primary, false, false);

    mount.slew_to(Axis::Primary, 1000, false).await.unwrap();

    let frames = handle.frames();
    let stop = frames.iter().position(|f| f == ":K1").unwrap();
    let mode = frames.iter().position(|f| f == ":G120").unwrap();
    assert!(stop < mode);
}

#[tokio::test]
async fn test_legacy_absolute_goto() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount
        .slew_to_absolute(Axis::Primary, 0x80_0000 - 500, false)
        .await
        .unwrap();

    let frames = handle.frames();
    assert_eq!(frames[0], ":j1");
    assert!(frames.contains(&":G121".to_string()));
    assert_eq!(handle.goto_offset(Axis::Primary), 500);
    assert_eq!(handle.goto_ramp(Axis::Primary), 200);
}

#[tokio::test]
async fn test_legacy_set_encoder_and_switch() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;

    mount.set_encoder(Axis::Primary, 0x12_3456).await.unwrap();
    assert_eq!(handle.encoder(Axis::Primary), 0x12_3456);
    assert_eq!(mount.axis(Axis::Primary).current_encoder, 0x12_3456);
    assert!(matches!(
        mount.set_encoder(Axis::Primary, -1).await,
        Err(MountError::InvalidArgument(_))
    ));

    mount.set_switch(true).await.unwrap();
    assert!(handle.switch_on());
    mount.set_switch(false).await.unwrap();
    assert!(!handle.switch_on());
    assert!(handle.frames().ends_with(&[":O11".to_string(), ":O10".to_string()]));
}

#[tokio::test]
async fn test_legacy_slow_stop() {
    let (mut mount, handle) = initialized(SimConfig::legacy()).await;
    mount.slew(Axis::Primary, SIDEREAL_RATE, false).await.unwrap();
    handle.clear_frames();

    mount.slow_stop(Axis::Primary).await.unwrap();
    assert_eq!(handle.frames(), vec![":K1"]);
    mount.wait_for_full_stop(Axis::Primary).await.unwrap();
    assert!(!handle.is_running(Axis::Primary));
}

// =============================================================================
// Advanced command set
// =============================================================================

#[tokio::test]
async fn test_advanced_slew_sends_signed_rate() {
    let (mut mount, handle) = initialized(SimConfig::advanced()).await;
    let cal = mount.calibration(Axis::Primary).unwrap().clone();

    mount.slew(Axis::Primary, SIDEREAL_RATE, false).await.unwrap();
    assert_eq!(handle.speed(Axis::Primary), cal.advanced_rate(SIDEREAL_RATE));
    assert_eq!(handle.frames().len(), 1);
    assert!(handle.frames()[0].starts_with(":X102"));

    mount.slew(Axis::Primary, -SIDEREAL_RATE, false).await.unwrap();
    assert_eq!(handle.speed(Axis::Primary), -cal.advanced_rate(SIDEREAL_RATE));
    assert!(mount.axis(Axis::Primary).status.is_slewing());
}

#[tokio::test]
async fn test_advanced_slow_stop_is_zero_rate() {
    let (mut mount, handle) = initialized(SimConfig::advanced()).await;
    mount.slew(Axis::Secondary, 0.05, true).await.unwrap();
    handle.clear_frames();

    mount.slow_stop(Axis::Secondary).await.unwrap();
    assert_eq!(handle.frames(), vec![":X2020000000000000000"]);
    mount.wait_for_full_stop(Axis::Secondary).await.unwrap();
    assert!(!handle.is_running(Axis::Secondary));
}

#[tokio::test]
async fn test_advanced_goto_is_absolute() {
    let (mut mount, handle) = initialized(SimConfig::advanced()).await;

    mount.slew_to(Axis::Primary, 1000, true).await.unwrap();

    let frames = handle.frames();
    assert_eq!(frames, vec![":X10003", ":X1000003E80000000000000000"]);
    assert!(mount.axis(Axis::Primary).status.is_slewing_to());

    mount.wait_for_full_stop(Axis::Primary).await.unwrap();
    assert_eq!(handle.encoder(Axis::Primary), 1000);
    assert_eq!(mount.axis(Axis::Primary).current_encoder, 1000);
}

#[tokio::test]
async fn test_advanced_absolute_goto_backwards() {
    let (mut mount, handle) = initialized(SimConfig::advanced()).await;

    mount.slew_to_absolute(Axis::Secondary, -2, false).await.unwrap();
    assert_eq!(
        handle.frames(),
        vec![":X20003", ":X2FFFFFFFE0000000000000000"]
    );
    assert_eq!(mount.axis(Axis::Secondary).last_slew_to_target, Some(-2));
}

#[tokio::test]
async fn test_advanced_absolute_goto_direction_uses_fresh_encoder() {
    let (mut mount, handle) = initialized(SimConfig::advanced()).await;
    assert_eq!(mount.axis(Axis::Primary).current_encoder, 0);
    handle.set_encoder(Axis::Primary, 5000);

    mount.slew_to_absolute(Axis::Primary, 1000, false).await.unwrap();

    assert_eq!(
        handle.frames(),
        vec![":X10003", ":X1000003E80000000000000000"]
    );
    let state = mount.axis(Axis::Primary);
    assert_eq!(state.current_encoder, 5000);
    let motion = state.status.motion().unwrap();
    assert!(!motion.forward);
    assert!(!motion.high_speed);
}

#[tokio::test]
async fn test_advanced_set_encoder_is_signed() {
    let (mut mount, handle) = initialized(SimConfig::advanced()).await;

    mount.set_encoder(Axis::Secondary, -5).await.unwrap();
    assert_eq!(handle.encoder(Axis::Secondary), -5);
    assert_eq!(mount.read_encoder(Axis::Secondary).await.unwrap(), -5);
}
