use chrono::{DateTime, Duration, Utc};

use weft_agp::DampeningTracker;
use weft_types::{DampeningConfig, HoldDownConfig};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn tracker() -> DampeningTracker {
    DampeningTracker::new(DampeningConfig::default(), HoldDownConfig::default()).unwrap()
}

#[test]
fn config_rejects_inverted_thresholds() {
    let cfg = DampeningConfig {
        suppress_threshold: 500,
        reuse_threshold: 750,
        ..DampeningConfig::default()
    };
    assert!(DampeningTracker::new(cfg, HoldDownConfig::default()).is_err());
}

#[test]
fn penalty_accumulates_and_caps() {
    let mut tracker = tracker();
    let now = t0();
    for _ in 0..40 {
        tracker.record_route_change_at("10.0.0.0/8", true, now);
    }
    let info = tracker.dampening_info_at("10.0.0.0/8", now);
    assert_eq!(info.penalty, 16_000);
    assert!(info.suppressed);
}

#[test]
fn suppression_engages_at_threshold_and_clears_below_reuse() {
    let mut tracker = tracker();
    let now = t0();
    tracker.record_route_change_at("10.0.0.0/8", true, now);
    assert!(!tracker.is_suppressed_at("10.0.0.0/8", now));
    tracker.record_route_change_at("10.0.0.0/8", true, now);
    assert!(tracker.is_suppressed_at("10.0.0.0/8", now));

    // 2000 decays below the 750 reuse threshold after ~1.42 half-lives;
    // two half-lives (30 min) put it at 500.
    let later = now + Duration::minutes(30);
    assert!(!tracker.is_suppressed_at("10.0.0.0/8", later));
    let info = tracker.dampening_info_at("10.0.0.0/8", later);
    assert_eq!(info.penalty, 500);
    assert!(!info.suppressed);
}

#[test]
fn suppression_holds_above_reuse_threshold() {
    let mut tracker = tracker();
    let now = t0();
    for _ in 0..4 {
        tracker.record_route_change_at("10.0.0.0/8", true, now);
    }
    // 4000 decays to 1000 after two half-lives: still above reuse (750).
    let later = now + Duration::minutes(30);
    assert!(tracker.is_suppressed_at("10.0.0.0/8", later));
}

#[test]
fn flap_rate_guard_suppresses_independent_of_penalty() {
    let config = DampeningConfig {
        penalty_per_flap: 10,
        suppress_threshold: 100_000,
        reuse_threshold: 50_000,
        max_flaps_per_minute: 3,
        ..DampeningConfig::default()
    };
    let mut tracker = DampeningTracker::new(config, HoldDownConfig::default()).unwrap();
    let now = t0();
    for i in 0..3 {
        tracker.record_route_change_at("p", true, now + Duration::seconds(i));
    }
    let at = now + Duration::seconds(3);
    assert!(tracker.flap_rate_exceeded_at("p", at));
    assert!(tracker.is_suppressed_at("p", at));
    // The rolling minute expires and the guard clears.
    let next_minute = now + Duration::seconds(90);
    assert!(!tracker.flap_rate_exceeded_at("p", next_minute));
}

#[test]
fn hold_down_window_not_extended_by_repeat_events() {
    let mut tracker = tracker();
    let now = t0();
    tracker.record_health_change_at("p", true, now);
    let deadline = tracker.hold_down_info_at("p", now).hold_down_remaining_seconds;
    assert!((deadline - 8.0).abs() < 0.01);

    // Re-degrading 5 seconds in must not push the deadline out.
    let later = now + Duration::seconds(5);
    tracker.record_health_change_at("p", true, later);
    let remaining = tracker.hold_down_info_at("p", later).hold_down_remaining_seconds;
    assert!((remaining - 3.0).abs() < 0.01);
}

#[test]
fn grace_window_not_extended_by_repeat_recovery() {
    let mut tracker = tracker();
    let now = t0();
    tracker.record_health_change_at("p", false, now);
    let later = now + Duration::seconds(3);
    tracker.record_health_change_at("p", false, later);
    let remaining = tracker
        .hold_down_info_at("p", later)
        .grace_period_remaining_seconds;
    assert!((remaining - 2.0).abs() < 0.01);
}

#[test]
fn degradation_clears_grace_and_recovery_clears_hold_down() {
    let mut tracker = tracker();
    let now = t0();
    tracker.record_health_change_at("p", false, now);
    assert!(tracker.should_delay_advertisement_at("p", now));

    tracker.record_health_change_at("p", true, now + Duration::seconds(1));
    let at = now + Duration::seconds(1);
    assert!(!tracker.should_delay_advertisement_at("p", at));
    assert!(tracker.should_delay_withdrawal_at("p", at));

    tracker.record_health_change_at("p", false, now + Duration::seconds(2));
    let at = now + Duration::seconds(2);
    assert!(!tracker.should_delay_withdrawal_at("p", at));
    assert!(tracker.should_delay_advertisement_at("p", at));
}

#[test]
fn timers_expire_on_their_own() {
    let mut tracker = tracker();
    let now = t0();
    tracker.record_health_change_at("p", true, now);
    assert!(tracker.should_delay_withdrawal_at("p", now + Duration::seconds(7)));
    assert!(!tracker.should_delay_withdrawal_at("p", now + Duration::seconds(8)));
}

#[test]
fn cleanup_drops_idle_decayed_states_only() {
    let mut tracker = tracker();
    let now = t0();
    tracker.record_route_change_at("idle", true, now);
    tracker.record_route_change_at("busy", true, now);

    // Far out, "idle" has fully decayed; "busy" flapped again recently.
    let much_later = now + Duration::hours(6);
    tracker.record_route_change_at("busy", true, much_later);
    tracker.cleanup_expired_at(3600, much_later);

    assert_eq!(tracker.dampening_info_at("idle", much_later).penalty, 0);
    assert!(tracker.dampening_info_at("busy", much_later).penalty > 0);
    assert!(tracker.dampening_info_at("busy", much_later).last_flap_seconds_ago.is_some());
}

#[test]
fn restore_state_round_trips_penalties() {
    let mut tracker = tracker();
    let now = t0();
    for _ in 0..3 {
        tracker.record_route_change_at("p", true, now);
    }
    let info = tracker.dampening_info_at("p", now);

    let mut restored = DampeningTracker::new(
        DampeningConfig::default(),
        HoldDownConfig::default(),
    )
    .unwrap();
    restored.restore_state("p", &info, now);
    let round_tripped = restored.dampening_info_at("p", now);
    assert_eq!(round_tripped.penalty, info.penalty);
    assert_eq!(round_tripped.suppressed, info.suppressed);
}
