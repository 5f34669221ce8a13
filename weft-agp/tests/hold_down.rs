mod common;

use chrono::Duration;

use common::{scored_route, t0, table};

#[test]
fn hold_down_delays_withdrawal_until_persist_elapses() {
    // A degraded peer tries to withdraw within the persist window: the
    // route stays installed and the deferral is counted. After the window
    // the same call goes through.
    let mut table = table();
    let now = t0();
    table.update_routes_at(vec![scored_route("192.168.1.0/24", "peer-1", 100)], now);

    table.withdraw_routes_health_based_at(
        &["192.168.1.0/24".to_string()],
        Some("peer-1"),
        true,
        now,
    );
    assert_eq!(table.get_routes("192.168.1.0/24").len(), 1);
    assert_eq!(table.counters().snapshot().hold_down_events_total, 1);

    // Still inside the 8 s persist window.
    let at = now + Duration::seconds(5);
    table.withdraw_routes_health_based_at(
        &["192.168.1.0/24".to_string()],
        Some("peer-1"),
        true,
        at,
    );
    assert_eq!(table.get_routes("192.168.1.0/24").len(), 1);
    assert_eq!(table.counters().snapshot().hold_down_events_total, 2);

    // Past it: the withdrawal lands.
    let at = now + Duration::seconds(9);
    table.withdraw_routes_health_based_at(
        &["192.168.1.0/24".to_string()],
        Some("peer-1"),
        true,
        at,
    );
    assert!(table.get_routes("192.168.1.0/24").is_empty());
}

#[test]
fn grace_period_defers_readvertisement_after_recovery() {
    let mut table = table();
    let now = t0();

    // Recovery starts the grace window; the advertisement is deferred.
    table.update_routes_health_based_at(
        vec![scored_route("10.0.0.0/8", "peer-1", 100)],
        false,
        now,
    );
    assert!(table.get_routes("10.0.0.0/8").is_empty());
    assert_eq!(table.counters().snapshot().hold_down_events_total, 1);

    // Once grace expires the same advertisement is stored.
    let at = now + Duration::seconds(6);
    table.update_routes_health_based_at(
        vec![scored_route("10.0.0.0/8", "peer-1", 100)],
        false,
        at,
    );
    assert_eq!(table.get_routes("10.0.0.0/8").len(), 1);
}

#[test]
fn degraded_advertisement_is_not_grace_gated() {
    let mut table = table();
    let now = t0();
    table.update_routes_health_based_at(
        vec![scored_route("10.0.0.0/8", "peer-1", 100)],
        true,
        now,
    );
    assert_eq!(table.get_routes("10.0.0.0/8").len(), 1);
}

#[test]
fn healthy_withdrawal_is_not_held() {
    let mut table = table();
    let now = t0();
    table.update_routes_at(vec![scored_route("p", "peer-1", 100)], now);
    table.withdraw_routes_health_based_at(&["p".to_string()], Some("peer-1"), false, now);
    assert!(table.get_routes("p").is_empty());
}

#[test]
fn hold_down_info_reports_remaining_windows() {
    let mut table = table();
    let now = t0();
    table.update_routes_at(vec![scored_route("p", "peer-1", 100)], now);
    table.withdraw_routes_health_based_at(&["p".to_string()], None, true, now);

    let info = table.hold_down_info_at("p", now + Duration::seconds(2));
    assert!(info.in_hold_down);
    assert!(!info.in_grace_period);
    assert!((info.hold_down_remaining_seconds - 6.0).abs() < 0.01);
}
