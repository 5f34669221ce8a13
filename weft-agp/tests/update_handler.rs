mod common;

use chrono::Duration;
use serde_json::json;

use common::{t0, table};
use weft_agp::{RevocationChecker, UpdateHandler};
use weft_types::WeftError;

fn announce(prefix: &str, attrs: serde_json::Value) -> serde_json::Value {
    json!({
        "type": "UPDATE",
        "announce": [{"prefix": prefix, "attrs": attrs}],
    })
}

#[test]
fn loop_prevention_rejects_own_originator() {
    // Scenario: router1:cluster-a receives its own advertisement back.
    let handler = UpdateHandler::new("router1:cluster-a", "1.0");
    let mut table = table();
    let message = announce(
        "192.168.1.0/24",
        json!({
            "path": [65001, 65002],
            "next_hop": "router2",
            "originator_id": "router1:cluster-a",
        }),
    );

    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert!(table.get_routes("192.168.1.0/24").is_empty());
    assert_eq!(handler.counters().snapshot().loops_prevented_total, 1);
}

#[test]
fn loop_prevention_rejects_own_cluster_in_cluster_list() {
    let handler = UpdateHandler::new("router1:cluster-a", "1.0");
    let mut table = table();
    let message = announce(
        "10.0.0.0/8",
        json!({
            "path": [65001],
            "next_hop": "router2",
            "originator_id": "router9:cluster-z",
            "cluster_list": ["cluster-b", "cluster-a"],
        }),
    );
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(handler.counters().snapshot().loops_prevented_total, 1);
}

#[test]
fn clean_route_is_installed() {
    let handler = UpdateHandler::new("router1:cluster-a", "1.0");
    let mut table = table();
    let message = announce(
        "10.0.0.0/8",
        json!({
            "path": [65001, 65002],
            "next_hop": "router2",
            "local_pref": 200,
            "qos_supported": ["silver", "gold"],
        }),
    );
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);
    assert_eq!(table.get_routes("10.0.0.0/8").len(), 1);
    assert_eq!(
        handler.counters().snapshot().update_messages_processed_total,
        1
    );
}

#[test]
fn one_bad_route_does_not_poison_the_message() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let message = json!({
        "type": "UPDATE",
        "announce": [
            {"prefix": "good.example", "attrs": {"path": [65001], "next_hop": "router2"}},
            {"prefix": "bad.example", "attrs": {"path": [], "next_hop": "router2"}},
        ],
    });
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);
    assert_eq!(outcome.accepted[0].prefix, "good.example");
    assert_eq!(handler.counters().snapshot().update_parse_errors_total, 1);
}

#[test]
fn policy_rejections_hit_typed_counters() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let message = json!({
        "type": "UPDATE",
        "announce": [
            {"prefix": "bronze.example", "attrs": {
                "path": [65001], "next_hop": "r2", "qos_supported": ["bronze"],
            }},
            {"prefix": "private.example", "attrs": {
                "path": [65001], "next_hop": "r2", "communities": ["no-export"],
            }},
        ],
    });
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert!(outcome.accepted.is_empty());
    let counters = table.counters().snapshot();
    assert_eq!(counters.qos_fit_rejections_total, 1);
    assert_eq!(counters.no_export_filtered_total, 1);
}

#[test]
fn unknown_fields_are_tolerated_everywhere() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let message = json!({
        "type": "UPDATE",
        "future_top_level": {"a": 1},
        "announce": [{"prefix": "p", "attrs": {
            "path": [65001],
            "next_hop": "r2",
            "future_attr": [1, 2, 3],
        }}],
    });
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);
    assert!(
        outcome.accepted[0]
            .attributes
            .extensions
            .contains_key("future_attr")
    );
}

#[test]
fn update_without_announce_or_withdraw_is_malformed() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let err = handler
        .handle_update_at(&mut table, &json!({"type": "UPDATE"}), "router2", t0())
        .unwrap_err();
    assert!(matches!(err, WeftError::Validation(_)));
    assert_eq!(handler.counters().snapshot().update_parse_errors_total, 1);
}

#[test]
fn withdraw_removes_peer_routes() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    handler
        .handle_update_at(
            &mut table,
            &announce("p", json!({"path": [65001], "next_hop": "r2"})),
            "router2",
            t0(),
        )
        .unwrap();
    let outcome = handler
        .handle_update_at(
            &mut table,
            &json!({"type": "UPDATE", "withdraw": ["p"]}),
            "router2",
            t0(),
        )
        .unwrap();
    assert_eq!(outcome.withdrawn, vec!["p".to_string()]);
    assert!(table.get_routes("p").is_empty());
}

#[test]
fn open_negotiates_minimum_compatible_version() {
    let handler = UpdateHandler::new("router1", "1.2");
    let open = json!({
        "type": "OPEN",
        "router_id": "router9",
        "adn": 65009,
        "capabilities": {"agp_version": "1.0", "future_capability": true},
    });
    let outcome = handler.handle_open(&open).unwrap();
    assert_eq!(outcome.peer_router_id, "router9");
    assert_eq!(outcome.peer_adn, 65009);
    assert_eq!(outcome.negotiated_version, "1.0");
}

#[test]
fn open_rejects_major_version_mismatch() {
    let handler = UpdateHandler::new("router1", "1.0");
    let open = json!({
        "type": "OPEN",
        "router_id": "router9",
        "adn": 1,
        "capabilities": {"agp_version": "2.0"},
    });
    assert!(matches!(
        handler.handle_open(&open),
        Err(WeftError::VersionIncompatible { .. })
    ));
}

#[test]
fn open_defaults_version_when_capabilities_omit_it() {
    let handler = UpdateHandler::new("router1", "1.0");
    let open = json!({"type": "OPEN", "router_id": "router9", "adn": 1});
    let outcome = handler.handle_open(&open).unwrap();
    assert_eq!(outcome.negotiated_version, "1.0");
}

fn attested_message(asn: u32, roa_prefix: &str, route_prefix: &str) -> serde_json::Value {
    let not_after = (t0() + Duration::hours(1)).timestamp();
    json!({
        "type": "UPDATE",
        "announce": [{"prefix": route_prefix, "attrs": {
            "path": [65001],
            "next_hop": "r2",
            "originator_id": format!("{asn}:router9"),
        }}],
        "attestation": {
            "roa": {
                "asn": asn,
                "prefix": roa_prefix,
                "maxLength": 24,
                "notBefore": 0,
                "notAfter": not_after,
            },
            "certificateChain": ["cert-a"],
            "signature": "sig",
            "signedData": "payload",
        },
    })
}

#[test]
fn valid_attestation_admits_the_route() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let message = attested_message(65001, "192.0.2.0/24", "192.0.2.0/24");
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);
    assert_eq!(table.counters().snapshot().attestation_rejections_total, 0);
}

#[test]
fn colonless_originator_uses_fallback_asn() {
    // An originator id without the `asn:router` separator carries no ASN;
    // attestation must match the 65000 private-use fallback, not a parse
    // of the bare token.
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let mut message = attested_message(65001, "192.0.2.0/24", "192.0.2.0/24");
    message["announce"][0]["attrs"]["originator_id"] = serde_json::json!("65001");
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(table.counters().snapshot().attestation_rejections_total, 1);

    let mut table = common::table();
    let mut message = attested_message(65000, "192.0.2.0/24", "192.0.2.0/24");
    message["announce"][0]["attrs"]["originator_id"] = serde_json::json!("65001");
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);
}

#[test]
fn attestation_asn_mismatch_rejects_the_route() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    // Route claims origin 65999 but the ROA authorizes 65001.
    let mut message = attested_message(65001, "192.0.2.0/24", "192.0.2.0/24");
    message["announce"][0]["attrs"]["originator_id"] = json!("65999:router9");
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(table.counters().snapshot().attestation_rejections_total, 1);
}

#[test]
fn revoked_chain_certificate_rejects_the_route() {
    let handler = UpdateHandler::new("router1", "1.0");
    handler
        .validator()
        .revocation()
        .revoke_serial(RevocationChecker::serial_for("cert-a"));
    let mut table = table();
    let message = attested_message(65001, "192.0.2.0/24", "192.0.2.0/24");
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(table.counters().snapshot().attestation_rejections_total, 1);
}

#[test]
fn unattested_message_skips_attestation_entirely() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    let message = announce("p", json!({"path": [65001], "next_hop": "r2"}));
    let outcome = handler
        .handle_update_at(&mut table, &message, "router2", t0())
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);
    assert_eq!(table.counters().snapshot().attestation_rejections_total, 0);
}

#[test]
fn versioned_path_counts_incompatible_schema_errors() {
    let handler = UpdateHandler::new("router1", "1.0");
    let mut table = table();
    // A type clash surfaces as an unknown-variant style serde error.
    let message = json!({"type": "BOGUS", "withdraw": ["p"]});
    let result =
        handler.handle_update_versioned_at(&mut table, &message, "router2", "1.0", t0());
    assert!(result.is_err());
    assert_eq!(handler.counters().snapshot().incompatible_updates_total, 1);
}
