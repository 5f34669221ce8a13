#![allow(dead_code)]

use chrono::{DateTime, Utc};

use weft_agp::RouteTable;
use weft_types::{
    Capacity, CostInfo, HealthStats, QosTier, Route, RouteAttributes, SafeModeConfig,
    SelectionConfig,
};

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn table() -> RouteTable {
    let safe_mode = SafeModeConfig {
        enabled: false,
        ..SafeModeConfig::default()
    };
    RouteTable::new(SelectionConfig::default(), safe_mode).unwrap()
}

pub fn attrs(path: &[u32], next_hop: &str) -> RouteAttributes {
    RouteAttributes::new(path.to_vec(), next_hop)
}

pub fn route(prefix: &str, peer: &str, attributes: RouteAttributes) -> Route {
    Route::try_new(prefix, attributes, t0(), peer).unwrap()
}

pub fn scored_route(prefix: &str, peer: &str, local_pref: u32) -> Route {
    let mut attributes = attrs(&[65001, 65002], peer);
    attributes.local_pref = Some(local_pref);
    attributes.qos_supported = Some(vec![QosTier::Silver, QosTier::Gold]);
    attributes.capacity = Some(Capacity {
        max_parallel: 8,
        tokens_per_s: 1200.0,
        usd_per_s: 0.01,
    });
    attributes.health = Some(HealthStats {
        p50_ms: 80.0,
        p95_ms: 250.0,
        err_rate: 0.01,
        metrics_timestamp: Some(t0()),
        metrics_half_life_s: None,
    });
    attributes.cost = Some(CostInfo {
        usd_per_1k_tokens: 0.004,
    });
    route(prefix, peer, attributes)
}
