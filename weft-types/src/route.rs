//! Route attributes and the route object exchanged by the federation engine.
//!
//! Attributes are parsed from UPDATE announcements and validated before a
//! route may enter the table. Fields unrecognized at parse time are retained
//! in an opaque extension map so newer peers can round-trip them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{QosTier, WeftError};

/// Advertised capacity envelope. All three fields are required whenever the
/// attribute is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    /// Maximum concurrent dispatches the endpoint accepts.
    pub max_parallel: u32,
    /// Sustained token throughput.
    pub tokens_per_s: f64,
    /// Burn rate at full utilization.
    pub usd_per_s: f64,
}

impl Capacity {
    /// Scale every capacity field by `factor`, flooring integral fields.
    ///
    /// Used when process-wide backpressure is active so selection sees the
    /// reduced envelope while the underlying advertisement stays visible.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            max_parallel: (f64::from(self.max_parallel) * factor) as u32,
            tokens_per_s: self.tokens_per_s * factor,
            usd_per_s: self.usd_per_s * factor,
        }
    }
}

/// Advertised health sample for an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    /// Median latency in milliseconds.
    pub p50_ms: f64,
    /// Tail latency in milliseconds.
    pub p95_ms: f64,
    /// Error rate in `[0, 1]`.
    pub err_rate: f64,
    /// When the sample was taken (epoch seconds on the wire).
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub metrics_timestamp: Option<DateTime<Utc>>,
    /// Decay half-life for freshness weighting, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_half_life_s: Option<f64>,
}

/// Advertised cost attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    /// Dollars per thousand tokens.
    pub usd_per_1k_tokens: f64,
}

/// Seven-day estimate-accuracy telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictability {
    /// Mean absolute percentage error of usage estimates.
    pub estimate_mape_7d: f64,
    /// Fraction of estimates that undershot actual usage.
    pub under_rate_7d: f64,
}

/// Overhead calibration telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overhead {
    /// MAPE of overhead predictions.
    pub overhead_mape_7d: f64,
    /// Ratio of predicted to observed p95 overhead; 1.0 is perfectly
    /// calibrated, above over-estimates (wasted budget), below
    /// under-estimates (risk).
    pub overhead_p95_factor: f64,
}

/// Route attributes attached to every announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAttributes {
    /// Ordered ADN path vector; non-empty, used for loop prevention and
    /// path-length scoring.
    pub path: Vec<u32>,
    /// Peer identifier of the next hop; non-empty.
    pub next_hop: String,

    /// First advertiser inside the originating cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator_id: Option<String>,
    /// Reflector cluster ids the route traversed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_list: Option<Vec<String>>,

    /// Local preference, higher preferred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pref: Option<u32>,
    /// Multi-exit discriminator, lower preferred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub med: Option<u32>,

    /// QoS tiers the endpoint serves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos_supported: Option<Vec<QosTier>>,
    /// Capacity envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Capacity>,
    /// Health sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStats>,
    /// Cost attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
    /// Estimate-accuracy telemetry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictability: Option<Predictability>,
    /// Overhead calibration telemetry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overhead: Option<Overhead>,

    /// Policy community tags; `no-export` rejects the route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communities: Option<Vec<String>>,
    /// Security group tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<String>>,
    /// Region tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,

    /// Absolute expiry; expired attributes invalidate the route without
    /// withdrawing it.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub valid_until: Option<DateTime<Utc>>,

    /// Attribute fields unrecognized at parse time, preserved verbatim for
    /// forward compatibility across protocol versions.
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl RouteAttributes {
    /// Build minimal attributes with just a path and next hop.
    #[must_use]
    pub fn new(path: Vec<u32>, next_hop: impl Into<String>) -> Self {
        Self {
            path,
            next_hop: next_hop.into(),
            originator_id: None,
            cluster_list: None,
            local_pref: None,
            med: None,
            qos_supported: None,
            capacity: None,
            health: None,
            cost: None,
            predictability: None,
            overhead: None,
            communities: None,
            security_groups: None,
            regions: None,
            valid_until: None,
            extensions: serde_json::Map::new(),
        }
    }

    /// Validate structure and policy.
    ///
    /// Structural checks: non-empty path and next hop, complete capacity /
    /// health / cost / predictability attributes. Policy checks: the route
    /// must support at least silver QoS when it advertises tiers, and must
    /// not carry a `no-export` community.
    ///
    /// # Errors
    /// Returns the first failing check. Policy failures use the typed
    /// variants so callers can bucket rejections.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.path.is_empty() {
            return Err(WeftError::validation("path cannot be empty"));
        }
        if self.next_hop.is_empty() {
            return Err(WeftError::validation("next_hop cannot be empty"));
        }
        if self.err_rate_out_of_range() {
            return Err(WeftError::validation("err_rate must be within [0, 1]"));
        }

        if let Some(tiers) = &self.qos_supported {
            let best = tiers.iter().copied().max();
            match best {
                Some(tier) if tier.meets_production_floor() => {}
                Some(tier) => {
                    return Err(WeftError::QosBelowFloor {
                        tier: tier.to_string(),
                    });
                }
                None => {
                    return Err(WeftError::validation("qos_supported must not be empty"));
                }
            }
        }

        if let Some(communities) = &self.communities
            && communities.iter().any(|c| c == "no-export")
        {
            return Err(WeftError::NoExport);
        }

        Ok(())
    }

    fn err_rate_out_of_range(&self) -> bool {
        self.health
            .as_ref()
            .is_some_and(|h| !(0.0..=1.0).contains(&h.err_rate))
    }

    /// Whether the attributes have passed their `valid_until` deadline.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|deadline| deadline < now)
    }

    /// [`Self::is_expired_at`] against the current wall clock.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// A validated route: attributes plus provenance.
///
/// Identity is `(prefix, peer_router_id)`; a re-advertisement replaces the
/// stored route wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination prefix the attributes apply to.
    pub prefix: String,
    /// Validated attributes.
    pub attributes: RouteAttributes,
    /// When this router received the advertisement.
    pub received_at: DateTime<Utc>,
    /// Peer the advertisement arrived from.
    pub peer_router_id: String,
}

impl Route {
    /// Construct and validate a route in one step.
    ///
    /// # Errors
    /// Propagates attribute validation failures; the route is never built
    /// from invalid attributes.
    pub fn try_new(
        prefix: impl Into<String>,
        attributes: RouteAttributes,
        received_at: DateTime<Utc>,
        peer_router_id: impl Into<String>,
    ) -> Result<Self, WeftError> {
        attributes.validate()?;
        Ok(Self {
            prefix: prefix.into(),
            attributes,
            received_at,
            peer_router_id: peer_router_id.into(),
        })
    }

    /// Whether the route is still usable at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.attributes.is_expired_at(now)
    }
}
