use core::fmt;
use serde::{Deserialize, Serialize};

use crate::WeftError;

/// Service tier attached to requests and advertised by routes.
///
/// Ordering is by quality: `Bronze < Silver < Gold < Platinum`. The
/// scheduler uses the rank for priority; the session layer uses the tier
/// to scale buffer windows (low-latency tiers get smaller windows).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum QosTier {
    /// Batch/compliance traffic; largest buffer window, lowest priority.
    Bronze,
    /// Default interactive tier.
    #[default]
    Silver,
    /// Low-latency tier; smallest buffer window, highest queue priority.
    Gold,
    /// Reserved premium tier; scheduled like gold.
    Platinum,
}

impl QosTier {
    /// All tiers in ascending quality order.
    pub const ALL: [Self; 4] = [Self::Bronze, Self::Silver, Self::Gold, Self::Platinum];

    /// Numeric rank used for queue priority comparisons (higher wins).
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Bronze => 1,
            Self::Silver => 2,
            Self::Gold => 3,
            Self::Platinum => 4,
        }
    }

    /// Default buffer-size multiplier for the tier.
    ///
    /// Gold halves the window to bound head-of-line latency; bronze doubles
    /// it so batch streams tolerate slower consumers.
    #[must_use]
    pub const fn default_buffer_multiplier(self) -> f64 {
        match self {
            Self::Gold | Self::Platinum => 0.5,
            Self::Silver => 1.0,
            Self::Bronze => 2.0,
        }
    }

    /// Whether this tier satisfies the production policy floor (silver).
    #[must_use]
    pub const fn meets_production_floor(self) -> bool {
        self.rank() >= Self::Silver.rank()
    }

    /// Canonical lowercase name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
        }
    }
}

impl fmt::Display for QosTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QosTier {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            "platinum" => Ok(Self::Platinum),
            other => Err(WeftError::validation(format!("invalid QoS tier: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_matches_rank() {
        assert!(QosTier::Bronze < QosTier::Silver);
        assert!(QosTier::Silver < QosTier::Gold);
        assert!(QosTier::Gold < QosTier::Platinum);
    }

    #[test]
    fn wire_names_round_trip() {
        for tier in QosTier::ALL {
            let json = serde_json::to_string(&tier).unwrap();
            assert_eq!(json, format!("\"{}\"", tier.as_str()));
            let back: QosTier = serde_json::from_str(&json).unwrap();
            assert_eq!(back, tier);
        }
    }

    #[test]
    fn production_floor_excludes_bronze() {
        assert!(!QosTier::Bronze.meets_production_floor());
        assert!(QosTier::Silver.meets_production_floor());
        assert!(QosTier::Platinum.meets_production_floor());
    }
}
