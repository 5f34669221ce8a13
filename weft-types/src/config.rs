//! Configuration surface for the fabric and the federation engine.
//!
//! Every knob enumerated by the federation contract lives here with its
//! documented default. `validate` methods reject incoherent combinations up
//! front so engine code never re-checks ranges.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{QosTier, WeftError};

/// Route flap dampening parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DampeningConfig {
    /// Penalty points added per flap.
    pub penalty_per_flap: u32,
    /// Suppress the prefix once decayed penalty reaches this value.
    pub suppress_threshold: u32,
    /// Clear suppression once decayed penalty falls below this value.
    pub reuse_threshold: u32,
    /// Cap on accumulated penalty.
    pub max_penalty: u32,
    /// Exponential-decay half-life, minutes.
    pub half_life_minutes: u32,
    /// Rolling-minute flap count that forces suppression regardless of penalty.
    pub max_flaps_per_minute: u32,
}

impl Default for DampeningConfig {
    fn default() -> Self {
        Self {
            penalty_per_flap: 1000,
            suppress_threshold: 2000,
            reuse_threshold: 750,
            max_penalty: 16_000,
            half_life_minutes: 15,
            max_flaps_per_minute: 6,
        }
    }
}

impl DampeningConfig {
    /// Validate ranges and the threshold ordering.
    ///
    /// # Errors
    /// Returns `WeftError::Config` when any parameter is zero or the reuse
    /// threshold is not strictly below the suppress threshold.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.penalty_per_flap == 0 {
            return Err(WeftError::config("penalty_per_flap must be positive"));
        }
        if self.suppress_threshold == 0 {
            return Err(WeftError::config("suppress_threshold must be positive"));
        }
        if self.reuse_threshold == 0 {
            return Err(WeftError::config("reuse_threshold must be positive"));
        }
        if self.reuse_threshold >= self.suppress_threshold {
            return Err(WeftError::config(
                "reuse_threshold must be below suppress_threshold",
            ));
        }
        if self.max_penalty == 0 {
            return Err(WeftError::config("max_penalty must be positive"));
        }
        if self.half_life_minutes == 0 {
            return Err(WeftError::config("half_life_minutes must be positive"));
        }
        if self.max_flaps_per_minute == 0 {
            return Err(WeftError::config("max_flaps_per_minute must be positive"));
        }
        Ok(())
    }
}

/// Health metric hysteresis and EWMA smoothing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisConfig {
    /// Percent change required before an update may be advertised.
    pub change_threshold_percent: f64,
    /// Minimum seconds between advertised changes.
    pub stabilization_period_seconds: u32,
    /// EWMA smoothing factor in `(0, 1]`; higher is more responsive.
    pub ewma_alpha: f64,
    /// Whether EWMA smoothing is applied before gating.
    pub ewma_enabled: bool,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            change_threshold_percent: 10.0,
            stabilization_period_seconds: 5,
            ewma_alpha: 0.1,
            ewma_enabled: true,
        }
    }
}

impl HysteresisConfig {
    /// Validate threshold and smoothing ranges.
    ///
    /// # Errors
    /// Returns `WeftError::Config` for non-positive thresholds or an alpha
    /// outside `(0, 1]`.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.change_threshold_percent <= 0.0 {
            return Err(WeftError::config("change_threshold_percent must be positive"));
        }
        if self.stabilization_period_seconds == 0 {
            return Err(WeftError::config(
                "stabilization_period_seconds must be positive",
            ));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(WeftError::config("ewma_alpha must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Hold-down and grace period parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HoldDownConfig {
    /// Degradation must persist this long before withdrawals go through.
    pub persist_seconds: u32,
    /// Re-advertisements are deferred this long after recovery.
    pub grace_seconds: u32,
}

impl Default for HoldDownConfig {
    fn default() -> Self {
        Self {
            persist_seconds: 8,
            grace_seconds: 5,
        }
    }
}

impl HoldDownConfig {
    /// Validate both windows are positive.
    ///
    /// # Errors
    /// Returns `WeftError::Config` when either window is zero.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.persist_seconds == 0 {
            return Err(WeftError::config("persist_seconds must be positive"));
        }
        if self.grace_seconds == 0 {
            return Err(WeftError::config("grace_seconds must be positive"));
        }
        Ok(())
    }
}

/// Weighted multi-criteria route selection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Weight on negated local preference.
    pub local_pref_weight: f64,
    /// Weight on path length.
    pub path_len_weight: f64,
    /// Weight on the freshness-scaled health score.
    pub health_weight: f64,
    /// Weight on per-token cost.
    pub cost_weight: f64,
    /// Weight on estimate predictability.
    pub predict_weight: f64,
    /// Weight on QoS fit.
    pub qos_fit_weight: f64,
    /// Weight on overhead calibration.
    pub overhead_weight: f64,

    /// Whether equal-cost multi-path selection is enabled.
    pub enable_ecmp: bool,
    /// Maximum members of an ECMP group.
    pub max_ecmp_paths: usize,
    /// Seed mixed into the per-session ECMP hash.
    pub ecmp_hash_seed: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            local_pref_weight: 0.25,
            path_len_weight: 0.15,
            health_weight: 0.15,
            cost_weight: 0.15,
            predict_weight: 0.10,
            qos_fit_weight: 0.05,
            overhead_weight: 0.15,
            enable_ecmp: true,
            max_ecmp_paths: 8,
            ecmp_hash_seed: "agp-ecmp-v1".to_string(),
        }
    }
}

impl SelectionConfig {
    /// The seven weights in declaration order.
    #[must_use]
    pub const fn weights(&self) -> [f64; 7] {
        [
            self.local_pref_weight,
            self.path_len_weight,
            self.health_weight,
            self.cost_weight,
            self.predict_weight,
            self.qos_fit_weight,
            self.overhead_weight,
        ]
    }

    /// Validate that each weight is in `[0, 1]` and the sum is 1.0 within a
    /// 1% tolerance, and that ECMP bounds are sane.
    ///
    /// # Errors
    /// Returns `WeftError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), WeftError> {
        let weights = self.weights();
        if !weights.iter().all(|w| (0.0..=1.0).contains(w)) {
            return Err(WeftError::config("all weights must be between 0 and 1"));
        }
        let total: f64 = weights.iter().sum();
        if !(0.99..=1.01).contains(&total) {
            return Err(WeftError::config(format!(
                "weights must sum to 1.0, got {total}"
            )));
        }
        if self.max_ecmp_paths < 1 {
            return Err(WeftError::config("max_ecmp_paths must be at least 1"));
        }
        Ok(())
    }
}

/// Safe-mode fallback parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeModeConfig {
    /// Whether the table may fall back to a snapshot at all.
    pub enabled: bool,
    /// Location of the last-known-good snapshot.
    pub snapshot_path: std::path::PathBuf,
    /// Policy-load attempts before giving up and entering safe mode.
    pub max_retries: u32,
    /// Base delay between retries, seconds.
    pub retry_delay_seconds: u32,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_path: "/var/lib/weft/snapshots/last_known_good.json".into(),
            max_retries: 3,
            retry_delay_seconds: 5,
        }
    }
}

impl SafeModeConfig {
    /// Validate the retry schedule and snapshot location.
    ///
    /// # Errors
    /// Returns `WeftError::Config` for a zero retry delay or empty path.
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.retry_delay_seconds == 0 {
            return Err(WeftError::config("retry_delay_seconds must be positive"));
        }
        if self.snapshot_path.as_os_str().is_empty() {
            return Err(WeftError::config("snapshot_path must not be empty"));
        }
        Ok(())
    }
}

/// Parallel session buffering and reconciliation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base buffer size per persona clone, in data bytes.
    pub max_buffer_tokens: usize,
    /// Hard wall for a reconciliation pass, seconds.
    pub reconciliation_timeout_s: f64,
    /// How long a sequence gap may block before it is synthesized away.
    pub buffer_timeout_s: f64,
    /// Per-tier multipliers applied to `max_buffer_tokens`.
    pub qos_buffer_multipliers: HashMap<QosTier, f64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut multipliers = HashMap::new();
        for tier in QosTier::ALL {
            multipliers.insert(tier, tier.default_buffer_multiplier());
        }
        Self {
            max_buffer_tokens: 256,
            reconciliation_timeout_s: 30.0,
            buffer_timeout_s: 5.0,
            qos_buffer_multipliers: multipliers,
        }
    }
}

impl SessionConfig {
    /// Effective buffer limit for a tier.
    #[must_use]
    pub fn buffer_limit(&self, qos: QosTier) -> usize {
        let multiplier = self
            .qos_buffer_multipliers
            .get(&qos)
            .copied()
            .unwrap_or(1.0);
        (self.max_buffer_tokens as f64 * multiplier) as usize
    }
}

/// AIMD congestion-window parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AimdConfig {
    /// Window granted to sessions never seen before.
    pub default_window: u32,
    /// Additive-increase ceiling.
    pub max_window: u32,
    /// Latency above which even successful calls count as congestion, ms.
    pub latency_target_ms: f64,
    /// Multiplicative-decrease factor in `(0, 1)`.
    pub decrease_factor: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            default_window: 4,
            max_window: 32,
            latency_target_ms: 2000.0,
            decrease_factor: 0.5,
        }
    }
}

/// Fair scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Floor applied to every configured weight.
    pub min_weight: f64,
    /// Static starvation threshold used until enough waits are recorded, ms.
    pub starvation_threshold_ms: f64,
    /// Quantile of recent waits that defines the dynamic threshold.
    pub starvation_quantile: f64,
    /// Multiplier applied to a starved session's weight.
    pub boost_factor: f64,
    /// Per-second decay applied to an active boost.
    pub boost_decay: f64,
    /// Whether QoS rank dominates the served/weight comparison.
    pub qos_priority: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_weight: 0.1,
            starvation_threshold_ms: 50.0,
            starvation_quantile: 0.95,
            boost_factor: 2.0,
            boost_decay: 0.9,
            qos_priority: false,
        }
    }
}

/// Aggregate configuration for a `Weft` fabric instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    /// Dampening parameters for the route table's flap tracker.
    pub dampening: DampeningConfig,
    /// Hysteresis parameters for advertised health.
    pub hysteresis: HysteresisConfig,
    /// Hold-down and grace windows.
    pub hold_down: HoldDownConfig,
    /// Best-path and ECMP selection parameters.
    pub selection: SelectionConfig,
    /// Safe-mode fallback parameters.
    pub safe_mode: SafeModeConfig,
    /// Parallel session parameters.
    pub session: SessionConfig,
    /// AIMD window parameters.
    pub aimd: AimdConfig,
    /// Fair scheduler parameters.
    pub scheduler: SchedulerConfig,
}

impl WeftConfig {
    /// Validate every section.
    ///
    /// # Errors
    /// Returns the first section-level `WeftError::Config`.
    pub fn validate(&self) -> Result<(), WeftError> {
        self.dampening.validate()?;
        self.hysteresis.validate()?;
        self.hold_down.validate()?;
        self.selection.validate()?;
        self.safe_mode.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(WeftConfig::default().validate().is_ok());
    }

    #[test]
    fn reuse_threshold_must_stay_below_suppress() {
        let cfg = DampeningConfig {
            reuse_threshold: 2000,
            suppress_threshold: 2000,
            ..DampeningConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn selection_weights_must_sum_to_one() {
        let cfg = SelectionConfig {
            local_pref_weight: 0.5,
            ..SelectionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn buffer_limit_scales_by_tier() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.buffer_limit(QosTier::Gold), 128);
        assert_eq!(cfg.buffer_limit(QosTier::Silver), 256);
        assert_eq!(cfg.buffer_limit(QosTier::Bronze), 512);
    }
}
