//! Adaptive reconciliation-policy switching.
//!
//! Heuristic selection stands in until a learned policy is available; the
//! performance ledger it would train on is already maintained here.

use chrono::{DateTime, Utc};

use weft_core::ReconciliationPolicy;

/// EWMA learning rate for the performance ledger.
const PERFORMANCE_ALPHA: f64 = 0.1;

/// Context a switching decision is made against.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchingContext {
    /// Request complexity in `[0, 1]`.
    pub request_complexity: f64,
    /// Whether low latency is required.
    pub time_pressure: bool,
    /// Cost sensitivity in `[0, 1]`.
    pub cost_sensitivity: f64,
    /// Quality requirement in `[0, 1]`.
    pub quality_requirement: f64,
    /// Personas participating in the session.
    pub persona_count: usize,
    /// Recent convergence outcomes, newest last.
    pub convergence_history: Vec<bool>,
}

/// Smoothed performance record for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPerformance {
    /// Success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Smoothed latency, milliseconds.
    pub avg_latency_ms: f64,
    /// Smoothed cost per reconciliation.
    pub avg_cost_usd: f64,
    /// Smoothed quality score in `[0, 1]`.
    pub quality_score: f64,
    /// Observations folded in.
    pub sample_count: u64,
    /// When the record was last updated.
    pub last_updated: DateTime<Utc>,
}

/// Heuristic switcher between reconciliation policies.
///
/// Switches are throttled by `min_switch_interval`; when disabled, the
/// session's configured policy is always returned.
#[derive(Debug)]
pub struct AdaptiveSwitcher {
    enabled: bool,
    current: ReconciliationPolicy,
    last_switch: Option<DateTime<Utc>>,
    min_switch_interval_s: f64,
    performance: std::collections::HashMap<String, StrategyPerformance>,
    switches_total: u64,
}

impl Default for AdaptiveSwitcher {
    fn default() -> Self {
        Self::new(false)
    }
}

impl AdaptiveSwitcher {
    /// Build a switcher; defaults to first-win and a 300 s switch throttle.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            current: ReconciliationPolicy::FirstWin,
            last_switch: None,
            min_switch_interval_s: 300.0,
            performance: std::collections::HashMap::new(),
            switches_total: 0,
        }
    }

    /// Enable or disable switching.
    pub const fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Times a switch has actually happened.
    #[must_use]
    pub const fn switches_total(&self) -> u64 {
        self.switches_total
    }

    /// Select the policy to use for the given context.
    ///
    /// Disabled or throttled switchers return the current policy unchanged.
    pub fn select_policy_at(
        &mut self,
        context: &SwitchingContext,
        now: DateTime<Utc>,
    ) -> ReconciliationPolicy {
        if !self.enabled {
            return self.current.clone();
        }
        if let Some(last) = self.last_switch {
            let elapsed_s = (now - last).num_milliseconds() as f64 / 1000.0;
            if elapsed_s < self.min_switch_interval_s {
                return self.current.clone();
            }
        }
        let recommended = Self::heuristic_selection(context);
        if recommended.name() != self.current.name() {
            tracing::info!(
                from = self.current.name(),
                to = recommended.name(),
                time_pressure = context.time_pressure,
                quality = context.quality_requirement,
                "reconciliation policy switch"
            );
            self.last_switch = Some(now);
            self.switches_total += 1;
            self.current = recommended;
        }
        self.current.clone()
    }

    /// Whether a switch is recommended for the context: the current
    /// strategy underperforms (<70% success), is slow under time pressure,
    /// or scores poorly against a high quality requirement.
    #[must_use]
    pub fn should_switch(&self, context: &SwitchingContext) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(perf) = self.performance.get(self.current.name()) else {
            return false;
        };
        if perf.sample_count < 5 {
            return false;
        }
        perf.success_rate < 0.7
            || (context.time_pressure && perf.avg_latency_ms > 2000.0)
            || (context.quality_requirement > 0.8 && perf.quality_score < 0.7)
    }

    /// Fold one reconciliation outcome into the performance ledger.
    pub fn update_performance_at(
        &mut self,
        strategy: &str,
        success: bool,
        latency_ms: f64,
        cost_usd: f64,
        quality_score: f64,
        now: DateTime<Utc>,
    ) {
        let record = self
            .performance
            .entry(strategy.to_string())
            .or_insert(StrategyPerformance {
                success_rate: 0.0,
                avg_latency_ms: 0.0,
                avg_cost_usd: 0.0,
                quality_score: 0.0,
                sample_count: 0,
                last_updated: now,
            });
        let alpha = PERFORMANCE_ALPHA;
        record.sample_count += 1;
        record.success_rate =
            (1.0 - alpha) * record.success_rate + alpha * f64::from(u8::from(success));
        record.avg_latency_ms = (1.0 - alpha) * record.avg_latency_ms + alpha * latency_ms;
        record.avg_cost_usd = (1.0 - alpha) * record.avg_cost_usd + alpha * cost_usd;
        record.quality_score = (1.0 - alpha) * record.quality_score + alpha * quality_score;
        record.last_updated = now;
    }

    /// Performance record for a strategy, if any outcomes were recorded.
    #[must_use]
    pub fn performance(&self, strategy: &str) -> Option<&StrategyPerformance> {
        self.performance.get(strategy)
    }

    fn heuristic_selection(context: &SwitchingContext) -> ReconciliationPolicy {
        if context.time_pressure {
            ReconciliationPolicy::FirstWin
        } else if context.quality_requirement > 0.8 {
            ReconciliationPolicy::from_name("consensus").expect("known policy")
        } else if context.cost_sensitivity > 0.7 {
            ReconciliationPolicy::from_name("weighted-merge").expect("known policy")
        } else if context.persona_count > 3 {
            ReconciliationPolicy::from_name("arbiter").expect("known policy")
        } else {
            ReconciliationPolicy::FirstWin
        }
    }
}
