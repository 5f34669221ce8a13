//! Flap dampening and hold-down/grace timer kernel.
//!
//! Penalty accounting follows the classic dampening model: every flap adds
//! `penalty_per_flap` (capped), the penalty decays exponentially with the
//! configured half-life, suppression engages at `suppress_threshold` and
//! clears below `reuse_threshold`. A rolling-minute flap counter suppresses
//! independently of penalty.
//!
//! Reads are pure: accessors report the decayed view of the state without
//! mutating it; the stored penalty is brought forward at the next recorded
//! event. Both code paths share the same `now`, which tests inject.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use weft_types::{DampeningConfig, HoldDownConfig, WeftError};

/// Decayed, point-in-time view of a prefix's dampening state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DampeningInfo {
    /// Decayed penalty at the query instant.
    pub penalty: u32,
    /// Whether the prefix is suppressed.
    pub suppressed: bool,
    /// Flaps observed in the current rolling minute.
    pub flap_count: u32,
    /// Seconds since the last flap, if any was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flap_seconds_ago: Option<f64>,
}

impl DampeningInfo {
    fn zero() -> Self {
        Self {
            penalty: 0,
            suppressed: false,
            flap_count: 0,
            last_flap_seconds_ago: None,
        }
    }
}

/// Point-in-time view of a prefix's hold-down/grace timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldDownInfo {
    /// Withdrawals for the prefix are currently deferred.
    pub in_hold_down: bool,
    /// Re-advertisements for the prefix are currently deferred.
    pub in_grace_period: bool,
    /// Seconds until the hold-down window expires.
    pub hold_down_remaining_seconds: f64,
    /// Seconds until the grace window expires.
    pub grace_period_remaining_seconds: f64,
}

#[derive(Debug, Clone, Default)]
struct DampeningState {
    /// Penalty as of `last_flap`; decays lazily from there.
    penalty: f64,
    last_flap: Option<DateTime<Utc>>,
    suppressed: bool,
    flap_count: u32,
    minute_start: Option<DateTime<Utc>>,
}

impl DampeningState {
    fn decayed_penalty(&self, now: DateTime<Utc>, config: &DampeningConfig) -> f64 {
        let Some(last) = self.last_flap else {
            return self.penalty;
        };
        let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 || self.penalty == 0.0 {
            return self.penalty;
        }
        let half_life_s = f64::from(config.half_life_minutes) * 60.0;
        self.penalty * 0.5_f64.powf(elapsed / half_life_s)
    }

    /// Suppressed as observed at `now`: the sticky flag, cleared once the
    /// decayed penalty has fallen below the reuse threshold.
    fn is_suppressed(&self, now: DateTime<Utc>, config: &DampeningConfig) -> bool {
        self.suppressed && self.decayed_penalty(now, config) >= f64::from(config.reuse_threshold)
    }

    fn flap_rate_exceeded(&self, now: DateTime<Utc>, config: &DampeningConfig) -> bool {
        match self.minute_start {
            Some(start) if now - start < Duration::seconds(60) => {
                self.flap_count >= config.max_flaps_per_minute
            }
            _ => false,
        }
    }

    fn record_flap(&mut self, now: DateTime<Utc>, config: &DampeningConfig) {
        // Bring the penalty forward before adding; resolve any pending
        // suppression clearance at the same instant.
        self.penalty = self.decayed_penalty(now, config);
        if self.suppressed && self.penalty < f64::from(config.reuse_threshold) {
            self.suppressed = false;
        }

        match self.minute_start {
            Some(start) if now - start < Duration::seconds(60) => self.flap_count += 1,
            _ => {
                self.minute_start = Some(now);
                self.flap_count = 1;
            }
        }

        self.penalty =
            (self.penalty + f64::from(config.penalty_per_flap)).min(f64::from(config.max_penalty));
        self.last_flap = Some(now);

        if self.penalty >= f64::from(config.suppress_threshold) {
            self.suppressed = true;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct HoldDownState {
    hold_down_until: Option<DateTime<Utc>>,
    grace_period_until: Option<DateTime<Utc>>,
    /// Last reported health direction; windows start on transitions only.
    degraded: Option<bool>,
}

impl HoldDownState {
    fn in_hold_down(&self, now: DateTime<Utc>) -> bool {
        self.hold_down_until.is_some_and(|until| now < until)
    }

    fn in_grace_period(&self, now: DateTime<Utc>) -> bool {
        self.grace_period_until.is_some_and(|until| now < until)
    }
}

/// Tracks dampening penalties and hold-down/grace timers per prefix.
#[derive(Debug)]
pub struct DampeningTracker {
    config: DampeningConfig,
    hold_down_config: HoldDownConfig,
    states: HashMap<String, DampeningState>,
    hold_down_states: HashMap<String, HoldDownState>,
}

impl DampeningTracker {
    /// Build a tracker, validating both configurations.
    ///
    /// # Errors
    /// Propagates `WeftError::Config` from either section.
    pub fn new(
        config: DampeningConfig,
        hold_down_config: HoldDownConfig,
    ) -> Result<Self, WeftError> {
        config.validate()?;
        hold_down_config.validate()?;
        Ok(Self {
            config,
            hold_down_config,
            states: HashMap::new(),
            hold_down_states: HashMap::new(),
        })
    }

    /// Dampening configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &DampeningConfig {
        &self.config
    }

    /// Record an advertisement (`is_withdrawal = false`) or withdrawal.
    ///
    /// A withdrawal always counts as a flap. An advertisement counts only
    /// when the prefix has flapped before (advertisement-after-withdrawal);
    /// the very first advertisement of a stable prefix accrues no penalty.
    pub fn record_route_change_at(&mut self, prefix: &str, is_withdrawal: bool, now: DateTime<Utc>) {
        let state = self.states.entry(prefix.to_string()).or_default();
        if is_withdrawal || state.last_flap.is_some() {
            state.record_flap(now, &self.config);
            if state.suppressed {
                tracing::debug!(prefix, penalty = state.penalty as u64, "prefix dampened");
            }
        }
    }

    /// Whether the prefix is suppressed (penalty-based or rate-based).
    #[must_use]
    pub fn is_suppressed_at(&self, prefix: &str, now: DateTime<Utc>) -> bool {
        self.states.get(prefix).is_some_and(|state| {
            state.is_suppressed(now, &self.config) || state.flap_rate_exceeded(now, &self.config)
        })
    }

    /// Whether the rolling-minute flap guard alone would suppress the prefix.
    #[must_use]
    pub fn flap_rate_exceeded_at(&self, prefix: &str, now: DateTime<Utc>) -> bool {
        self.states
            .get(prefix)
            .is_some_and(|state| state.flap_rate_exceeded(now, &self.config))
    }

    /// Decayed dampening view for a prefix.
    #[must_use]
    pub fn dampening_info_at(&self, prefix: &str, now: DateTime<Utc>) -> DampeningInfo {
        let Some(state) = self.states.get(prefix) else {
            return DampeningInfo::zero();
        };
        DampeningInfo {
            penalty: state.decayed_penalty(now, &self.config).round() as u32,
            suppressed: state.is_suppressed(now, &self.config),
            flap_count: state.flap_count,
            last_flap_seconds_ago: state
                .last_flap
                .map(|t| (now - t).num_milliseconds() as f64 / 1000.0),
        }
    }

    /// Record a health report for hold-down/grace tracking.
    ///
    /// Windows start on direction *transitions* only: degradation starts
    /// hold-down unless the prefix was already degraded, recovery starts
    /// grace unless it was already healthy. Starting either window clears
    /// the opposite one; repeated same-direction reports never extend or
    /// restart a window, so an expired window stays expired until the
    /// direction flips again.
    pub fn record_health_change_at(
        &mut self,
        prefix: &str,
        health_degraded: bool,
        now: DateTime<Utc>,
    ) {
        let state = self.hold_down_states.entry(prefix.to_string()).or_default();
        if state.degraded == Some(health_degraded) {
            return;
        }
        state.degraded = Some(health_degraded);
        if health_degraded {
            state.grace_period_until = None;
            state.hold_down_until =
                Some(now + Duration::seconds(i64::from(self.hold_down_config.persist_seconds)));
        } else {
            state.hold_down_until = None;
            state.grace_period_until =
                Some(now + Duration::seconds(i64::from(self.hold_down_config.grace_seconds)));
        }
    }

    /// Whether a withdrawal for the prefix must be deferred.
    #[must_use]
    pub fn should_delay_withdrawal_at(&self, prefix: &str, now: DateTime<Utc>) -> bool {
        self.hold_down_states
            .get(prefix)
            .is_some_and(|state| state.in_hold_down(now))
    }

    /// Whether a re-advertisement for the prefix must be deferred.
    #[must_use]
    pub fn should_delay_advertisement_at(&self, prefix: &str, now: DateTime<Utc>) -> bool {
        self.hold_down_states
            .get(prefix)
            .is_some_and(|state| state.in_grace_period(now))
    }

    /// Timer view for a prefix.
    #[must_use]
    pub fn hold_down_info_at(&self, prefix: &str, now: DateTime<Utc>) -> HoldDownInfo {
        let state = self.hold_down_states.get(prefix);
        let remaining = |until: Option<DateTime<Utc>>| {
            until.map_or(0.0, |t| {
                ((t - now).num_milliseconds() as f64 / 1000.0).max(0.0)
            })
        };
        match state {
            None => HoldDownInfo {
                in_hold_down: false,
                in_grace_period: false,
                hold_down_remaining_seconds: 0.0,
                grace_period_remaining_seconds: 0.0,
            },
            Some(state) => HoldDownInfo {
                in_hold_down: state.in_hold_down(now),
                in_grace_period: state.in_grace_period(now),
                hold_down_remaining_seconds: remaining(state.hold_down_until),
                grace_period_remaining_seconds: remaining(state.grace_period_until),
            },
        }
    }

    /// Drop idle zero-penalty states older than `max_age_seconds`.
    pub fn cleanup_expired_at(&mut self, max_age_seconds: i64, now: DateTime<Utc>) {
        let config = &self.config;
        self.states.retain(|_, state| {
            let idle = state
                .last_flap
                .is_none_or(|t| now - t > Duration::seconds(max_age_seconds));
            !(idle && state.decayed_penalty(now, config) < 1.0)
        });
    }

    /// Iterate prefixes with a non-zero decayed penalty (for snapshots).
    pub fn penalized_prefixes_at(
        &self,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = (&str, DampeningInfo)> {
        self.states.keys().filter_map(move |prefix| {
            let info = self.dampening_info_at(prefix, now);
            (info.penalty > 0).then_some((prefix.as_str(), info))
        })
    }

    /// Wipe all dampening and timer state.
    pub fn clear_all(&mut self) {
        self.states.clear();
        self.hold_down_states.clear();
    }

    /// Restore a prefix's dampening state from snapshot data.
    pub fn restore_state(&mut self, prefix: &str, info: &DampeningInfo, now: DateTime<Utc>) {
        let last_flap = info
            .last_flap_seconds_ago
            .map(|ago| now - Duration::milliseconds((ago * 1000.0) as i64));
        self.states.insert(
            prefix.to_string(),
            DampeningState {
                penalty: f64::from(info.penalty),
                last_flap,
                suppressed: info.suppressed,
                flap_count: info.flap_count,
                minute_start: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> DampeningTracker {
        DampeningTracker::new(DampeningConfig::default(), HoldDownConfig::default()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn first_advertisement_accrues_no_penalty() {
        let mut tracker = tracker();
        tracker.record_route_change_at("10.0.0.0/8", false, t0());
        assert_eq!(tracker.dampening_info_at("10.0.0.0/8", t0()).penalty, 0);
    }

    #[test]
    fn withdrawal_then_readvertisement_both_count() {
        let mut tracker = tracker();
        let now = t0();
        tracker.record_route_change_at("10.0.0.0/8", true, now);
        tracker.record_route_change_at("10.0.0.0/8", false, now);
        let info = tracker.dampening_info_at("10.0.0.0/8", now);
        assert_eq!(info.penalty, 2000);
        assert!(info.suppressed);
    }

    #[test]
    fn penalty_decays_with_half_life() {
        let mut tracker = tracker();
        let now = t0();
        tracker.record_route_change_at("10.0.0.0/8", true, now);
        let later = now + Duration::minutes(15);
        let info = tracker.dampening_info_at("10.0.0.0/8", later);
        assert_eq!(info.penalty, 500);
    }

    #[test]
    fn hold_down_not_extended_by_repeat_degradation() {
        let mut tracker = tracker();
        let now = t0();
        tracker.record_health_change_at("p", true, now);
        let first = tracker.hold_down_info_at("p", now).hold_down_remaining_seconds;
        tracker.record_health_change_at("p", true, now + Duration::seconds(3));
        let after = tracker
            .hold_down_info_at("p", now + Duration::seconds(3))
            .hold_down_remaining_seconds;
        assert!(after < first);
    }

    #[test]
    fn grace_clears_hold_down_and_vice_versa() {
        let mut tracker = tracker();
        let now = t0();
        tracker.record_health_change_at("p", true, now);
        assert!(tracker.should_delay_withdrawal_at("p", now));
        tracker.record_health_change_at("p", false, now + Duration::seconds(1));
        let at = now + Duration::seconds(1);
        assert!(!tracker.should_delay_withdrawal_at("p", at));
        assert!(tracker.should_delay_advertisement_at("p", at));
    }
}
