//! Keyed route storage, weighted best-path selection and ECMP.
//!
//! The table stores one route per `(prefix, peer)` and never blocks
//! ingestion on dampening: suppression is applied at selection time so
//! operators can still inspect the underlying advertisements. Writers are
//! expected to be serialized by the embedder (single-writer, many-readers);
//! the few counters touched on read paths are atomics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use weft_types::{
    DampeningConfig, HoldDownConfig, QosTier, Route, SafeModeConfig, SelectionConfig, WeftError,
};

use crate::dampening::{DampeningInfo, DampeningTracker, HoldDownInfo};
use crate::stats::{TableCounters, inc};

/// Health samples older than this count toward the stale gauge.
const STALE_HEALTH_AFTER_S: i64 = 300;
/// Default decay half-life for health freshness weighting, seconds.
const DEFAULT_METRICS_HALF_LIFE_S: f64 = 30.0;
/// Lower clamp on the freshness factor; bounds the health penalty at 10x.
const FRESHNESS_FLOOR: f64 = 0.1;

/// Process-wide backpressure signal, injected into every component that
/// reacts to it. When active, advertised capacity envelopes are scaled by
/// the reduction factor before storage.
#[derive(Debug)]
pub struct BackpressureSignal {
    active: AtomicBool,
    /// Reduction factor as raw f64 bits.
    factor_bits: AtomicU64,
}

impl Default for BackpressureSignal {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            factor_bits: AtomicU64::new(1.0_f64.to_bits()),
        }
    }
}

impl BackpressureSignal {
    /// Activate with the given capacity reduction factor in `(0, 1]`.
    pub fn engage(&self, reduction_factor: f64) {
        self.factor_bits
            .store(reduction_factor.to_bits(), Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }

    /// Deactivate; capacity passes through unscaled again.
    pub fn release(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    /// The reduction factor if backpressure is active.
    #[must_use]
    pub fn reduction_factor(&self) -> Option<f64> {
        self.active
            .load(Ordering::Relaxed)
            .then(|| f64::from_bits(self.factor_bits.load(Ordering::Relaxed)))
    }
}

/// Aggregate route-population statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TableStats {
    /// Distinct prefixes stored.
    pub total_prefixes: usize,
    /// Total `(prefix, peer)` entries stored.
    pub total_routes: usize,
    /// Mean routes per prefix.
    pub routes_per_prefix_avg: f64,
}

/// The AGP route table.
#[derive(Debug)]
pub struct RouteTable {
    routes: HashMap<String, HashMap<String, Route>>,
    selection: SelectionConfig,
    safe_mode_config: SafeModeConfig,
    safe_mode_active: bool,
    dampening: DampeningTracker,
    backpressure: Arc<BackpressureSignal>,
    counters: TableCounters,
}

impl RouteTable {
    /// Build a table with default dampening and no backpressure source.
    ///
    /// # Errors
    /// Propagates configuration validation failures.
    pub fn new(
        selection: SelectionConfig,
        safe_mode_config: SafeModeConfig,
    ) -> Result<Self, WeftError> {
        Self::with_parts(
            selection,
            safe_mode_config,
            DampeningConfig::default(),
            HoldDownConfig::default(),
            Arc::new(BackpressureSignal::default()),
        )
    }

    /// Build a table wiring every collaborator explicitly.
    ///
    /// # Errors
    /// Propagates configuration validation failures.
    pub fn with_parts(
        selection: SelectionConfig,
        safe_mode_config: SafeModeConfig,
        dampening: DampeningConfig,
        hold_down: HoldDownConfig,
        backpressure: Arc<BackpressureSignal>,
    ) -> Result<Self, WeftError> {
        selection.validate()?;
        safe_mode_config.validate()?;
        Ok(Self {
            routes: HashMap::new(),
            selection,
            safe_mode_config,
            safe_mode_active: false,
            dampening: DampeningTracker::new(dampening, hold_down)?,
            backpressure,
            counters: TableCounters::default(),
        })
    }

    /// Counter surface (atomics; safe to read concurrently with selection).
    #[must_use]
    pub const fn counters(&self) -> &TableCounters {
        &self.counters
    }

    /// The selection configuration in effect.
    #[must_use]
    pub const fn selection_config(&self) -> &SelectionConfig {
        &self.selection
    }

    /// The safe-mode configuration in effect.
    #[must_use]
    pub const fn safe_mode_config(&self) -> &SafeModeConfig {
        &self.safe_mode_config
    }

    /// Replace the selection configuration (policy reload).
    ///
    /// # Errors
    /// Rejects configurations that fail validation; the previous
    /// configuration stays in effect.
    pub fn set_selection_config(&mut self, selection: SelectionConfig) -> Result<(), WeftError> {
        selection.validate()?;
        self.selection = selection;
        self.safe_mode_active = false;
        Ok(())
    }

    /// Access the dampening tracker.
    #[must_use]
    pub const fn dampening(&self) -> &DampeningTracker {
        &self.dampening
    }

    /// Mutable access to the dampening tracker (restore, cleanup sweeps).
    pub fn dampening_mut(&mut self) -> &mut DampeningTracker {
        &mut self.dampening
    }

    fn scale_for_backpressure(&self, route: &mut Route) {
        if let Some(factor) = self.backpressure.reduction_factor()
            && let Some(capacity) = &route.attributes.capacity
        {
            route.attributes.capacity = Some(capacity.scaled(factor));
            inc(&self.counters.backpressure_capacity_reductions_total);
        }
    }

    fn record_flap(&mut self, prefix: &str, is_withdrawal: bool, now: DateTime<Utc>) {
        let before = self.dampening.is_suppressed_at(prefix, now);
        self.dampening.record_route_change_at(prefix, is_withdrawal, now);
        if !before && self.dampening.is_suppressed_at(prefix, now) {
            inc(&self.counters.flaps_dampened_total);
        }
    }

    fn store(&mut self, route: Route) {
        self.routes
            .entry(route.prefix.clone())
            .or_default()
            .insert(route.peer_router_id.clone(), route);
        inc(&self.counters.route_updates_total);
    }

    /// Install or replace routes. Flaps are recorded but never block
    /// storage; suppression only affects selection.
    pub fn update_routes_at(&mut self, routes: Vec<Route>, now: DateTime<Utc>) {
        for mut route in routes {
            self.scale_for_backpressure(&mut route);
            self.record_flap(&route.prefix, false, now);
            self.store(route);
        }
    }

    /// [`Self::update_routes_at`] against the current wall clock.
    pub fn update_routes(&mut self, routes: Vec<Route>) {
        self.update_routes_at(routes, Utc::now());
    }

    /// Install routes subject to grace-period gating.
    ///
    /// When the peer reports recovery (`health_degraded = false`) and the
    /// prefix sits in its grace window, the advertisement is deferred
    /// (dropped, counted) rather than stored.
    pub fn update_routes_health_based_at(
        &mut self,
        routes: Vec<Route>,
        health_degraded: bool,
        now: DateTime<Utc>,
    ) {
        for mut route in routes {
            self.scale_for_backpressure(&mut route);
            self.dampening
                .record_health_change_at(&route.prefix, health_degraded, now);
            if !health_degraded && self.dampening.should_delay_advertisement_at(&route.prefix, now)
            {
                inc(&self.counters.hold_down_events_total);
                tracing::debug!(prefix = %route.prefix, "advertisement deferred by grace period");
                continue;
            }
            self.record_flap(&route.prefix, false, now);
            self.store(route);
        }
    }

    /// Remove routes: either one peer's entry or every entry for a prefix.
    pub fn withdraw_routes_at(
        &mut self,
        prefixes: &[String],
        peer_router_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        for prefix in prefixes {
            self.record_flap(prefix, true, now);
            self.remove_entries(prefix, peer_router_id);
        }
    }

    /// [`Self::withdraw_routes_at`] against the current wall clock.
    pub fn withdraw_routes(&mut self, prefixes: &[String], peer_router_id: Option<&str>) {
        self.withdraw_routes_at(prefixes, peer_router_id, Utc::now());
    }

    /// Withdraw subject to hold-down gating: while degradation is inside
    /// its persist window the withdrawal is deferred and counted, leaving
    /// the route installed to absorb transient failures.
    pub fn withdraw_routes_health_based_at(
        &mut self,
        prefixes: &[String],
        peer_router_id: Option<&str>,
        health_degraded: bool,
        now: DateTime<Utc>,
    ) {
        for prefix in prefixes {
            self.dampening
                .record_health_change_at(prefix, health_degraded, now);
            if health_degraded && self.dampening.should_delay_withdrawal_at(prefix, now) {
                inc(&self.counters.hold_down_events_total);
                tracing::debug!(prefix = %prefix, "withdrawal deferred by hold-down");
                continue;
            }
            self.record_flap(prefix, true, now);
            self.remove_entries(prefix, peer_router_id);
        }
    }

    fn remove_entries(&mut self, prefix: &str, peer_router_id: Option<&str>) {
        let Some(peers) = self.routes.get_mut(prefix) else {
            return;
        };
        match peer_router_id {
            Some(peer) => {
                if peers.remove(peer).is_some() {
                    inc(&self.counters.route_withdrawals_total);
                }
                if peers.is_empty() {
                    self.routes.remove(prefix);
                }
            }
            None => {
                self.routes.remove(prefix);
                inc(&self.counters.route_withdrawals_total);
            }
        }
    }

    /// All stored routes for a prefix, unordered.
    #[must_use]
    pub fn get_routes(&self, prefix: &str) -> Vec<&Route> {
        self.routes
            .get(prefix)
            .map(|peers| peers.values().collect())
            .unwrap_or_default()
    }

    /// Iterate every stored route.
    pub fn iter_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values().flat_map(|peers| peers.values())
    }

    /// Weighted score for a route; lower is better.
    #[must_use]
    pub fn score_route_at(
        &self,
        route: &Route,
        requested_qos: Option<QosTier>,
        now: DateTime<Utc>,
    ) -> f64 {
        let attrs = &route.attributes;
        let cfg = &self.selection;
        let mut score = 0.0;

        // LOCAL_PREF: higher is better, so it enters negated.
        let local_pref = f64::from(attrs.local_pref.unwrap_or(0));
        score += cfg.local_pref_weight * (-local_pref / 1000.0);

        score += cfg.path_len_weight * (attrs.path.len() as f64 / 10.0);

        if let Some(health) = &attrs.health {
            let base = health.p95_ms / 1000.0 + health.err_rate * 10.0;
            score += cfg.health_weight * (base / self.freshness_factor(route, now));
        }

        if let Some(cost) = &attrs.cost {
            score += cfg.cost_weight * (cost.usd_per_1k_tokens * 100.0);
        }

        if let Some(predictability) = &attrs.predictability {
            score += cfg.predict_weight
                * (predictability.estimate_mape_7d + predictability.under_rate_7d);
        }

        let qos_fit = match (requested_qos, &attrs.qos_supported) {
            (Some(tier), Some(supported)) if !supported.contains(&tier) => 1.0,
            _ => 0.0,
        };
        score += cfg.qos_fit_weight * qos_fit;

        if let Some(overhead) = &attrs.overhead {
            score += cfg.overhead_weight
                * (overhead.overhead_mape_7d + (overhead.overhead_p95_factor - 1.0).abs());
        }

        score
    }

    /// Freshness factor `F = max(exp(−Δt/τ), 0.1)` for health weighting.
    ///
    /// Missing health or timestamps get no penalty; future timestamps get
    /// no penalty. The 0.1 floor caps the health penalty at tenfold.
    fn freshness_factor(&self, route: &Route, now: DateTime<Utc>) -> f64 {
        let Some(health) = &route.attributes.health else {
            return 1.0;
        };
        let Some(taken_at) = health.metrics_timestamp else {
            return 1.0;
        };
        let delta_s = (now - taken_at).num_milliseconds() as f64 / 1000.0;
        if delta_s <= 0.0 {
            return 1.0;
        }
        let tau = health
            .metrics_half_life_s
            .unwrap_or(DEFAULT_METRICS_HALF_LIFE_S);
        (-delta_s / tau).exp().max(FRESHNESS_FLOOR)
    }

    /// Valid candidates ordered by `(score, received_at, peer)`.
    fn scored_candidates_at(
        &self,
        prefix: &str,
        requested_qos: Option<QosTier>,
        now: DateTime<Utc>,
    ) -> Vec<(&Route, f64)> {
        let mut scored: Vec<(&Route, f64)> = self
            .get_routes(prefix)
            .into_iter()
            .filter(|route| route.is_valid_at(now))
            .filter(|route| match requested_qos {
                Some(tier) => route
                    .attributes
                    .qos_supported
                    .as_ref()
                    .is_some_and(|supported| supported.contains(&tier)),
                None => true,
            })
            .map(|route| (route, self.score_route_at(route, requested_qos, now)))
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sa.total_cmp(sb)
                .then_with(|| a.received_at.cmp(&b.received_at))
                .then_with(|| a.peer_router_id.cmp(&b.peer_router_id))
        });
        scored
    }

    /// Best route for a prefix, or `None` when the prefix is suppressed or
    /// no valid candidate exists.
    #[must_use]
    pub fn get_best_route_at(&self, prefix: &str, now: DateTime<Utc>) -> Option<&Route> {
        if self.dampening.is_suppressed_at(prefix, now) {
            return None;
        }
        self.scored_candidates_at(prefix, None, now)
            .first()
            .map(|(route, _)| *route)
    }

    /// [`Self::get_best_route_at`] against the current wall clock.
    #[must_use]
    pub fn get_best_route(&self, prefix: &str) -> Option<&Route> {
        self.get_best_route_at(prefix, Utc::now())
    }

    /// The lowest-score equivalence class for a prefix, capped at
    /// `max_ecmp_paths`, optionally filtered to routes supporting a tier.
    ///
    /// With ECMP disabled the group collapses to the single best route.
    #[must_use]
    pub fn get_ecmp_routes_at(
        &self,
        prefix: &str,
        requested_qos: Option<QosTier>,
        now: DateTime<Utc>,
    ) -> Vec<&Route> {
        if self.dampening.is_suppressed_at(prefix, now) {
            return Vec::new();
        }
        let scored = self.scored_candidates_at(prefix, requested_qos, now);
        let Some(&(_, best)) = scored.first() else {
            return Vec::new();
        };
        // Scores are rounded to fixed precision so float noise does not
        // split an equivalence class.
        let key = |score: f64| (score * 1e6).round() as i64;
        let best_key = key(best);
        let mut group: Vec<&Route> = scored
            .into_iter()
            .take_while(|&(_, score)| key(score) == best_key)
            .map(|(route, _)| route)
            .collect();
        let cap = if self.selection.enable_ecmp {
            self.selection.max_ecmp_paths
        } else {
            1
        };
        group.truncate(cap);
        if group.len() > 1 {
            inc(&self.counters.ecmp_splits_total);
        }
        group
    }

    /// [`Self::get_ecmp_routes_at`] against the current wall clock.
    #[must_use]
    pub fn get_ecmp_routes(&self, prefix: &str, requested_qos: Option<QosTier>) -> Vec<&Route> {
        self.get_ecmp_routes_at(prefix, requested_qos, Utc::now())
    }

    /// Deterministically pick one member of the ECMP group for a session.
    ///
    /// The member index is a hash of `(seed, session_id, prefix)` modulo the
    /// group size, so a session sticks to its member for as long as the
    /// equivalence set is unchanged.
    #[must_use]
    pub fn select_route_with_ecmp_at(
        &self,
        prefix: &str,
        session_id: &str,
        requested_qos: Option<QosTier>,
        now: DateTime<Utc>,
    ) -> Option<&Route> {
        let group = self.get_ecmp_routes_at(prefix, requested_qos, now);
        match group.len() {
            0 => None,
            1 => Some(group[0]),
            n => {
                let mut hasher = Sha256::new();
                hasher.update(self.selection.ecmp_hash_seed.as_bytes());
                hasher.update(b":");
                hasher.update(session_id.as_bytes());
                hasher.update(b":");
                hasher.update(prefix.as_bytes());
                let digest = hasher.finalize();
                let value = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
                Some(group[(value % n as u64) as usize])
            }
        }
    }

    /// [`Self::select_route_with_ecmp_at`] against the current wall clock.
    #[must_use]
    pub fn select_route_with_ecmp(
        &self,
        prefix: &str,
        session_id: &str,
        requested_qos: Option<QosTier>,
    ) -> Option<&Route> {
        self.select_route_with_ecmp_at(prefix, session_id, requested_qos, Utc::now())
    }

    /// Remove expired routes; returns how many were reaped.
    pub fn cleanup_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, peers| {
            peers.retain(|_, route| {
                let keep = route.is_valid_at(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !peers.is_empty()
        });
        removed
    }

    /// [`Self::cleanup_expired_at`] against the current wall clock.
    pub fn cleanup_expired(&mut self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    /// Routes whose health sample is older than five minutes.
    #[must_use]
    pub fn stale_health_routes_at(&self, now: DateTime<Utc>) -> usize {
        self.iter_routes()
            .filter(|route| {
                route
                    .attributes
                    .health
                    .as_ref()
                    .and_then(|h| h.metrics_timestamp)
                    .is_some_and(|taken| now - taken > Duration::seconds(STALE_HEALTH_AFTER_S))
            })
            .count()
    }

    /// Prefixes currently suppressed by dampening.
    #[must_use]
    pub fn dampened_prefixes_at(&self, now: DateTime<Utc>) -> usize {
        self.routes
            .keys()
            .filter(|prefix| self.dampening.is_suppressed_at(prefix, now))
            .count()
    }

    /// Aggregate population statistics.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        let total_prefixes = self.routes.len();
        let total_routes = self.routes.values().map(HashMap::len).sum();
        TableStats {
            total_prefixes,
            total_routes,
            routes_per_prefix_avg: if total_prefixes == 0 {
                0.0
            } else {
                total_routes as f64 / total_prefixes as f64
            },
        }
    }

    /// Decayed dampening view for a prefix.
    #[must_use]
    pub fn dampening_info_at(&self, prefix: &str, now: DateTime<Utc>) -> DampeningInfo {
        self.dampening.dampening_info_at(prefix, now)
    }

    /// [`Self::dampening_info_at`] against the current wall clock.
    #[must_use]
    pub fn get_dampening_info(&self, prefix: &str) -> DampeningInfo {
        self.dampening_info_at(prefix, Utc::now())
    }

    /// Timer view for a prefix.
    #[must_use]
    pub fn hold_down_info_at(&self, prefix: &str, now: DateTime<Utc>) -> HoldDownInfo {
        self.dampening.hold_down_info_at(prefix, now)
    }

    /// Whether the table is serving from the last-known-good snapshot.
    #[must_use]
    pub const fn is_in_safe_mode(&self) -> bool {
        self.safe_mode_active
    }

    /// Leave safe mode without touching the stored routes.
    pub fn exit_safe_mode(&mut self) {
        self.safe_mode_active = false;
        tracing::info!("exited safe mode");
    }

    pub(crate) fn set_safe_mode_active(&mut self) {
        self.safe_mode_active = true;
        inc(&self.counters.safe_mode_entries_total);
    }

    pub(crate) fn replace_routes(
        &mut self,
        routes: HashMap<String, HashMap<String, Route>>,
    ) {
        self.routes = routes;
    }

    pub(crate) fn routes_map(&self) -> &HashMap<String, HashMap<String, Route>> {
        &self.routes
    }
}
