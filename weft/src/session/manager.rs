//! Session lifecycle: clone allocation, creation, lookup, reconciliation
//! entry points with tracing spans and audit emission, and expiry sweeps.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info_span;

use weft_core::{
    PersonaStats, ReconcileOutcome, ReconciliationPolicy, SessionConfig, WeftError,
};

use crate::audit::AuditLog;
use crate::metrics::Histogram;

use super::adaptive::AdaptiveSwitcher;
use super::strategy::{Arbiter, StubArbiter};
use super::{ParallelSession, PersonaSlot, SessionState};

/// Specification for allocating clones of one persona.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PersonaSpec {
    /// Persona to clone.
    pub persona_id: String,
    /// How many clones to allocate.
    #[serde(default = "PersonaSpec::default_count")]
    pub count: u32,
}

impl PersonaSpec {
    const fn default_count() -> u32 {
        1
    }

    /// Spec for a single clone of a persona.
    #[must_use]
    pub fn single(persona_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            count: 1,
        }
    }
}

/// Owns every live parallel session.
pub struct SessionManager {
    config: SessionConfig,
    sessions: HashMap<String, ParallelSession>,
    clone_id_counter: u64,
    arbiter: Arc<dyn Arbiter>,
    switcher: AdaptiveSwitcher,
    adaptive_default: bool,
    audit: Option<AuditLog>,
    /// Head-of-line gap waits drained from sessions, milliseconds.
    buffer_wait_ms: Histogram,
    reconciliations_total: u64,
    streaming_reconciliations_total: u64,
}

impl SessionManager {
    /// Build a manager with the stub arbiter and no audit log.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            clone_id_counter: 0,
            arbiter: Arc::new(StubArbiter),
            switcher: AdaptiveSwitcher::default(),
            adaptive_default: false,
            audit: None,
            buffer_wait_ms: Histogram::new(&[10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
            reconciliations_total: 0,
            streaming_reconciliations_total: 0,
        }
    }

    /// Attach an HMAC-chained audit log.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the arbiter used for divergence adjudication.
    #[must_use]
    pub fn with_arbiter(mut self, arbiter: Arc<dyn Arbiter>) -> Self {
        self.arbiter = arbiter;
        self
    }

    /// Enable adaptive policy switching; sessions created from here on opt
    /// in unless they clear their own flag.
    #[must_use]
    pub fn with_adaptive_switching(mut self) -> Self {
        self.switcher.set_enabled(true);
        self.adaptive_default = true;
        self
    }

    /// Live session count.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Total dispatch targets across live sessions.
    #[must_use]
    pub fn dispatch_targets(&self) -> usize {
        self.sessions
            .values()
            .map(|session| session.personas.len())
            .sum()
    }

    /// Reconciliations performed since construction.
    #[must_use]
    pub const fn reconciliations_total(&self) -> u64 {
        self.reconciliations_total
    }

    /// Streaming reconciliations performed since construction.
    #[must_use]
    pub const fn streaming_reconciliations_total(&self) -> u64 {
        self.streaming_reconciliations_total
    }

    /// Gap-wait histogram snapshot.
    #[must_use]
    pub fn buffer_wait_snapshot(&self) -> crate::metrics::HistogramSnapshot {
        self.buffer_wait_ms.snapshot()
    }

    /// Allocate globally monotonic clone ids for the given specs.
    pub fn allocate_clones(&mut self, specs: &[PersonaSpec]) -> Vec<PersonaSlot> {
        let mut slots = Vec::new();
        for spec in specs {
            for _ in 0..spec.count.max(1) {
                self.clone_id_counter += 1;
                slots.push(PersonaSlot::new(
                    spec.persona_id.clone(),
                    Some(self.clone_id_counter),
                ));
            }
        }
        slots
    }

    /// Create a session, allocating clones from specs.
    ///
    /// # Errors
    /// Propagates audit-append failures.
    pub fn create_session_with_clones_at(
        &mut self,
        session_id: impl Into<String>,
        specs: &[PersonaSpec],
        policy: ReconciliationPolicy,
        now: DateTime<Utc>,
    ) -> Result<&mut ParallelSession, WeftError> {
        let slots = self.allocate_clones(specs);
        self.create_session_at(session_id, slots, policy, now)
    }

    /// Create a session from pre-built persona slots.
    ///
    /// # Errors
    /// Propagates audit-append failures.
    pub fn create_session_at(
        &mut self,
        session_id: impl Into<String>,
        personas: Vec<PersonaSlot>,
        policy: ReconciliationPolicy,
        now: DateTime<Utc>,
    ) -> Result<&mut ParallelSession, WeftError> {
        let session_id = session_id.into();
        let span = info_span!("dispatch.session", session = %session_id, personas = personas.len());
        let _guard = span.enter();

        let mut session = ParallelSession::new_at(
            session_id.clone(),
            self.config.clone(),
            personas,
            policy,
            now,
        );
        session.adaptive_enabled = self.adaptive_default;
        self.audit_event(json!({
            "ts": now.timestamp_millis() as f64 / 1000.0,
            "event": "session_created",
            "session_id": session_id,
            "persona_count": session.personas.len(),
            "reconciliation_policy": session.reconciliation_policy.name(),
        }))?;
        self.sessions.insert(session_id.clone(), session);
        Ok(self
            .sessions
            .get_mut(&session_id)
            .expect("session was just inserted"))
    }

    /// Look up a session.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<&ParallelSession> {
        self.sessions.get(session_id)
    }

    /// Look up a session mutably.
    pub fn get_session_mut(&mut self, session_id: &str) -> Option<&mut ParallelSession> {
        self.sessions.get_mut(session_id)
    }

    /// Drop a session.
    pub fn remove_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Mark a persona clone complete and, when the session can already
    /// produce a partial result, run streaming reconciliation.
    ///
    /// # Errors
    /// Propagates strategy and audit failures.
    pub fn mark_persona_complete_and_check_streaming_at(
        &mut self,
        session_id: &str,
        persona_id: &str,
        stats: PersonaStats,
        clone_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileOutcome>, WeftError> {
        {
            let session =
                self.sessions
                    .get_mut(session_id)
                    .ok_or_else(|| WeftError::SessionNotFound {
                        session_id: session_id.to_string(),
                    })?;
            session.mark_persona_complete_at(persona_id, stats, clone_id, now);
            if !session.can_streaming_reconcile() {
                return Ok(None);
            }
        }
        self.streaming_reconcile_session_at(session_id, now)
    }

    /// Resolve the policy a session should reconcile under, honoring the
    /// adaptive switcher for sessions that opted in.
    fn effective_policy_at(
        &mut self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationPolicy, WeftError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| WeftError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.adaptive_enabled {
            let context = session.switching_context();
            Ok(self.switcher.select_policy_at(&context, now))
        } else {
            Ok(session.reconciliation_policy.clone())
        }
    }

    /// Reconcile a session under a tracing span, emitting an audit event.
    ///
    /// # Errors
    /// `WeftError::SessionNotFound` for unknown ids; strategy preconditions
    /// and audit failures propagate.
    pub fn reconcile_session_at(
        &mut self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, WeftError> {
        let policy = self.effective_policy_at(session_id, now)?;
        let arbiter = Arc::clone(&self.arbiter);

        let (outcome, persona_count, gap_waits) = {
            let session =
                self.sessions
                    .get_mut(session_id)
                    .ok_or_else(|| WeftError::SessionNotFound {
                        session_id: session_id.to_string(),
                    })?;
            let span = info_span!(
                "reconciliation.session",
                session = %session_id,
                personas = session.personas.len(),
                policy = policy.name()
            );
            let _guard = span.enter();

            session.reconciliation_policy = policy;
            let outcome = session.reconcile_results_at(arbiter.as_ref(), now)?;
            let waits = std::mem::take(&mut session.gap_waits_ms);
            (outcome, session.personas.len(), waits)
        };

        for wait in gap_waits {
            self.buffer_wait_ms.observe(wait);
        }
        self.reconciliations_total += 1;
        self.audit_event(json!({
            "ts": now.timestamp_millis() as f64 / 1000.0,
            "event": "reconciliation_complete",
            "session_id": session_id,
            "policy": outcome.policy,
            "persona_count": persona_count,
            "has_result": !outcome.result.is_empty(),
        }))?;
        Ok(outcome)
    }

    /// [`Self::reconcile_session_at`] against the current wall clock.
    ///
    /// # Errors
    /// See [`Self::reconcile_session_at`].
    pub fn reconcile_session(&mut self, session_id: &str) -> Result<ReconcileOutcome, WeftError> {
        self.reconcile_session_at(session_id, Utc::now())
    }

    /// Attempt streaming reconciliation for a session.
    ///
    /// Returns `Ok(None)` when the strategy cannot produce a partial result
    /// yet.
    ///
    /// # Errors
    /// `WeftError::SessionNotFound` for unknown ids; strategy and audit
    /// failures propagate.
    pub fn streaming_reconcile_session_at(
        &mut self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileOutcome>, WeftError> {
        let arbiter = Arc::clone(&self.arbiter);
        let (outcome, total_personas) = {
            let session =
                self.sessions
                    .get_mut(session_id)
                    .ok_or_else(|| WeftError::SessionNotFound {
                        session_id: session_id.to_string(),
                    })?;
            let span = info_span!("streaming.reconciliation", session = %session_id);
            let _guard = span.enter();
            let outcome = session.streaming_reconcile_at(arbiter.as_ref(), now)?;
            (outcome, session.personas.len())
        };

        if let Some(outcome) = &outcome {
            self.streaming_reconciliations_total += 1;
            self.audit_event(json!({
                "ts": now.timestamp_millis() as f64 / 1000.0,
                "event": "streaming_reconciliation",
                "session_id": session_id,
                "policy": outcome.policy,
                "completed_personas": outcome.completed_count,
                "total_personas": total_personas,
                "incremental": outcome.incremental,
            }))?;
        }
        Ok(outcome)
    }

    /// Remove sessions older than `max_age_s`. Returns how many went.
    pub fn cleanup_expired_sessions_at(&mut self, max_age_s: f64, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            (now - session.created_at).num_milliseconds() as f64 / 1000.0 <= max_age_s
        });
        before - self.sessions.len()
    }

    /// [`Self::cleanup_expired_sessions_at`] against the current wall clock.
    pub fn cleanup_expired_sessions(&mut self, max_age_s: f64) -> usize {
        self.cleanup_expired_sessions_at(max_age_s, Utc::now())
    }

    /// Fold a reconciliation outcome into the adaptive performance ledger.
    pub fn record_strategy_performance_at(
        &mut self,
        strategy: &str,
        success: bool,
        latency_ms: f64,
        cost_usd: f64,
        quality_score: f64,
        now: DateTime<Utc>,
    ) {
        self.switcher
            .update_performance_at(strategy, success, latency_ms, cost_usd, quality_score, now);
    }

    fn audit_event(&mut self, event: serde_json::Value) -> Result<(), WeftError> {
        if let Some(audit) = &mut self.audit {
            audit.append_event(event)?;
        }
        Ok(())
    }

    /// Drive a session through DISPATCHED into STREAMING.
    ///
    /// # Errors
    /// Propagates illegal-transition failures.
    pub fn begin_streaming_at(
        &mut self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WeftError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| WeftError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.state() == SessionState::Init {
            session.transition_to_at(SessionState::Dispatched, now)?;
        }
        session.transition_to_at(SessionState::Streaming, now)
    }
}
