//! Parallel session state machine and out-of-order stream buffering.
//!
//! A session owns one ordered buffer per persona clone. Stream frames are
//! inserted in sequence order; after every insert a gap-fill scan bounds
//! head-of-line blocking by synthesizing empty entries for sequences that
//! have been missing longer than the buffer timeout.

pub mod adaptive;
pub mod manager;
pub mod strategy;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::{PersonaStats, QosTier, ReconcileOutcome, ReconciliationPolicy, SessionConfig, WeftError};

use adaptive::SwitchingContext;
use strategy::{Arbiter, Strategy};

/// Lifecycle states of a parallel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Persona set allocated, nothing dispatched yet.
    Init,
    /// Dispatch frames sent to the workers.
    Dispatched,
    /// Workers are emitting token streams.
    Streaming,
    /// All streams ended; the fabric is aggregating outputs.
    Buffering,
    /// A reconciliation policy is being applied.
    Reconciling,
    /// Merged result produced. Terminal.
    Complete,
}

impl SessionState {
    /// States a session may legally move to from `self`.
    #[must_use]
    pub const fn legal_targets(self) -> &'static [Self] {
        match self {
            Self::Init => &[Self::Dispatched],
            Self::Dispatched => &[Self::Streaming],
            Self::Streaming => &[Self::Buffering, Self::Reconciling],
            Self::Buffering => &[Self::Reconciling],
            Self::Reconciling => &[Self::Complete],
            Self::Complete => &[],
        }
    }

    /// Lowercase name used in errors and audit events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Dispatched => "dispatched",
            Self::Streaming => "streaming",
            Self::Buffering => "buffering",
            Self::Reconciling => "reconciling",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persona clone participating in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaSlot {
    /// Persona the clone specializes.
    pub persona_id: String,
    /// Clone id; absent only for legacy single-clone callers.
    pub clone_id: Option<u64>,
    /// Whether the clone's stream has ended.
    pub completed: bool,
    /// When the clone completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Stats reported in the clone's END frame.
    pub stats: PersonaStats,
}

impl PersonaSlot {
    /// A fresh, incomplete slot.
    #[must_use]
    pub fn new(persona_id: impl Into<String>, clone_id: Option<u64>) -> Self {
        Self {
            persona_id: persona_id.into(),
            clone_id,
            completed: false,
            completed_at: None,
            stats: PersonaStats::default(),
        }
    }

    /// Buffer key for this slot.
    #[must_use]
    pub fn buffer_key(&self) -> String {
        match self.clone_id {
            Some(clone) => format!("{}-{clone}", self.persona_id),
            None => self.persona_id.clone(),
        }
    }
}

/// One buffered stream chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    /// 1-based sequence number.
    pub seq: u64,
    /// Chunk payload; empty for synthesized gap fillers.
    pub data: String,
    /// When the entry was buffered (or synthesized).
    pub received_at: DateTime<Utc>,
    /// Whether this entry was synthesized to fill a timed-out gap.
    pub gap_filled: bool,
}

/// Aggregate view of one clone's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BufferStats {
    /// Entries buffered, gap fillers included.
    pub total_entries: usize,
    /// Total payload bytes buffered.
    pub total_tokens: usize,
    /// Synthesized gap fillers.
    pub gaps: usize,
    /// Age of the oldest entry, seconds.
    pub oldest_age_s: f64,
}

/// A parallel session: the owning entity for its buffers and persona slots.
pub struct ParallelSession {
    /// Caller-assigned identifier.
    pub session_id: String,
    /// Buffering/reconciliation parameters.
    pub config: SessionConfig,
    state: SessionState,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last state-machine or buffer activity.
    pub updated_at: DateTime<Utc>,
    /// Participating clones, in dispatch order.
    pub personas: Vec<PersonaSlot>,
    buffers: HashMap<String, Vec<BufferEntry>>,
    /// Policy applied at reconciliation time.
    pub reconciliation_policy: ReconciliationPolicy,
    /// Ceiling on arbiter spend for this session.
    pub arbiter_max_usd: f64,
    /// Cumulative arbiter spend.
    pub arbiter_budget_used: f64,
    /// Whether adaptive policy switching may override the configured policy.
    pub adaptive_enabled: bool,
    /// Head-of-line waits observed when gaps were filled, milliseconds.
    /// Drained by the session manager into its histogram.
    pub gap_waits_ms: Vec<f64>,
}

impl ParallelSession {
    /// Create a session in INIT with the given persona slots.
    #[must_use]
    pub fn new_at(
        session_id: impl Into<String>,
        config: SessionConfig,
        personas: Vec<PersonaSlot>,
        reconciliation_policy: ReconciliationPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let arbiter_max_usd = match &reconciliation_policy {
            ReconciliationPolicy::Arbiter { max_usd_budget } => *max_usd_budget,
            _ => 0.10,
        };
        let mut buffers = HashMap::new();
        for slot in &personas {
            buffers.insert(slot.buffer_key(), Vec::new());
        }
        Self {
            session_id: session_id.into(),
            config,
            state: SessionState::Init,
            created_at: now,
            updated_at: now,
            personas,
            buffers,
            reconciliation_policy,
            arbiter_max_usd,
            arbiter_budget_used: 0.0,
            adaptive_enabled: false,
            gap_waits_ms: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `new_state`, enforcing the legal transition graph.
    ///
    /// # Errors
    /// Returns `WeftError::InvalidTransition` and leaves the state
    /// unchanged when the edge is not legal.
    pub fn transition_to_at(
        &mut self,
        new_state: SessionState,
        now: DateTime<Utc>,
    ) -> Result<(), WeftError> {
        if !self.state.legal_targets().contains(&new_state) {
            return Err(WeftError::InvalidTransition {
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }
        tracing::debug!(
            session = %self.session_id,
            from = %self.state,
            to = %new_state,
            "session transition"
        );
        self.state = new_state;
        self.updated_at = now;
        Ok(())
    }

    /// [`Self::transition_to_at`] against the current wall clock.
    ///
    /// # Errors
    /// See [`Self::transition_to_at`].
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<(), WeftError> {
        self.transition_to_at(new_state, Utc::now())
    }

    /// Add a persona slot. Legal only in INIT.
    ///
    /// # Errors
    /// Returns `WeftError::WrongState` outside INIT.
    pub fn add_persona(&mut self, slot: PersonaSlot) -> Result<(), WeftError> {
        if self.state != SessionState::Init {
            return Err(WeftError::WrongState {
                expected: SessionState::Init.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.buffers.entry(slot.buffer_key()).or_default();
        self.personas.push(slot);
        Ok(())
    }

    /// Resolve the buffer key for an incoming frame.
    ///
    /// When the frame names a clone the key is `persona-clone`. Without a
    /// clone id, a single matching slot that has one is used (legacy
    /// single-clone callers); otherwise the bare persona id.
    fn resolve_buffer_key(&self, persona_id: &str, clone_id: Option<u64>) -> String {
        if let Some(clone) = clone_id {
            return format!("{persona_id}-{clone}");
        }
        let matching: Vec<&PersonaSlot> = self
            .personas
            .iter()
            .filter(|slot| slot.persona_id == persona_id)
            .collect();
        match matching.as_slice() {
            [only] if only.clone_id.is_some() => only.buffer_key(),
            _ => persona_id.to_string(),
        }
    }

    /// Buffer one streamed chunk with out-of-order handling.
    ///
    /// Legal only while STREAMING or BUFFERING. The buffer limit is
    /// `max_buffer_tokens` scaled by the QoS multiplier; an insert that
    /// would push the buffer strictly past the limit fails loudly and the
    /// session is left for upper layers to decide about.
    ///
    /// # Errors
    /// `WeftError::WrongState` outside STREAMING/BUFFERING;
    /// `WeftError::BufferOverflow` when the limit would be exceeded.
    pub fn buffer_stream_data_at(
        &mut self,
        persona_id: &str,
        seq: u64,
        data: &str,
        qos: QosTier,
        clone_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<(), WeftError> {
        if !matches!(self.state, SessionState::Streaming | SessionState::Buffering) {
            return Err(WeftError::WrongState {
                expected: "streaming|buffering".to_string(),
                actual: self.state.to_string(),
            });
        }

        let key = self.resolve_buffer_key(persona_id, clone_id);
        let limit = self.config.buffer_limit(qos);
        let buffer = self.buffers.entry(key.clone()).or_default();

        let current: usize = buffer.iter().map(|entry| entry.data.len()).sum();
        if current + data.len() > limit {
            return Err(WeftError::BufferOverflow { key, limit });
        }

        let entry = BufferEntry {
            seq,
            data: data.to_string(),
            received_at: now,
            gap_filled: false,
        };
        let insert_idx = buffer.partition_point(|existing| existing.seq <= seq);
        buffer.insert(insert_idx, entry);

        self.fill_sequence_gaps(&key, now);
        self.updated_at = now;
        Ok(())
    }

    /// [`Self::buffer_stream_data_at`] against the current wall clock.
    ///
    /// # Errors
    /// See [`Self::buffer_stream_data_at`].
    pub fn buffer_stream_data(
        &mut self,
        persona_id: &str,
        seq: u64,
        data: &str,
        qos: QosTier,
        clone_id: Option<u64>,
    ) -> Result<(), WeftError> {
        self.buffer_stream_data_at(persona_id, seq, data, qos, clone_id, now_utc())
    }

    /// Synthesize empty entries for sequences that have been missing longer
    /// than the buffer timeout, starting from seq 1 and advancing through
    /// consecutive present sequences. Each fill re-scans so consecutive
    /// timed-out gaps collapse in one pass.
    fn fill_sequence_gaps(&mut self, key: &str, now: DateTime<Utc>) {
        let timeout_s = self.config.buffer_timeout_s;
        let Some(buffer) = self.buffers.get_mut(key) else {
            return;
        };
        if buffer.is_empty() {
            return;
        }

        let mut expected: u64 = 1;
        let mut i = 0;
        while i < buffer.len() {
            let seq = buffer[i].seq;
            if seq == expected {
                expected += 1;
                i += 1;
            } else if seq > expected {
                // Gap ahead of entry i. Fill only once the blocking entry
                // has aged past the timeout.
                let age_s = (now - buffer[i].received_at).num_milliseconds() as f64 / 1000.0;
                if age_s > timeout_s {
                    self.gap_waits_ms.push(age_s * 1000.0);
                    buffer.insert(
                        i,
                        BufferEntry {
                            seq: expected,
                            data: String::new(),
                            received_at: now,
                            gap_filled: true,
                        },
                    );
                    expected += 1;
                    i += 1;
                } else {
                    break;
                }
            } else {
                // Duplicate or replay; tolerated, does not advance expected.
                i += 1;
            }
        }
    }

    /// Buffered entries for a clone in sequence order, after a final
    /// gap-fill pass.
    pub fn ordered_buffer_data_at(&mut self, key: &str, now: DateTime<Utc>) -> Vec<BufferEntry> {
        self.fill_sequence_gaps(key, now);
        self.buffers.get(key).cloned().unwrap_or_default()
    }

    /// Read-only view of a clone's buffer.
    #[must_use]
    pub fn buffer(&self, key: &str) -> &[BufferEntry] {
        self.buffers.get(key).map_or(&[], Vec::as_slice)
    }

    /// Total payload bytes buffered across every clone.
    #[must_use]
    pub fn total_buffered_bytes(&self) -> usize {
        self.buffers
            .values()
            .flat_map(|buffer| buffer.iter())
            .map(|entry| entry.data.len())
            .sum()
    }

    /// Aggregate stats for one clone's buffer.
    #[must_use]
    pub fn buffer_stats_at(&self, key: &str, now: DateTime<Utc>) -> BufferStats {
        let Some(buffer) = self.buffers.get(key) else {
            return BufferStats::default();
        };
        BufferStats {
            total_entries: buffer.len(),
            total_tokens: buffer.iter().map(|entry| entry.data.len()).sum(),
            gaps: buffer.iter().filter(|entry| entry.gap_filled).count(),
            oldest_age_s: buffer
                .iter()
                .map(|entry| (now - entry.received_at).num_milliseconds() as f64 / 1000.0)
                .fold(0.0, f64::max),
        }
    }

    /// Mark the matching persona slot complete.
    ///
    /// With a clone id the slot must match both fields; without one, the
    /// first slot for the persona matches (legacy callers). When every slot
    /// is complete and the session is STREAMING it auto-transitions to
    /// BUFFERING.
    pub fn mark_persona_complete_at(
        &mut self,
        persona_id: &str,
        stats: PersonaStats,
        clone_id: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let slot = self.personas.iter_mut().find(|slot| match clone_id {
            Some(clone) => slot.persona_id == persona_id && slot.clone_id == Some(clone),
            None => slot.persona_id == persona_id,
        });
        if let Some(slot) = slot {
            slot.completed = true;
            slot.completed_at = Some(now);
            slot.stats = stats;
        }

        let all_complete = self.personas.iter().all(|slot| slot.completed);
        if all_complete && self.state == SessionState::Streaming {
            // Transition is legal by construction.
            let _ = self.transition_to_at(SessionState::Buffering, now);
        }
    }

    /// [`Self::mark_persona_complete_at`] against the current wall clock.
    pub fn mark_persona_complete(
        &mut self,
        persona_id: &str,
        stats: PersonaStats,
        clone_id: Option<u64>,
    ) {
        self.mark_persona_complete_at(persona_id, stats, clone_id, now_utc());
    }

    /// Completed persona slots, cloned.
    #[must_use]
    pub fn completed_personas(&self) -> Vec<PersonaSlot> {
        self.personas
            .iter()
            .filter(|slot| slot.completed)
            .cloned()
            .collect()
    }

    /// Apply the session's reconciliation policy.
    ///
    /// Legal only in RECONCILING. The strategy's preconditions are checked
    /// first; arbiter spend is charged against the session budget.
    ///
    /// # Errors
    /// `WeftError::WrongState` outside RECONCILING;
    /// `WeftError::CannotReconcile` when preconditions fail.
    pub fn reconcile_results_at(
        &mut self,
        arbiter: &dyn Arbiter,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, WeftError> {
        if self.state != SessionState::Reconciling {
            return Err(WeftError::WrongState {
                expected: SessionState::Reconciling.to_string(),
                actual: self.state.to_string(),
            });
        }
        let strategy = Strategy::from_policy(self.reconciliation_policy.clone());
        if !strategy.can_reconcile(self) {
            return Err(WeftError::CannotReconcile {
                strategy: strategy.name().to_string(),
                reason: "preconditions not met".to_string(),
            });
        }
        strategy.reconcile(self, arbiter, now)
    }

    /// Whether the configured strategy can produce a partial result now.
    #[must_use]
    pub fn can_streaming_reconcile(&self) -> bool {
        Strategy::from_policy(self.reconciliation_policy.clone()).can_incremental_reconcile(self)
    }

    /// Produce a partial (incremental) result from completed personas, if
    /// the strategy allows one.
    ///
    /// # Errors
    /// Propagates strategy failures; returns `Ok(None)` when incremental
    /// reconciliation is simply not possible yet.
    pub fn streaming_reconcile_at(
        &mut self,
        arbiter: &dyn Arbiter,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileOutcome>, WeftError> {
        let strategy = Strategy::from_policy(self.reconciliation_policy.clone());
        if !strategy.can_incremental_reconcile(self) {
            return Ok(None);
        }
        let completed = self.completed_personas();
        if completed.is_empty() {
            return Ok(None);
        }
        strategy
            .incremental_reconcile(self, &completed, arbiter, now)
            .map(Some)
    }

    /// Whether buffered data has crossed the strategy's flush threshold.
    #[must_use]
    pub fn should_flush_streaming(&self) -> bool {
        Strategy::from_policy(self.reconciliation_policy.clone()).should_flush_partial(self)
    }

    /// Estimate the switching context for adaptive policy selection.
    #[must_use]
    pub fn switching_context(&self) -> SwitchingContext {
        SwitchingContext {
            request_complexity: self.estimate_request_complexity(),
            time_pressure: self.config.reconciliation_timeout_s < 10.0,
            cost_sensitivity: self.estimate_cost_sensitivity(),
            quality_requirement: self.estimate_quality_requirement(),
            persona_count: self.personas.len(),
            convergence_history: Vec::new(),
        }
    }

    /// More personas means more coordination: scale toward 1.0 at five.
    fn estimate_request_complexity(&self) -> f64 {
        (self.personas.len() as f64 / 5.0).min(1.0)
    }

    /// Lower arbiter budget means higher cost sensitivity.
    fn estimate_cost_sensitivity(&self) -> f64 {
        if self.arbiter_max_usd < 0.05 {
            0.9
        } else if self.arbiter_max_usd < 0.10 {
            0.6
        } else {
            0.3
        }
    }

    /// Specialized personas raise the quality requirement.
    fn estimate_quality_requirement(&self) -> f64 {
        if self.personas.is_empty() {
            return 0.0;
        }
        let specialized = self
            .personas
            .iter()
            .filter(|slot| {
                slot.persona_id.contains("reasoning")
                    || slot.persona_id.contains("analysis")
                    || slot.persona_id.contains("expert")
            })
            .count();
        (specialized as f64 / self.personas.len() as f64).min(1.0)
    }
}

pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
