//! Reconciliation strategies as a tagged sum with two capability sets:
//! full reconciliation and incremental (streaming) reconciliation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use weft_core::{PersonaStats, ReconcileOutcome, ReconciliationPolicy, WeftError};

use super::{ParallelSession, PersonaSlot};

/// Length delta between any two outputs beyond which they are considered
/// divergent. A placeholder for semantic similarity.
const DIVERGENCE_LENGTH_DELTA: usize = 100;

/// One persona's fully assembled output, as presented to the arbiter.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaResult {
    /// Persona that produced the output.
    pub persona_id: String,
    /// Clone that produced the output.
    pub clone_id: Option<u64>,
    /// Ordered, concatenated output.
    pub result: String,
    /// Stats from the clone's END frame.
    pub stats: PersonaStats,
}

/// Decision returned by an external arbiter.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterDecision {
    /// The adjudicated output.
    pub reconciled_result: String,
    /// The arbiter's stated reasoning.
    pub reasoning: String,
    /// What the adjudication cost.
    pub cost_usd: f64,
    /// The arbiter's confidence in `[0, 1]`.
    pub confidence: f64,
}

/// External tie-breaker consulted when persona outputs diverge.
///
/// Real deployments back this with an LLM call; the stub picks the first
/// result so the control flow stays testable offline.
pub trait Arbiter: Send + Sync {
    /// Adjudicate between divergent results.
    fn adjudicate(&self, results: &[PersonaResult]) -> ArbiterDecision;
}

/// Arbiter stand-in: picks the first result and charges a flat rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubArbiter;

impl Arbiter for StubArbiter {
    fn adjudicate(&self, results: &[PersonaResult]) -> ArbiterDecision {
        ArbiterDecision {
            reconciled_result: results.first().map(|r| r.result.clone()).unwrap_or_default(),
            reasoning: "stub arbiter: first result".to_string(),
            cost_usd: 0.05,
            confidence: 0.8,
        }
    }
}

/// A reconciliation strategy with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Earliest completed persona wins.
    FirstWin,
    /// Completion quorum required, then first-win semantics.
    Consensus {
        /// Fraction of personas that must complete.
        majority_threshold: f64,
    },
    /// Concatenate all completed outputs with weight tags.
    WeightedMerge {
        /// Per-persona weights; unknown personas weigh 1.0.
        weights: HashMap<String, f64>,
    },
    /// Arbiter-adjudicated merge within a dollar budget.
    Arbiter {
        /// Ceiling on arbiter spend.
        max_usd_budget: f64,
    },
}

impl Strategy {
    /// Instantiate from a policy value.
    #[must_use]
    pub fn from_policy(policy: ReconciliationPolicy) -> Self {
        match policy {
            ReconciliationPolicy::FirstWin => Self::FirstWin,
            ReconciliationPolicy::Consensus { majority_threshold } => Self::Consensus {
                majority_threshold,
            },
            ReconciliationPolicy::WeightedMerge { weights } => Self::WeightedMerge { weights },
            ReconciliationPolicy::Arbiter { max_usd_budget } => Self::Arbiter { max_usd_budget },
            _ => unreachable!("ReconciliationPolicy variant not handled by Strategy::from_policy"),
        }
    }

    /// Kebab-case name used in outcomes and audit events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FirstWin => "first-win",
            Self::Consensus { .. } => "consensus",
            Self::WeightedMerge { .. } => "weighted-merge",
            Self::Arbiter { .. } => "arbiter",
        }
    }

    /// Whether full reconciliation may proceed.
    #[must_use]
    pub fn can_reconcile(&self, session: &ParallelSession) -> bool {
        let completed = session.personas.iter().filter(|p| p.completed).count();
        match self {
            Self::FirstWin | Self::WeightedMerge { .. } => completed >= 1,
            Self::Consensus { majority_threshold } => {
                !session.personas.is_empty()
                    && completed as f64 / session.personas.len() as f64 >= *majority_threshold
            }
            Self::Arbiter { max_usd_budget } => {
                completed == session.personas.len()
                    && !session.personas.is_empty()
                    && session.arbiter_budget_used < *max_usd_budget
            }
        }
    }

    /// Whether an incremental (partial) result may be produced.
    #[must_use]
    pub fn can_incremental_reconcile(&self, session: &ParallelSession) -> bool {
        match self {
            Self::Arbiter { max_usd_budget } => session.arbiter_budget_used < *max_usd_budget,
            _ => self.can_reconcile(session),
        }
    }

    /// Whether buffered data has crossed the flush threshold.
    #[must_use]
    pub fn should_flush_partial(&self, session: &ParallelSession) -> bool {
        let buffered = session.total_buffered_bytes() as f64;
        let base = session.config.max_buffer_tokens as f64;
        match self {
            Self::FirstWin => buffered > base * 0.8,
            Self::Consensus { .. } => self.can_reconcile(session) && buffered > base * 0.6,
            Self::WeightedMerge { .. } => buffered > base * 0.7,
            Self::Arbiter { max_usd_budget } => {
                session.arbiter_budget_used > max_usd_budget * 0.8
            }
        }
    }

    /// Apply the strategy to a session.
    ///
    /// # Errors
    /// `WeftError::CannotReconcile` when no persona has completed.
    pub fn reconcile(
        &self,
        session: &mut ParallelSession,
        arbiter: &dyn Arbiter,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, WeftError> {
        match self {
            Self::FirstWin => first_win(session, self.name(), now),
            // Quorum was already checked; the synthesized output currently
            // delegates to first-win semantics.
            Self::Consensus { .. } => first_win(session, self.name(), now),
            Self::WeightedMerge { weights } => weighted_merge(session, weights, now),
            Self::Arbiter { max_usd_budget } => {
                arbiter_reconcile(session, *max_usd_budget, arbiter, now)
            }
        }
    }

    /// Produce a partial result from the personas completed so far.
    ///
    /// # Errors
    /// `WeftError::CannotReconcile` when `completed` is empty.
    pub fn incremental_reconcile(
        &self,
        session: &mut ParallelSession,
        completed: &[PersonaSlot],
        _arbiter: &dyn Arbiter,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, WeftError> {
        if completed.is_empty() {
            return Err(WeftError::CannotReconcile {
                strategy: self.name().to_string(),
                reason: "no personas completed".to_string(),
            });
        }
        match self {
            Self::FirstWin | Self::Consensus { .. } => {
                let mut outcome = first_win(session, self.name(), now)?;
                outcome.incremental = true;
                Ok(outcome)
            }
            Self::WeightedMerge { weights } => {
                // Incremental weighted merge emits only the weight tags; the
                // full path carries the data.
                let mut total_weight = 0.0;
                let parts: Vec<String> = completed
                    .iter()
                    .map(|slot| {
                        let weight = weights.get(&slot.persona_id).copied().unwrap_or(1.0);
                        total_weight += weight;
                        format!("[{}:{}]", slot.persona_id, fmt_weight(weight))
                    })
                    .collect();
                Ok(ReconcileOutcome {
                    result: parts.join(" "),
                    policy: self.name().to_string(),
                    incremental: true,
                    total_weight: Some(total_weight),
                    completed_count: Some(completed.len()),
                    total_personas: Some(session.personas.len()),
                    ..ReconcileOutcome::default()
                })
            }
            Self::Arbiter { .. } => {
                let mut outcome = first_win(session, self.name(), now)?;
                outcome.incremental = true;
                outcome.arbiter_used = Some(false);
                Ok(outcome)
            }
        }
    }
}

/// Assemble one persona's ordered output.
fn persona_result(
    session: &mut ParallelSession,
    slot: &PersonaSlot,
    now: DateTime<Utc>,
) -> String {
    session
        .ordered_buffer_data_at(&slot.buffer_key(), now)
        .into_iter()
        .map(|entry| entry.data)
        .collect()
}

fn earliest_completed(session: &ParallelSession) -> Result<PersonaSlot, WeftError> {
    session
        .personas
        .iter()
        .filter(|slot| slot.completed)
        .min_by_key(|slot| slot.completed_at)
        .cloned()
        .ok_or_else(|| WeftError::CannotReconcile {
            strategy: "first-win".to_string(),
            reason: "no personas completed".to_string(),
        })
}

fn first_win(
    session: &mut ParallelSession,
    policy_name: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, WeftError> {
    let winner = earliest_completed(session)?;
    let result = persona_result(session, &winner, now);
    Ok(ReconcileOutcome {
        result,
        policy: policy_name.to_string(),
        winning_persona: Some(winner.persona_id),
        winning_clone_id: winner.clone_id,
        ..ReconcileOutcome::default()
    })
}

fn weighted_merge(
    session: &mut ParallelSession,
    weights: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, WeftError> {
    let completed = session.completed_personas();
    if completed.is_empty() {
        return Err(WeftError::CannotReconcile {
            strategy: "weighted-merge".to_string(),
            reason: "no personas completed".to_string(),
        });
    }
    let mut total_weight = 0.0;
    let mut parts = Vec::with_capacity(completed.len());
    for slot in &completed {
        let output = persona_result(session, slot, now);
        let weight = weights.get(&slot.persona_id).copied().unwrap_or(1.0);
        total_weight += weight;
        parts.push(format!(
            "{output} [{}:{}]",
            slot.persona_id,
            fmt_weight(weight)
        ));
    }
    Ok(ReconcileOutcome {
        result: parts.join(" "),
        policy: "weighted-merge".to_string(),
        total_weight: Some(total_weight),
        ..ReconcileOutcome::default()
    })
}

fn arbiter_reconcile(
    session: &mut ParallelSession,
    max_usd_budget: f64,
    arbiter: &dyn Arbiter,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, WeftError> {
    let completed = session.completed_personas();
    if completed.is_empty() {
        return Err(WeftError::CannotReconcile {
            strategy: "arbiter".to_string(),
            reason: "no personas completed".to_string(),
        });
    }

    let results: Vec<PersonaResult> = completed
        .iter()
        .map(|slot| PersonaResult {
            persona_id: slot.persona_id.clone(),
            clone_id: slot.clone_id,
            result: persona_result(session, slot, now),
            stats: slot.stats.clone(),
        })
        .collect();

    if !results_are_divergent(&results) {
        // Similar enough: the cheapest strategy's answer is as good.
        let mut outcome = first_win(session, "arbiter", now)?;
        outcome.arbiter_used = Some(false);
        outcome.results_converged = true;
        return Ok(outcome);
    }

    if session.arbiter_budget_used >= max_usd_budget {
        tracing::warn!(
            session = %session.session_id,
            spent = session.arbiter_budget_used,
            budget = max_usd_budget,
            "arbiter budget exceeded; falling back to first-win"
        );
        let mut outcome = first_win(session, "arbiter", now)?;
        outcome.arbiter_used = Some(false);
        outcome.budget_exceeded = true;
        return Ok(outcome);
    }

    let decision = arbiter.adjudicate(&results);
    session.arbiter_budget_used += decision.cost_usd;
    Ok(ReconcileOutcome {
        result: decision.reconciled_result,
        policy: "arbiter".to_string(),
        arbiter_used: Some(true),
        arbiter_reasoning: Some(decision.reasoning),
        budget_used: Some(session.arbiter_budget_used),
        ..ReconcileOutcome::default()
    })
}

/// Divergence check between persona outputs.
///
/// TODO(semantic-similarity): replace the length-delta heuristic with an
/// embedding comparison once the similarity service is wired up.
fn results_are_divergent(results: &[PersonaResult]) -> bool {
    let Some(first) = results.first() else {
        return false;
    };
    results.iter().skip(1).any(|other| {
        first.result.len().abs_diff(other.result.len()) > DIVERGENCE_LENGTH_DELTA
    })
}

/// Format a weight the way it appears in merge tags: integral weights keep
/// one decimal (`2.0`), fractional weights print naturally.
fn fmt_weight(weight: f64) -> String {
    if weight.fract() == 0.0 {
        format!("{weight:.1}")
    } else {
        format!("{weight}")
    }
}
