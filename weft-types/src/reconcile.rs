//! Reconciliation policy identifiers and the merged-result shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::WeftError;

/// Policy used to merge persona outputs into one response.
///
/// Each variant carries its own parameters; the session layer turns these
/// into concrete strategies with full and incremental capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReconciliationPolicy {
    /// Earliest completed persona wins outright.
    FirstWin,
    /// A completion quorum is required before any output is produced.
    Consensus {
        /// Fraction of personas that must complete, `(0, 1]`.
        #[serde(default = "ReconciliationPolicy::default_majority")]
        majority_threshold: f64,
    },
    /// Concatenate every completed persona's output, tagged with weights.
    WeightedMerge {
        /// Per-persona weights; unknown personas default to 1.0.
        #[serde(default)]
        weights: HashMap<String, f64>,
    },
    /// Divergent outputs are adjudicated by an external arbiter within a
    /// dollar budget; convergent or over-budget cases fall back to first-win.
    Arbiter {
        /// Ceiling on arbiter spend for the session.
        #[serde(default = "ReconciliationPolicy::default_budget")]
        max_usd_budget: f64,
    },
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self::FirstWin
    }
}

impl ReconciliationPolicy {
    const fn default_majority() -> f64 {
        0.5
    }

    const fn default_budget() -> f64 {
        0.10
    }

    /// Canonical kebab-case policy name used in results and audit events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FirstWin => "first-win",
            Self::Consensus { .. } => "consensus",
            Self::WeightedMerge { .. } => "weighted-merge",
            Self::Arbiter { .. } => "arbiter",
        }
    }

    /// Parse a bare policy name into a policy with default parameters.
    ///
    /// # Errors
    /// Returns `WeftError::UnknownPolicy` for unrecognized names.
    pub fn from_name(name: &str) -> Result<Self, WeftError> {
        match name {
            "first-win" => Ok(Self::FirstWin),
            "consensus" => Ok(Self::Consensus {
                majority_threshold: Self::default_majority(),
            }),
            "weighted-merge" => Ok(Self::WeightedMerge {
                weights: HashMap::new(),
            }),
            "arbiter" => Ok(Self::Arbiter {
                max_usd_budget: Self::default_budget(),
            }),
            other => Err(WeftError::UnknownPolicy {
                name: other.to_string(),
            }),
        }
    }
}

/// Result of applying a reconciliation policy to a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// The merged output text.
    pub result: String,
    /// Name of the policy that produced the result.
    pub policy: String,
    /// Winning persona, for single-winner policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_persona: Option<String>,
    /// Winning clone, for single-winner policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_clone_id: Option<u64>,
    /// Set on partial results produced by incremental reconciliation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incremental: bool,
    /// Sum of contributing weights, for weighted-merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<f64>,
    /// Personas contributing to an incremental result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_count: Option<usize>,
    /// Persona population of the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_personas: Option<usize>,
    /// Whether the external arbiter was actually consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter_used: Option<bool>,
    /// The arbiter's stated reasoning, when consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter_reasoning: Option<String>,
    /// Cumulative arbiter spend for the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_used: Option<f64>,
    /// Set when divergence was detected but the budget was exhausted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub budget_exceeded: bool,
    /// Set when persona outputs were similar enough to skip the arbiter.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub results_converged: bool,
}
