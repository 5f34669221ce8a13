use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the weft workspace.
///
/// This wraps attribute validation failures, policy rejections, session
/// state-machine violations, scheduler backpressure, and the aggregate
/// conditions surfaced by the federation engine.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[non_exhaustive]
pub enum WeftError {
    /// A route attribute or message failed structural validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Route rejected by QoS policy (best supported tier below silver).
    #[error("qos below policy floor: best supported tier is {tier}")]
    QosBelowFloor {
        /// The best tier the rejected route supported.
        tier: String,
    },

    /// Route carried a `no-export` community and was refused.
    #[error("no-export routes not accepted")]
    NoExport,

    /// Accepting the route would create a forwarding loop.
    #[error("loop detected via {via}")]
    LoopDetected {
        /// What matched: the originator id or the offending cluster id.
        via: String,
    },

    /// Route attestation failed (ROA coverage, ASN, chain, signature or revocation).
    #[error("attestation rejected: {reason}")]
    AttestationRejected {
        /// Which attestation check failed.
        reason: String,
    },

    /// Peer speaks an incompatible protocol major version.
    #[error("incompatible agp version: ours={ours} peer={peer}")]
    VersionIncompatible {
        /// Our advertised version.
        ours: String,
        /// The peer's advertised version.
        peer: String,
    },

    /// Session buffer would exceed its QoS-scaled limit.
    #[error("buffer overflow for {key}: limit={limit}")]
    BufferOverflow {
        /// Buffer key (`persona_id-clone_id`).
        key: String,
        /// Effective byte limit after the QoS multiplier.
        limit: usize,
    },

    /// Illegal session state transition; the session state is unchanged.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: String,
        /// State the caller requested.
        to: String,
    },

    /// A session-level operation was attempted in the wrong state.
    #[error("operation requires state {expected}, session is {actual}")]
    WrongState {
        /// State(s) the operation is legal in.
        expected: String,
        /// Current session state.
        actual: String,
    },

    /// Reconciliation preconditions not met for the selected strategy.
    #[error("cannot reconcile with strategy {strategy}: {reason}")]
    CannotReconcile {
        /// Strategy name.
        strategy: String,
        /// Why the preconditions failed.
        reason: String,
    },

    /// Arbiter spend would exceed the per-session budget.
    #[error("arbiter budget exceeded: spent={spent_usd} budget={budget_usd}")]
    BudgetExceeded {
        /// USD already charged against the budget.
        spent_usd: f64,
        /// Configured ceiling.
        budget_usd: f64,
    },

    /// Scheduler admission denied; callers map this to a 429-class response.
    #[error("backpressure: no slot for session {session}")]
    Backpressure {
        /// Session that was refused.
        session: String,
    },

    /// The stream was cancelled (client disconnect or SLO hard cap).
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the stream terminated early.
        reason: String,
    },

    /// Unknown session id.
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The id that failed lookup.
        session_id: String,
    },

    /// Unknown reconciliation policy name.
    #[error("unknown reconciliation policy: {name}")]
    UnknownPolicy {
        /// The unrecognized policy string.
        name: String,
    },

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),

    /// Snapshot serialization, persistence or restore failure.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// An individual persona worker failed.
    #[error("{worker} failed: {msg}")]
    Worker {
        /// Worker (persona) name that failed.
        worker: String,
        /// Human-readable failure message.
        msg: String,
    },

    /// Unknown/opaque error.
    #[error("unknown error: {0}")]
    Other(String),
}

impl WeftError {
    /// Helper: build a `Validation` error from any message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Helper: build a `Config` error from any message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Helper: build a `Snapshot` error from any message.
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Helper: build a `Worker` error with the worker name and message.
    pub fn worker(worker: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Worker {
            worker: worker.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build an `AttestationRejected` error with the failing check.
    pub fn attestation(reason: impl Into<String>) -> Self {
        Self::AttestationRejected {
            reason: reason.into(),
        }
    }

    /// Returns true when the error represents a policy rejection rather than
    /// a malformed message. Policy rejections feed typed counters; parse
    /// errors feed the generic error counter.
    #[must_use]
    pub const fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Self::QosBelowFloor { .. } | Self::NoExport | Self::LoopDetected { .. }
        )
    }
}

impl From<serde_json::Error> for WeftError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
