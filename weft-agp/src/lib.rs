//! weft-agp
//!
//! The AGP federation engine: peers exchange reachability and health for
//! model-endpoint prefixes so dispatch decisions stay locally optimal under
//! partial failure.
//!
//! - `dampening`: flap penalty accounting with exponential decay, plus
//!   hold-down/grace timers keyed by health transitions.
//! - `hysteresis`: EWMA smoothing and change-threshold gating of advertised
//!   health metrics.
//! - `table`: keyed route storage, weighted best-path scoring, ECMP with
//!   deterministic per-session member selection.
//! - `snapshot`: point-in-time serialization, diffing, and the safe-mode
//!   fallback from the last-known-good snapshot.
//! - `update`: OPEN negotiation and the UPDATE admission pipeline
//!   (validation, loop prevention, attestation).
//! - `attestation`: ROA/chain/revocation checks with a TTL revocation cache.
//!
//! Key behaviors and trade-offs
//! - Ingestion never blocks on dampening; suppression applies at selection
//!   time only, so operators can still inspect what peers advertise.
//! - Accessors report decayed dampening state without mutating it; stored
//!   penalties are brought forward at the next recorded event.
//! - Timer methods take an explicit `now` (`*_at` variants) so tests inject
//!   the clock; wall-clock wrappers delegate to them.
#![warn(missing_docs)]

pub mod attestation;
pub mod dampening;
pub mod hysteresis;
pub mod snapshot;
pub mod stats;
pub mod table;
pub mod update;

pub use attestation::{AttestationValidator, RevocationChecker};
pub use dampening::{DampeningInfo, DampeningTracker, HoldDownInfo};
pub use hysteresis::{EwmaSmoother, HealthMetricsProcessor};
pub use snapshot::{SnapshotDiff, TableSnapshot, load_policy_or_safe_mode};
pub use stats::{
    HandlerCounters, HandlerCountersSnapshot, TableCounters, TableCountersSnapshot,
};
pub use table::{BackpressureSignal, RouteTable, TableStats};
pub use update::{OpenOutcome, UpdateHandler, UpdateOutcome};
