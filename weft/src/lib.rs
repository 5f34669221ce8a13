//! Weft brokers streaming inference requests across a federation of
//! persona-specialized worker endpoints.
//!
//! Overview
//! - Admits requests through a weighted fair scheduler capped by per-session
//!   AIMD congestion windows.
//! - Fans each request out to persona clones, buffers their out-of-order
//!   token streams, and merges the outputs under a reconciliation policy
//!   (first-win, consensus, weighted-merge, arbiter).
//! - Out of band, the AGP federation engine (`weft-agp`) exchanges
//!   reachability and health between routers; its route table feeds dispatch
//!   decisions.
//!
//! Key behaviors and trade-offs
//! - Reconciliation policies:
//!   - `first-win`: lowest latency; discards slower personas' work.
//!   - `consensus`: waits for a completion quorum; better grounding at the
//!     cost of tail latency.
//!   - `weighted-merge`: keeps every output with provenance tags; largest
//!     responses.
//!   - `arbiter`: adjudicates divergent outputs within a dollar budget and
//!     degrades to first-win when spent.
//! - Streams buffer per clone with QoS-scaled windows: gold halves the
//!   window to bound latency, bronze doubles it for batch tolerance.
//! - Route selection is deterministic given table state; ECMP members are
//!   picked by session hash so retries land on the same endpoint.
//! - Every admission outcome feeds the AIMD window, so failing or slow
//!   sessions shed concurrency automatically.
//!
//! See `weft-mock` for scripted workers usable in tests and examples.
#![warn(missing_docs)]

pub(crate) mod core;

/// Append-only HMAC-chained audit log.
pub mod audit;
/// Dispatch pipeline: fan-out, stream pumping, slot lifecycle.
pub mod dispatch;
/// Counter and histogram primitives.
pub mod metrics;
/// Admission control: AIMD windows and the weighted fair queue.
pub mod sched;
/// Parallel sessions, reconciliation strategies, session manager.
pub mod session;

pub use core::{Weft, WeftBuilder};
pub use dispatch::{DispatchRequest, MaintenanceHandle};

pub use session::manager::{PersonaSpec, SessionManager};
pub use session::strategy::{Arbiter, ArbiterDecision, PersonaResult, Strategy, StubArbiter};
pub use session::{BufferEntry, BufferStats, ParallelSession, PersonaSlot, SessionState};

pub use sched::{AimdController, FairScheduler, SchedulerStats, WindowSource};

// Re-export the engine and core contracts for convenience.
pub use weft_agp::{
    BackpressureSignal, DampeningTracker, HealthMetricsProcessor, RouteTable, TableSnapshot,
    UpdateHandler,
};
pub use weft_core::{
    AimdConfig, Capacity, CostInfo, DampeningConfig, DispatchBudget, DispatchFrame,
    DispatchTarget, EndFrame, HealthStats, HoldDownConfig, HysteresisConfig, OpenMessage,
    Overhead, PersonaStats, PersonaWorker, Predictability, QosTier, ReconcileOutcome,
    ReconciliationPolicy, Route, RouteAttributes, SafeModeConfig, SchedulerConfig,
    SelectionConfig, SessionConfig, StreamFrame, UpdateMessage, WeftConfig, WeftError,
    WorkerFrame,
};
