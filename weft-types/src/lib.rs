//! Weft-specific data transfer objects and configuration primitives.
#![warn(missing_docs)]

mod config;
mod error;
mod frames;
mod qos;
mod reconcile;
mod route;

pub use config::{
    AimdConfig, DampeningConfig, HoldDownConfig, HysteresisConfig, SafeModeConfig, SchedulerConfig,
    SelectionConfig, SessionConfig, WeftConfig,
};
pub use error::WeftError;
pub use frames::{
    AgpMessageType, Announcement, AttestationData, Capabilities, DispatchBudget, DispatchFrame,
    DispatchTarget, EndFrame, OpenMessage, PersonaStats, RoaData, StreamFrame, UpdateMessage,
    WorkerFrame,
};
pub use qos::QosTier;
pub use reconcile::{ReconcileOutcome, ReconciliationPolicy};
pub use route::{Capacity, CostInfo, HealthStats, Overhead, Predictability, Route, RouteAttributes};
