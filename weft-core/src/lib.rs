//! weft-core
//!
//! Core traits shared across the weft ecosystem.
//!
//! - `worker`: the [`PersonaWorker`] trait implemented by persona endpoints.
#![warn(missing_docs)]

/// The `PersonaWorker` contract for persona-specialized endpoints.
pub mod worker;

pub use worker::PersonaWorker;

// Re-export the shared DTO crate so downstream users need a single import.
pub use weft_types::*;
