#![allow(dead_code)]

use chrono::{DateTime, Utc};

use weft::{ParallelSession, PersonaSlot, ReconciliationPolicy, SessionConfig, SessionState};

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn ms(offset: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::milliseconds(offset)
}

/// A session already moved into STREAMING with the given clones.
pub fn streaming_session(
    clones: &[(&str, u64)],
    policy: ReconciliationPolicy,
) -> ParallelSession {
    let slots = clones
        .iter()
        .map(|(persona, clone)| PersonaSlot::new(*persona, Some(*clone)))
        .collect();
    let mut session =
        ParallelSession::new_at("session-1", SessionConfig::default(), slots, policy, t0());
    session
        .transition_to_at(SessionState::Dispatched, t0())
        .unwrap();
    session
        .transition_to_at(SessionState::Streaming, t0())
        .unwrap();
    session
}
