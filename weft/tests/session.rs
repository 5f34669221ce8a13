mod common;

use common::{ms, streaming_session, t0};
use weft::{
    ParallelSession, PersonaSlot, PersonaStats, QosTier, ReconciliationPolicy, SessionConfig,
    SessionState, WeftError,
};

fn session() -> ParallelSession {
    streaming_session(&[("doctor-1", 1), ("lawyer-1", 2)], ReconciliationPolicy::FirstWin)
}

#[test]
fn legal_transition_chain_reaches_complete() {
    let mut s = ParallelSession::new_at(
        "s",
        SessionConfig::default(),
        vec![PersonaSlot::new("p", Some(1))],
        ReconciliationPolicy::FirstWin,
        t0(),
    );
    for state in [
        SessionState::Dispatched,
        SessionState::Streaming,
        SessionState::Buffering,
        SessionState::Reconciling,
        SessionState::Complete,
    ] {
        s.transition_to_at(state, t0()).unwrap();
    }
    assert_eq!(s.state(), SessionState::Complete);
}

#[test]
fn illegal_transition_fails_and_leaves_state_unchanged() {
    let mut s = ParallelSession::new_at(
        "s",
        SessionConfig::default(),
        vec![],
        ReconciliationPolicy::FirstWin,
        t0(),
    );
    let err = s.transition_to_at(SessionState::Reconciling, t0()).unwrap_err();
    assert!(matches!(err, WeftError::InvalidTransition { .. }));
    assert_eq!(s.state(), SessionState::Init);
}

#[test]
fn complete_is_terminal() {
    let mut s = session();
    s.transition_to_at(SessionState::Reconciling, t0()).unwrap();
    s.transition_to_at(SessionState::Complete, t0()).unwrap();
    assert!(s.transition_to_at(SessionState::Streaming, t0()).is_err());
    assert_eq!(s.state(), SessionState::Complete);
}

#[test]
fn personas_can_only_be_added_in_init() {
    let mut s = session();
    let err = s.add_persona(PersonaSlot::new("late", Some(9))).unwrap_err();
    assert!(matches!(err, WeftError::WrongState { .. }));
}

#[test]
fn buffering_is_illegal_outside_streaming_states() {
    let mut s = ParallelSession::new_at(
        "s",
        SessionConfig::default(),
        vec![PersonaSlot::new("p", Some(1))],
        ReconciliationPolicy::FirstWin,
        t0(),
    );
    let err = s
        .buffer_stream_data_at("p", 1, "data", QosTier::Silver, Some(1), t0())
        .unwrap_err();
    assert!(matches!(err, WeftError::WrongState { .. }));
}

#[test]
fn out_of_order_chunks_are_kept_in_sequence_order() {
    let mut s = session();
    s.buffer_stream_data_at("doctor-1", 3, "c", QosTier::Silver, Some(1), ms(0))
        .unwrap();
    s.buffer_stream_data_at("doctor-1", 1, "a", QosTier::Silver, Some(1), ms(1))
        .unwrap();
    s.buffer_stream_data_at("doctor-1", 2, "b", QosTier::Silver, Some(1), ms(2))
        .unwrap();

    let seqs: Vec<u64> = s.buffer("doctor-1-1").iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn gap_is_filled_after_buffer_timeout() {
    let mut s = session();
    // Seq 2 arrives; seq 1 never does. Once the blocking entry is older
    // than buffer_timeout_s (5 s) a filler for seq 1 is synthesized.
    s.buffer_stream_data_at("doctor-1", 2, "world", QosTier::Silver, Some(1), ms(0))
        .unwrap();
    s.buffer_stream_data_at("doctor-1", 3, "!", QosTier::Silver, Some(1), ms(5_100))
        .unwrap();

    let buffer = s.ordered_buffer_data_at("doctor-1-1", ms(5_200));
    assert_eq!(buffer.len(), 3);
    assert_eq!(buffer[0].seq, 1);
    assert!(buffer[0].gap_filled);
    assert!(buffer[0].data.is_empty());
    assert_eq!(s.buffer_stats_at("doctor-1-1", ms(5_200)).gaps, 1);
    assert!(!s.gap_waits_ms.is_empty());
}

#[test]
fn gap_is_not_filled_before_timeout() {
    let mut s = session();
    s.buffer_stream_data_at("doctor-1", 2, "world", QosTier::Silver, Some(1), ms(0))
        .unwrap();
    let buffer = s.ordered_buffer_data_at("doctor-1-1", ms(1_000));
    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer[0].seq, 2);
}

#[test]
fn consecutive_gaps_collapse_in_one_pass() {
    let mut s = session();
    // Only seq 4 present; after the timeout, fillers for 1..3 appear.
    s.buffer_stream_data_at("doctor-1", 4, "end", QosTier::Silver, Some(1), ms(0))
        .unwrap();
    let buffer = s.ordered_buffer_data_at("doctor-1-1", ms(6_000));
    let seqs: Vec<u64> = buffer.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(buffer.iter().filter(|e| e.gap_filled).count(), 3);
}

#[test]
fn duplicate_seq_is_tolerated() {
    let mut s = session();
    s.buffer_stream_data_at("doctor-1", 1, "a", QosTier::Silver, Some(1), ms(0))
        .unwrap();
    s.buffer_stream_data_at("doctor-1", 1, "a2", QosTier::Silver, Some(1), ms(1))
        .unwrap();
    s.buffer_stream_data_at("doctor-1", 2, "b", QosTier::Silver, Some(1), ms(2))
        .unwrap();
    let seqs: Vec<u64> = s.buffer("doctor-1-1").iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 1, 2]);
}

#[test]
fn overflow_triggers_strictly_past_the_limit() {
    let config = SessionConfig {
        max_buffer_tokens: 10,
        ..SessionConfig::default()
    };
    let mut s = ParallelSession::new_at(
        "s",
        config,
        vec![PersonaSlot::new("p", Some(1))],
        ReconciliationPolicy::FirstWin,
        t0(),
    );
    s.transition_to_at(SessionState::Dispatched, t0()).unwrap();
    s.transition_to_at(SessionState::Streaming, t0()).unwrap();

    // Exactly at the limit: accepted.
    s.buffer_stream_data_at("p", 1, "0123456789", QosTier::Silver, Some(1), t0())
        .unwrap();
    // One byte past: rejected, session intact.
    let err = s
        .buffer_stream_data_at("p", 2, "x", QosTier::Silver, Some(1), t0())
        .unwrap_err();
    assert!(matches!(err, WeftError::BufferOverflow { .. }));
    assert_eq!(s.state(), SessionState::Streaming);
    assert_eq!(s.buffer("p-1").len(), 1);
}

#[test]
fn qos_multipliers_scale_the_buffer_window() {
    let config = SessionConfig {
        max_buffer_tokens: 10,
        ..SessionConfig::default()
    };
    let mut s = ParallelSession::new_at(
        "s",
        config,
        vec![PersonaSlot::new("p", Some(1))],
        ReconciliationPolicy::FirstWin,
        t0(),
    );
    s.transition_to_at(SessionState::Dispatched, t0()).unwrap();
    s.transition_to_at(SessionState::Streaming, t0()).unwrap();

    // Gold halves the window: 6 bytes overflow a 5-byte budget.
    let err = s
        .buffer_stream_data_at("p", 1, "123456", QosTier::Gold, Some(1), t0())
        .unwrap_err();
    assert!(matches!(err, WeftError::BufferOverflow { limit: 5, .. }));
    // Bronze doubles it: 20 bytes fit exactly.
    s.buffer_stream_data_at("p", 1, &"x".repeat(20), QosTier::Bronze, Some(1), t0())
        .unwrap();
}

#[test]
fn bare_persona_id_maps_to_single_clone() {
    let mut s = streaming_session(&[("doctor-1", 7)], ReconciliationPolicy::FirstWin);
    s.buffer_stream_data_at("doctor-1", 1, "hello", QosTier::Silver, None, t0())
        .unwrap();
    assert_eq!(s.buffer("doctor-1-7").len(), 1);
}

#[test]
fn bare_persona_id_with_multiple_clones_uses_bare_key() {
    let mut s = streaming_session(
        &[("doctor-1", 1), ("doctor-1", 2)],
        ReconciliationPolicy::FirstWin,
    );
    s.buffer_stream_data_at("doctor-1", 1, "hello", QosTier::Silver, None, t0())
        .unwrap();
    assert_eq!(s.buffer("doctor-1").len(), 1);
}

#[test]
fn completion_of_all_personas_moves_streaming_to_buffering() {
    let mut s = session();
    s.mark_persona_complete_at("doctor-1", PersonaStats::default(), Some(1), ms(300));
    assert_eq!(s.state(), SessionState::Streaming);
    s.mark_persona_complete_at("lawyer-1", PersonaStats::default(), Some(2), ms(500));
    assert_eq!(s.state(), SessionState::Buffering);
    assert_eq!(s.completed_personas().len(), 2);
}

#[test]
fn completion_matches_clone_id_when_given() {
    let mut s = streaming_session(
        &[("doctor-1", 1), ("doctor-1", 2)],
        ReconciliationPolicy::FirstWin,
    );
    s.mark_persona_complete_at("doctor-1", PersonaStats::default(), Some(2), t0());
    let completed = s.completed_personas();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].clone_id, Some(2));
}
