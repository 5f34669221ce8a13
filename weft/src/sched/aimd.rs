//! Per-session AIMD congestion windows.
//!
//! State lives behind a pluggable backend so horizontally scaled deployments
//! can share windows through an external KV store; the in-memory backend is
//! the default.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use weft_core::AimdConfig;

/// Storage for `(window, last_update)` per session.
///
/// Implementations must make `update` last-writer-wins; all operations are
/// idempotent.
pub trait AimdStateBackend: Send + Sync {
    /// Current window for a session, or `default_window` if unknown.
    fn get(&self, session: &str, default_window: u32) -> u32;
    /// Store a session's window, stamping the update time.
    fn update(&self, session: &str, window: u32, now: DateTime<Utc>);
    /// Drop sessions untouched for longer than `ttl_s`. Returns how many.
    fn prune_idle(&self, ttl_s: f64, now: DateTime<Utc>) -> usize;
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryAimdBackend {
    state: Mutex<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl AimdStateBackend for MemoryAimdBackend {
    fn get(&self, session: &str, default_window: u32) -> u32 {
        self.state
            .lock()
            .expect("mutex poisoned")
            .get(session)
            .map_or(default_window, |&(window, _)| window)
    }

    fn update(&self, session: &str, window: u32, now: DateTime<Utc>) {
        self.state
            .lock()
            .expect("mutex poisoned")
            .insert(session.to_string(), (window, now));
    }

    fn prune_idle(&self, ttl_s: f64, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().expect("mutex poisoned");
        let before = state.len();
        state.retain(|_, (_, touched)| {
            (now - *touched).num_milliseconds() as f64 / 1000.0 <= ttl_s
        });
        before - state.len()
    }
}

/// Anything that can answer "how many concurrent calls may this session
/// make right now". The fair scheduler consults this when scanning its
/// queue so grants never exceed a session's congestion window.
pub trait WindowSource: Send + Sync {
    /// Allowed concurrency for a session.
    fn window(&self, session: &str) -> u32;
}

impl<B: AimdStateBackend> WindowSource for AimdController<B> {
    fn window(&self, session: &str) -> u32 {
        self.get(session)
    }
}

/// Additive-increase / multiplicative-decrease controller.
#[derive(Debug)]
pub struct AimdController<B: AimdStateBackend = MemoryAimdBackend> {
    config: AimdConfig,
    backend: B,
}

impl AimdController<MemoryAimdBackend> {
    /// Controller over the in-memory backend.
    #[must_use]
    pub fn new(config: AimdConfig) -> Self {
        Self::with_backend(config, MemoryAimdBackend::default())
    }
}

impl<B: AimdStateBackend> AimdController<B> {
    /// Controller over an explicit backend.
    #[must_use]
    pub const fn with_backend(config: AimdConfig, backend: B) -> Self {
        Self { config, backend }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &AimdConfig {
        &self.config
    }

    /// Allowed concurrency for a session.
    #[must_use]
    pub fn get(&self, session: &str) -> u32 {
        self.backend.get(session, self.config.default_window)
    }

    /// Fold one call outcome into the window.
    ///
    /// Success within the latency target adds one up to `max_window`;
    /// failure or an over-target latency halves the window (by
    /// `decrease_factor`), floored at 1.
    pub fn feedback_at(&self, session: &str, latency_ms: f64, ok: bool, now: DateTime<Utc>) {
        let current = self.get(session);
        let next = if ok && latency_ms <= self.config.latency_target_ms {
            (current + 1).min(self.config.max_window)
        } else {
            (((f64::from(current)) * self.config.decrease_factor).floor() as u32).max(1)
        };
        if next != current {
            tracing::debug!(session, current, next, ok, latency_ms, "aimd window update");
        }
        self.backend.update(session, next, now);
    }

    /// [`Self::feedback_at`] against the current wall clock.
    pub fn feedback(&self, session: &str, latency_ms: f64, ok: bool) {
        self.feedback_at(session, latency_ms, ok, Utc::now());
    }

    /// Drop idle sessions. Returns how many were pruned.
    pub fn prune_idle_at(&self, ttl_s: f64, now: DateTime<Utc>) -> usize {
        self.backend.prune_idle(ttl_s, now)
    }

    /// [`Self::prune_idle_at`] against the current wall clock.
    pub fn prune_idle(&self, ttl_s: f64) -> usize {
        self.prune_idle_at(ttl_s, Utc::now())
    }
}
