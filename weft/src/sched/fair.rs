//! Weighted fair scheduler with AIMD window caps and starvation protection.
//!
//! Admission priority is `served / effective_weight` (lower first), ties
//! broken by queue time. Entries that wait past a dynamic threshold (p95 of
//! recent waits, floored at 10 ms) are promoted and their session receives
//! a temporary decaying weight boost. When QoS prioritization is enabled
//! the tier rank dominates the ratio comparison.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};

use weft_core::{QosTier, SchedulerConfig};

use crate::metrics::{Histogram, HistogramSnapshot, jains_index};
use crate::sched::aimd::WindowSource;

/// Shared served-count and weight storage.
///
/// `inc_served` must be atomic; everything else is idempotent, so a remote
/// KV implementation can mirror this interface directly.
pub trait SchedulerStateBackend: Send + Sync {
    /// Weight for a session (1.0 when unset).
    fn get_weight(&self, session: &str) -> f64;
    /// Set a session's weight.
    fn set_weight(&self, session: &str, weight: f64);
    /// Atomically increment and return a session's served count.
    fn inc_served(&self, session: &str) -> u64;
    /// All configured weights.
    fn snapshot_weights(&self) -> HashMap<String, f64>;
    /// All served counts.
    fn snapshot_served(&self) -> HashMap<String, u64>;
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemorySchedulerBackend {
    weights: StdMutex<HashMap<String, f64>>,
    served: StdMutex<HashMap<String, u64>>,
}

impl SchedulerStateBackend for MemorySchedulerBackend {
    fn get_weight(&self, session: &str) -> f64 {
        self.weights
            .lock()
            .expect("mutex poisoned")
            .get(session)
            .copied()
            .unwrap_or(1.0)
    }

    fn set_weight(&self, session: &str, weight: f64) {
        self.weights
            .lock()
            .expect("mutex poisoned")
            .insert(session.to_string(), weight);
    }

    fn inc_served(&self, session: &str) -> u64 {
        let mut served = self.served.lock().expect("mutex poisoned");
        let count = served.entry(session.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn snapshot_weights(&self) -> HashMap<String, f64> {
        self.weights.lock().expect("mutex poisoned").clone()
    }

    fn snapshot_served(&self) -> HashMap<String, u64> {
        self.served.lock().expect("mutex poisoned").clone()
    }
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerStats {
    /// Slots granted (fast path and queued).
    pub grants_total: u64,
    /// Entries that waited in the queue.
    pub enqueued_total: u64,
    /// Queued entries later granted.
    pub dequeued_total: u64,
    /// Queued entries dropped on timeout.
    pub dropped_total: u64,
    /// Starvation promotions applied.
    pub starvation_boosts_total: u64,
    /// Current queue depth.
    pub queue_depth: usize,
    /// Wait-time distribution, milliseconds.
    pub wait_ms: HistogramSnapshot,
    /// Jain's fairness index over served counts.
    pub jains_index: f64,
}

struct QueueEntry {
    id: u64,
    session: String,
    enqueued_at: Instant,
    grant_tx: oneshot::Sender<()>,
}

struct Inner {
    queue: Vec<QueueEntry>,
    active: HashMap<String, u32>,
    qos: HashMap<String, QosTier>,
    /// session → (boosted weight, when the boost was applied)
    boosted: HashMap<String, (f64, Instant)>,
    wait_hist: Histogram,
    next_entry_id: u64,
    grants_total: u64,
    enqueued_total: u64,
    dequeued_total: u64,
    dropped_total: u64,
    starvation_boosts_total: u64,
}

/// The process-wide fair scheduler. One instance serializes admission
/// decisions behind a mutex.
pub struct FairScheduler<B: SchedulerStateBackend = MemorySchedulerBackend> {
    config: SchedulerConfig,
    backend: B,
    windows: Arc<dyn WindowSource>,
    inner: Mutex<Inner>,
}

impl<B: SchedulerStateBackend> FairScheduler<B> {
    /// Build a scheduler over an explicit backend and window source.
    #[must_use]
    pub fn with_backend(config: SchedulerConfig, backend: B, windows: Arc<dyn WindowSource>) -> Self {
        Self {
            config,
            backend,
            windows,
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                active: HashMap::new(),
                qos: HashMap::new(),
                boosted: HashMap::new(),
                wait_hist: Histogram::new(&[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
                next_entry_id: 0,
                grants_total: 0,
                enqueued_total: 0,
                dequeued_total: 0,
                dropped_total: 0,
                starvation_boosts_total: 0,
            }),
        }
    }

    /// Set a session's weight, floored at `min_weight`.
    pub fn set_weight(&self, session: &str, weight: f64) {
        self.backend
            .set_weight(session, weight.max(self.config.min_weight));
    }

    /// Record a session's QoS tier for prioritized selection.
    pub async fn set_qos(&self, session: &str, tier: QosTier) {
        self.inner.lock().await.qos.insert(session.to_string(), tier);
    }

    /// All configured weights.
    #[must_use]
    pub fn snapshot_weights(&self) -> HashMap<String, f64> {
        self.backend.snapshot_weights()
    }

    /// All served counts.
    #[must_use]
    pub fn snapshot_served(&self) -> HashMap<String, u64> {
        self.backend.snapshot_served()
    }

    /// Current active slots for a session.
    pub async fn active_count(&self, session: &str) -> u32 {
        self.inner
            .lock()
            .await
            .active
            .get(session)
            .copied()
            .unwrap_or(0)
    }

    /// Acquire a slot for `session` under its AIMD window.
    ///
    /// Fast path: below the window with no same-session queue head.
    /// Otherwise the call queues for up to `timeout` (a zero timeout means
    /// non-blocking). Returns whether a slot was granted; callers translate
    /// `false` into a backpressure response at the boundary.
    pub async fn acquire(&self, session: &str, window_allowed: u32, timeout: Duration) -> bool {
        let (entry_id, grant_rx) = {
            let mut inner = self.inner.lock().await;
            let current = inner.active.get(session).copied().unwrap_or(0);
            let head_is_same = inner
                .queue
                .first()
                .is_some_and(|entry| entry.session == session);
            if current < window_allowed && !head_is_same {
                *inner.active.entry(session.to_string()).or_insert(0) += 1;
                inner.grants_total += 1;
                self.backend.inc_served(session);
                return true;
            }
            if timeout.is_zero() {
                return false;
            }
            let (tx, rx) = oneshot::channel();
            inner.next_entry_id += 1;
            let id = inner.next_entry_id;
            inner.queue.push(QueueEntry {
                id,
                session: session.to_string(),
                enqueued_at: Instant::now(),
                grant_tx: tx,
            });
            inner.enqueued_total += 1;
            (id, rx)
        };

        match tokio::time::timeout(timeout, grant_rx).await {
            Ok(Ok(())) => true,
            // Timed out or the sender vanished: remove our entry if it is
            // still queued. If it is gone a grant raced the timeout and the
            // slot is ours.
            _ => {
                let mut inner = self.inner.lock().await;
                if let Some(pos) = inner.queue.iter().position(|entry| entry.id == entry_id) {
                    inner.queue.remove(pos);
                    inner.dropped_total += 1;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Release a slot and hand it to the best queued entry, if any.
    pub async fn release(&self, session: &str) {
        let mut inner = self.inner.lock().await;
        match inner.active.get_mut(session) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.active.remove(session);
            }
            None => {}
        }
        if let Some(entry) = self.select_next_locked(&mut inner) {
            inner.dequeued_total += 1;
            // A dropped receiver means the waiter timed out between the
            // scan and the send; the slot returns on its next release.
            let _ = entry.grant_tx.send(());
        }
    }

    /// Pick the next queued entry: respect AIMD caps, prefer the lowest
    /// served/effective-weight ratio (QoS rank first when enabled), and
    /// promote the longest-starved entry past everything else.
    fn select_next_locked(&self, inner: &mut Inner) -> Option<QueueEntry> {
        let now = Instant::now();
        let served = self.backend.snapshot_served();
        let threshold_ms = self.dynamic_threshold_ms(inner);

        let mut best_idx: Option<usize> = None;
        let mut best_key = (i32::MIN, f64::INFINITY, Instant::now());
        let mut starved: Option<(usize, f64)> = None;

        for (idx, entry) in inner.queue.iter().enumerate() {
            let active = inner.active.get(&entry.session).copied().unwrap_or(0);
            if active >= self.windows.window(&entry.session) {
                continue;
            }
            let ratio = served.get(&entry.session).copied().unwrap_or(0) as f64
                / self.effective_weight_locked(inner, &entry.session, now);
            let qos_rank = if self.config.qos_priority {
                i32::from(
                    inner
                        .qos
                        .get(&entry.session)
                        .copied()
                        .unwrap_or_default()
                        .rank(),
                )
            } else {
                0
            };

            let waited_ms = now.duration_since(entry.enqueued_at).as_secs_f64() * 1000.0;
            if waited_ms > threshold_ms && starved.is_none_or(|(_, w)| waited_ms > w) {
                starved = Some((idx, waited_ms));
            }

            // QoS rank is a maximization axis (always 0 when prioritization
            // is off); ratio and queue age minimize.
            let better = match best_idx {
                None => true,
                Some(_) => {
                    if qos_rank != best_key.0 {
                        qos_rank > best_key.0
                    } else if ratio != best_key.1 {
                        ratio < best_key.1
                    } else {
                        entry.enqueued_at < best_key.2
                    }
                }
            };
            if better {
                best_idx = Some(idx);
                best_key = (qos_rank, ratio, entry.enqueued_at);
            }
        }

        // Starvation override: the longest-waiting starved entry wins and
        // its session gets a temporary weight boost.
        if let Some((idx, _)) = starved {
            let session = inner.queue[idx].session.clone();
            self.apply_starvation_boost_locked(inner, &session, now);
            best_idx = Some(idx);
        }

        let idx = best_idx?;
        let entry = inner.queue.remove(idx);
        *inner.active.entry(entry.session.clone()).or_insert(0) += 1;
        inner.grants_total += 1;
        self.backend.inc_served(&entry.session);

        let waited_ms = now.duration_since(entry.enqueued_at).as_secs_f64() * 1000.0;
        inner.wait_hist.observe(waited_ms);
        Some(entry)
    }

    /// Starvation threshold: the configured quantile of recent waits,
    /// floored at 10 ms; the static threshold until data accumulates.
    fn dynamic_threshold_ms(&self, inner: &Inner) -> f64 {
        if inner.wait_hist.count() == 0 {
            return self.config.starvation_threshold_ms;
        }
        inner
            .wait_hist
            .quantile(self.config.starvation_quantile)
            .max(10.0)
    }

    fn effective_weight_locked(&self, inner: &Inner, session: &str, now: Instant) -> f64 {
        let base = self.backend.get_weight(session).max(self.config.min_weight);
        if let Some(&(boosted, applied_at)) = inner.boosted.get(session) {
            let elapsed_s = now.duration_since(applied_at).as_secs_f64();
            let effective = boosted * self.config.boost_decay.powf(elapsed_s);
            if effective > base * 1.05 {
                return effective;
            }
        }
        base
    }

    fn apply_starvation_boost_locked(&self, inner: &mut Inner, session: &str, now: Instant) {
        let base = self.backend.get_weight(session).max(self.config.min_weight);
        inner
            .boosted
            .insert(session.to_string(), (base * self.config.boost_factor, now));
        inner.starvation_boosts_total += 1;
        tracing::debug!(session, "starvation boost applied");
    }

    /// Drop expired boosts (effective weight within 5% of base).
    pub async fn sweep_expired_boosts(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let config = &self.config;
        let backend = &self.backend;
        inner.boosted.retain(|session, &mut (boosted, applied_at)| {
            let base = backend.get_weight(session).max(config.min_weight);
            let elapsed_s = now.duration_since(applied_at).as_secs_f64();
            boosted * config.boost_decay.powf(elapsed_s) > base * 1.05
        });
    }

    /// Point-in-time statistics.
    pub async fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock().await;
        let served = self.backend.snapshot_served();
        let counts: Vec<f64> = served.values().map(|&v| v as f64).collect();
        SchedulerStats {
            grants_total: inner.grants_total,
            enqueued_total: inner.enqueued_total,
            dequeued_total: inner.dequeued_total,
            dropped_total: inner.dropped_total,
            starvation_boosts_total: inner.starvation_boosts_total,
            queue_depth: inner.queue.len(),
            wait_ms: inner.wait_hist.snapshot(),
            jains_index: jains_index(&counts),
        }
    }
}

impl FairScheduler<MemorySchedulerBackend> {
    /// Scheduler over the in-memory backend.
    #[must_use]
    pub fn new(config: SchedulerConfig, windows: Arc<dyn WindowSource>) -> Self {
        Self::with_backend(config, MemorySchedulerBackend::default(), windows)
    }
}
