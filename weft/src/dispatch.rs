//! Dispatch: fan a request out to persona workers, pump their frames into
//! the session, and reconcile under the session's policy.
//!
//! Every exit path (completion, error, cancellation, caller drop) releases
//! the scheduler slot and feeds the AIMD window; a hard deadline at four
//! times the request SLO cancels runaway generations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use weft_core::{
    DispatchBudget, DispatchFrame, DispatchTarget, QosTier, ReconcileOutcome,
    ReconciliationPolicy, WeftError, WorkerFrame,
};

use crate::core::Weft;
use crate::sched::{AimdController, FairScheduler};
use crate::session::SessionState;
use crate::session::manager::PersonaSpec;

/// Multiple of the request SLO after which a dispatch self-terminates.
const SLO_HARD_CAP_FACTOR: f64 = 4.0;
/// Frame channel capacity; workers block when the pump falls this far behind.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// One in-flight dispatch request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Session identifier (also the fairness/AIMD key).
    pub session_id: String,
    /// Personas to fan out to, with clone counts.
    pub personas: Vec<PersonaSpec>,
    /// Reconciliation policy for the merged response.
    pub policy: ReconciliationPolicy,
    /// Requested service tier.
    pub qos: QosTier,
    /// Budget envelope forwarded to workers.
    pub budget: DispatchBudget,
    /// Latency SLO for the request, milliseconds.
    pub latency_slo_ms: f64,
    /// How long to wait for a scheduler slot.
    pub admission_timeout: Duration,
}

/// Releases admission state on every exit path, including caller drop.
struct SlotGuard {
    scheduler: Arc<FairScheduler>,
    aimd: Arc<AimdController>,
    session_id: String,
    started: Instant,
    armed: bool,
}

impl SlotGuard {
    fn new(scheduler: Arc<FairScheduler>, aimd: Arc<AimdController>, session_id: String) -> Self {
        Self {
            scheduler,
            aimd,
            session_id,
            started: Instant::now(),
            armed: true,
        }
    }

    async fn release(mut self, ok: bool) {
        self.armed = false;
        let latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.scheduler.release(&self.session_id).await;
        self.aimd.feedback(&self.session_id, latency_ms, ok);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The caller vanished mid-stream (client disconnect). Release the
        // slot and register the failure from a detached task.
        let scheduler = Arc::clone(&self.scheduler);
        let aimd = Arc::clone(&self.aimd);
        let session_id = std::mem::take(&mut self.session_id);
        let latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        tokio::spawn(async move {
            scheduler.release(&session_id).await;
            aimd.feedback(&session_id, latency_ms, false);
        });
    }
}

/// One worker task streaming a persona's clones into the frame channel.
///
/// The task winds down on its own once the dispatch channel closes; a
/// failed dispatch cancels it outright, tagged with the failure reason so
/// the worker's fate is attributable per persona.
struct WorkerTask {
    persona_id: String,
    task: JoinHandle<()>,
}

impl WorkerTask {
    fn cancel(self, reason: &str) {
        tracing::warn!(persona = %self.persona_id, reason, "worker stream cancelled");
        self.task.abort();
    }

    async fn join(self) {
        let _ = self.task.await;
    }
}

/// Handle for the background maintenance task.
///
/// Dropping the handle stops the loop at its next suspension point (the
/// stop channel closes with it); [`shutdown`](Self::shutdown) stops it and
/// waits for any in-flight sweep to finish.
#[derive(Debug)]
pub struct MaintenanceHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the maintenance loop and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(());
        let _ = self.task.await;
    }
}

impl Weft {
    /// Run a parallel dispatch end to end: admission, fan-out, stream
    /// buffering, and reconciliation.
    ///
    /// # Errors
    /// `WeftError::Backpressure` when no slot is granted within the
    /// admission timeout; `WeftError::Cancelled` when the SLO hard cap
    /// fires; worker, session, and reconciliation failures propagate.
    pub async fn dispatch_parallel(
        &self,
        request: DispatchRequest,
    ) -> Result<ReconcileOutcome, WeftError> {
        let window = self.aimd.get(&request.session_id);
        if !self
            .scheduler
            .acquire(&request.session_id, window, request.admission_timeout)
            .await
        {
            return Err(WeftError::Backpressure {
                session: request.session_id,
            });
        }

        let guard = SlotGuard::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.aimd),
            request.session_id.clone(),
        );
        let result = self.run_dispatch(&request).await;
        guard.release(result.is_ok()).await;
        result
    }

    async fn run_dispatch(&self, request: &DispatchRequest) -> Result<ReconcileOutcome, WeftError> {
        let now = chrono::Utc::now();
        let session_id = request.session_id.as_str();

        // Pre-flight before anything is spawned: every addressed persona
        // needs a registered worker that serves the requested tier.
        for spec in &request.personas {
            match self.workers.get(&spec.persona_id) {
                None => {
                    return Err(WeftError::worker(
                        spec.persona_id.clone(),
                        "no registered worker for persona",
                    ));
                }
                Some(worker) if !worker.supports_qos(request.qos) => {
                    return Err(WeftError::worker(
                        spec.persona_id.clone(),
                        format!("does not serve {} tier", request.qos),
                    ));
                }
                Some(_) => {}
            }
        }

        // Allocate clones and move the session into STREAMING.
        let targets: Vec<DispatchTarget> = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.create_session_with_clones_at(
                session_id,
                &request.personas,
                request.policy.clone(),
                now,
            )?;
            let targets = session
                .personas
                .iter()
                .filter_map(|slot| {
                    slot.clone_id.map(|clone_id| DispatchTarget {
                        persona_id: slot.persona_id.clone(),
                        clone_id,
                    })
                })
                .collect();
            sessions.begin_streaming_at(session_id, now)?;
            targets
        };

        // One task per persona worker; all feed one channel.
        let (tx, mut rx) = mpsc::channel::<WorkerFrame>(FRAME_CHANNEL_CAPACITY);
        let mut workers = Vec::new();
        for (persona_id, worker) in &self.workers {
            let worker_targets: Vec<DispatchTarget> = targets
                .iter()
                .filter(|target| &target.persona_id == persona_id)
                .cloned()
                .collect();
            if worker_targets.is_empty() {
                continue;
            }
            let frame = DispatchFrame {
                session_id: session_id.to_string(),
                targets: worker_targets,
                budget: request.budget,
            };
            let worker = Arc::clone(worker);
            let tx = tx.clone();
            let persona = persona_id.clone();
            let task = tokio::spawn(async move {
                if let Err(err) = worker.run(frame, tx).await {
                    tracing::warn!(persona = %persona, %err, "worker failed");
                }
            });
            workers.push(WorkerTask {
                persona_id: persona_id.clone(),
                task,
            });
        }
        drop(tx);

        let deadline = Instant::now()
            + Duration::from_millis((request.latency_slo_ms * SLO_HARD_CAP_FACTOR) as u64);
        match self.pump_frames(&mut rx, deadline, request.qos).await {
            Ok(()) => {
                // Streams drained; let the workers report their exits.
                futures::future::join_all(workers.into_iter().map(WorkerTask::join)).await;
            }
            Err(err) => {
                let reason = err.to_string();
                for worker in workers {
                    worker.cancel(&reason);
                }
                return Err(err);
            }
        }

        // Reconcile: STREAMING or BUFFERING both legally enter RECONCILING.
        let reconcile_now = chrono::Utc::now();
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_session_mut(session_id)
            .ok_or_else(|| WeftError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        session.transition_to_at(SessionState::Reconciling, reconcile_now)?;
        let outcome = sessions.reconcile_session_at(session_id, reconcile_now)?;
        if let Some(session) = sessions.get_session_mut(session_id) {
            session.transition_to_at(SessionState::Complete, reconcile_now)?;
        }
        Ok(outcome)
    }

    /// Drain worker frames into the session until every stream ends.
    ///
    /// # Errors
    /// `WeftError::Cancelled` once `deadline` passes (the SLO hard cap);
    /// buffering and session failures propagate.
    async fn pump_frames(
        &self,
        rx: &mut mpsc::Receiver<WorkerFrame>,
        deadline: Instant,
        qos: QosTier,
    ) -> Result<(), WeftError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WeftError::Cancelled {
                    reason: "slo hard cap exceeded".to_string(),
                });
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => continue,
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => self.apply_worker_frame(frame, qos).await?,
            }
        }
    }

    async fn apply_worker_frame(&self, frame: WorkerFrame, qos: QosTier) -> Result<(), WeftError> {
        let now = chrono::Utc::now();
        let mut sessions = self.sessions.lock().await;
        match frame {
            WorkerFrame::Stream(frame) => {
                let session = sessions.get_session_mut(&frame.session_id).ok_or_else(|| {
                    WeftError::SessionNotFound {
                        session_id: frame.session_id.clone(),
                    }
                })?;
                session.buffer_stream_data_at(
                    &frame.persona_id,
                    frame.seq,
                    &frame.data,
                    qos,
                    Some(frame.clone_id),
                    now,
                )
            }
            WorkerFrame::End(frame) => {
                // Partial results from streaming reconciliation are
                // advisory here; the full pass runs once the pump drains.
                sessions
                    .mark_persona_complete_and_check_streaming_at(
                        &frame.session_id,
                        &frame.persona_id,
                        frame.stats,
                        Some(frame.clone_id),
                        now,
                    )
                    .map(|_| ())
            }
        }
    }

    /// Run one maintenance sweep: expired routes, idle AIMD sessions,
    /// aged-out dampening states, and expired parallel sessions.
    pub async fn run_maintenance_once(&self, session_max_age_s: f64, aimd_ttl_s: f64) {
        let now = chrono::Utc::now();
        {
            let mut table = self.table.write().await;
            let reaped = table.cleanup_expired_at(now);
            if reaped > 0 {
                tracing::debug!(reaped, "expired routes reaped");
            }
            table.dampening_mut().cleanup_expired_at(3600, now);
        }
        self.aimd.prune_idle_at(aimd_ttl_s, now);
        self.scheduler.sweep_expired_boosts().await;
        let mut sessions = self.sessions.lock().await;
        sessions.cleanup_expired_sessions_at(session_max_age_s, now);
    }

    /// Spawn the periodic maintenance task.
    #[must_use]
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        session_max_age_s: f64,
        aimd_ttl_s: f64,
    ) -> MaintenanceHandle {
        let fabric = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        fabric.run_maintenance_once(session_max_age_s, aimd_ttl_s).await;
                    }
                    // Fires on an explicit shutdown or when the handle is
                    // dropped and the channel closes.
                    _ = &mut stop_rx => break,
                }
            }
        });
        MaintenanceHandle { stop_tx, task }
    }
}
