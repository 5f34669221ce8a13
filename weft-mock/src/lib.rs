use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use weft_core::{
    DispatchFrame, EndFrame, PersonaStats, PersonaWorker, QosTier, StreamFrame, WeftError,
    WorkerFrame,
};

/// Mock persona worker for CI-safe tests and examples.
///
/// Emits a scripted chunk sequence for every addressed clone, optionally
/// out of order, with a configurable inter-chunk delay, then reports
/// completion stats. A persona id of `"fail"` forces a worker error before
/// any frames are sent.
pub struct MockWorker {
    persona_id: String,
    chunks: Vec<String>,
    emit_order: Vec<usize>,
    chunk_delay: Duration,
    stats: PersonaStats,
    min_qos: QosTier,
}

impl MockWorker {
    /// A worker that streams the given chunks in order.
    #[must_use]
    pub fn new(persona_id: impl Into<String>, chunks: &[&str]) -> Self {
        let chunks: Vec<String> = chunks.iter().map(ToString::to_string).collect();
        let emit_order = (0..chunks.len()).collect();
        Self {
            persona_id: persona_id.into(),
            chunks,
            emit_order,
            chunk_delay: Duration::ZERO,
            stats: PersonaStats::default(),
            min_qos: QosTier::Bronze,
        }
    }

    /// Emit chunks in the given index order (sequence numbers are
    /// unchanged, so this simulates out-of-order delivery).
    #[must_use]
    pub fn emit_order(mut self, order: &[usize]) -> Self {
        self.emit_order = order.to_vec();
        self
    }

    /// Pause between chunks.
    #[must_use]
    pub const fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Stats to report in END frames.
    #[must_use]
    pub fn stats(mut self, stats: PersonaStats) -> Self {
        self.stats = stats;
        self
    }

    /// Lowest tier this worker serves.
    #[must_use]
    pub const fn min_qos(mut self, tier: QosTier) -> Self {
        self.min_qos = tier;
        self
    }
}

#[async_trait]
impl PersonaWorker for MockWorker {
    fn persona_id(&self) -> &str {
        &self.persona_id
    }

    fn supports_qos(&self, tier: QosTier) -> bool {
        tier >= self.min_qos
    }

    async fn run(
        &self,
        frame: DispatchFrame,
        tx: mpsc::Sender<WorkerFrame>,
    ) -> Result<(), WeftError> {
        if self.persona_id == "fail" {
            return Err(WeftError::worker(&self.persona_id, "forced failure"));
        }

        for target in &frame.targets {
            for &idx in &self.emit_order {
                if !self.chunk_delay.is_zero() {
                    tokio::time::sleep(self.chunk_delay).await;
                }
                let sent = tx
                    .send(WorkerFrame::Stream(StreamFrame {
                        session_id: frame.session_id.clone(),
                        persona_id: target.persona_id.clone(),
                        clone_id: target.clone_id,
                        seq: idx as u64 + 1,
                        data: self.chunks[idx].clone(),
                    }))
                    .await;
                if sent.is_err() {
                    // Receiver hung up (cancellation); wind down quietly.
                    return Ok(());
                }
            }
            let _ = tx
                .send(WorkerFrame::End(EndFrame {
                    session_id: frame.session_id.clone(),
                    persona_id: target.persona_id.clone(),
                    clone_id: target.clone_id,
                    stats: self.stats.clone(),
                }))
                .await;
        }
        Ok(())
    }
}
