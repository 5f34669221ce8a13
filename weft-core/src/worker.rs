use async_trait::async_trait;
use tokio::sync::mpsc;

use weft_types::{DispatchFrame, QosTier, WeftError, WorkerFrame};

/// Contract implemented by persona-specialized worker endpoints.
///
/// A worker owns one persona. The dispatcher addresses it with a
/// [`DispatchFrame`] naming the clones to run and pushes every emitted
/// [`WorkerFrame`] into the supplied channel. `run` returns once all
/// addressed clones have emitted their END frames (or failed).
///
/// Implementations must be cancel-safe: the dispatcher may drop the
/// receiving end mid-stream on client disconnect, after which sends fail
/// and the worker is expected to wind down.
#[async_trait]
pub trait PersonaWorker: Send + Sync {
    /// Persona this worker specializes.
    fn persona_id(&self) -> &str;

    /// Whether the worker can serve the given tier.
    ///
    /// The default accepts everything; override to restrict.
    fn supports_qos(&self, _tier: QosTier) -> bool {
        true
    }

    /// Execute a dispatch, streaming frames into `tx`.
    ///
    /// # Errors
    /// Returns `WeftError::Worker` when the endpoint fails before emitting
    /// END frames for every addressed clone. Frames already sent remain
    /// valid; the session layer decides whether partial output is usable.
    async fn run(
        &self,
        frame: DispatchFrame,
        tx: mpsc::Sender<WorkerFrame>,
    ) -> Result<(), WeftError>;
}
