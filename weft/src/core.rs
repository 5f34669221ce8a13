use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use weft_agp::{BackpressureSignal, RouteTable, UpdateHandler};
use weft_core::{PersonaWorker, QosTier, Route, WeftConfig, WeftError};

use crate::audit::AuditLog;
use crate::sched::{AimdController, FairScheduler};
use crate::session::manager::SessionManager;
use crate::session::strategy::Arbiter;

/// Orchestrator that brokers streaming requests across persona workers and
/// keeps dispatch decisions aligned with federation state.
pub struct Weft {
    pub(crate) cfg: WeftConfig,
    pub(crate) workers: HashMap<String, Arc<dyn PersonaWorker>>,
    pub(crate) table: Arc<RwLock<RouteTable>>,
    pub(crate) update_handler: UpdateHandler,
    pub(crate) aimd: Arc<AimdController>,
    pub(crate) scheduler: Arc<FairScheduler>,
    pub(crate) sessions: Arc<Mutex<SessionManager>>,
    pub(crate) backpressure: Arc<BackpressureSignal>,
}

/// Builder for constructing a [`Weft`] fabric with custom configuration.
pub struct WeftBuilder {
    workers: Vec<Arc<dyn PersonaWorker>>,
    cfg: WeftConfig,
    router_id: String,
    agp_version: String,
    audit: Option<(std::path::PathBuf, Vec<u8>)>,
    arbiter: Option<Arc<dyn Arbiter>>,
    adaptive: bool,
}

impl Default for WeftBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WeftBuilder {
    /// Create a new builder with sensible defaults.
    ///
    /// Starts with no workers; register at least one via
    /// [`with_worker`](Self::with_worker). Defaults: router id
    /// `weft:default`, AGP 1.0, stub arbiter, no audit log, adaptive
    /// switching off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: vec![],
            cfg: WeftConfig::default(),
            router_id: "weft:default".to_string(),
            agp_version: "1.0".to_string(),
            audit: None,
            arbiter: None,
            adaptive: false,
        }
    }

    /// Register a persona worker.
    ///
    /// Workers are addressed by persona id; registering two workers for the
    /// same persona keeps the last one.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn PersonaWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, cfg: WeftConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Set the local router identity used for loop prevention
    /// (`name:cluster` derives the cluster id from the second token).
    #[must_use]
    pub fn router_id(mut self, router_id: impl Into<String>) -> Self {
        self.router_id = router_id.into();
        self
    }

    /// Set the AGP version advertised in OPEN negotiation.
    #[must_use]
    pub fn agp_version(mut self, version: impl Into<String>) -> Self {
        self.agp_version = version.into();
        self
    }

    /// Enable the HMAC-chained audit log at `path`.
    #[must_use]
    pub fn audit_log(mut self, path: impl Into<std::path::PathBuf>, secret: impl Into<Vec<u8>>) -> Self {
        self.audit = Some((path.into(), secret.into()));
        self
    }

    /// Replace the arbiter used for divergent reconciliations.
    #[must_use]
    pub fn arbiter(mut self, arbiter: Arc<dyn Arbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Enable adaptive reconciliation-policy switching.
    #[must_use]
    pub const fn adaptive_reconciliation(mut self, enabled: bool) -> Self {
        self.adaptive = enabled;
        self
    }

    /// Finalize and return the built fabric.
    ///
    /// # Errors
    /// Propagates configuration validation and audit-log failures.
    pub fn build(self) -> Result<Weft, WeftError> {
        self.cfg.validate()?;

        let backpressure = Arc::new(BackpressureSignal::default());
        let table = RouteTable::with_parts(
            self.cfg.selection.clone(),
            self.cfg.safe_mode.clone(),
            self.cfg.dampening.clone(),
            self.cfg.hold_down,
            Arc::clone(&backpressure),
        )?;
        let update_handler = UpdateHandler::new(self.router_id, self.agp_version);

        let aimd = Arc::new(AimdController::new(self.cfg.aimd));
        let scheduler = Arc::new(FairScheduler::new(
            self.cfg.scheduler.clone(),
            Arc::clone(&aimd) as Arc<dyn crate::sched::WindowSource>,
        ));

        let mut manager = SessionManager::new(self.cfg.session.clone());
        if let Some((path, secret)) = self.audit {
            manager = manager.with_audit(AuditLog::open(path, secret)?);
        }
        if let Some(arbiter) = self.arbiter {
            manager = manager.with_arbiter(arbiter);
        }
        if self.adaptive {
            manager = manager.with_adaptive_switching();
        }

        let workers = self
            .workers
            .into_iter()
            .map(|worker| (worker.persona_id().to_string(), worker))
            .collect();

        Ok(Weft {
            cfg: self.cfg,
            workers,
            table: Arc::new(RwLock::new(table)),
            update_handler,
            aimd,
            scheduler,
            sessions: Arc::new(Mutex::new(manager)),
            backpressure,
        })
    }
}

impl Weft {
    /// Start building a fabric.
    #[must_use]
    pub fn builder() -> WeftBuilder {
        WeftBuilder::new()
    }

    /// The shared route table.
    #[must_use]
    pub fn table(&self) -> &Arc<RwLock<RouteTable>> {
        &self.table
    }

    /// The AIMD controller.
    #[must_use]
    pub fn aimd(&self) -> &Arc<AimdController> {
        &self.aimd
    }

    /// The fair scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<FairScheduler> {
        &self.scheduler
    }

    /// The session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<Mutex<SessionManager>> {
        &self.sessions
    }

    /// The process-wide backpressure signal.
    #[must_use]
    pub fn backpressure(&self) -> &Arc<BackpressureSignal> {
        &self.backpressure
    }

    /// Process a peer OPEN message.
    ///
    /// # Errors
    /// See [`UpdateHandler::handle_open`].
    pub fn handle_peer_open(
        &self,
        message: &serde_json::Value,
    ) -> Result<weft_agp::OpenOutcome, WeftError> {
        self.update_handler.handle_open(message)
    }

    /// Process a peer UPDATE message against the shared table.
    ///
    /// # Errors
    /// See [`UpdateHandler::handle_update`].
    pub async fn handle_peer_update(
        &self,
        message: &serde_json::Value,
        peer_router_id: &str,
    ) -> Result<weft_agp::UpdateOutcome, WeftError> {
        let mut table = self.table.write().await;
        self.update_handler
            .handle_update(&mut table, message, peer_router_id)
    }

    /// Best route for a prefix under current federation state.
    pub async fn best_route(&self, prefix: &str) -> Option<Route> {
        self.table.read().await.get_best_route(prefix).cloned()
    }

    /// Deterministic ECMP member for a session.
    pub async fn select_route(
        &self,
        prefix: &str,
        session_id: &str,
        qos: Option<QosTier>,
    ) -> Option<Route> {
        self.table
            .read()
            .await
            .select_route_with_ecmp(prefix, session_id, qos)
            .cloned()
    }

    /// The UPDATE handler (counters, revocation feed).
    #[must_use]
    pub const fn update_handler(&self) -> &UpdateHandler {
        &self.update_handler
    }
}
