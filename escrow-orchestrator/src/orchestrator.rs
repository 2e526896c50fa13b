//! Escrow Orchestrator - wires the transition engine to its collaborators
//!
//! Builds the HTTP gateways, the attestation pipeline, the side-effect
//! dispatcher and the read cache from an [`OrchestratorConfig`], around any
//! [`LedgerActor`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    attestation::AttestationPipeline,
    cache::{CacheService, TtlCache},
    config::OrchestratorConfig,
    dispatcher::{DeadLetter, SideEffectDispatcher},
    email::{EmailGateway, HttpEmailGateway},
    engine::TransitionEngine,
    evidence::{EvidenceSubmitter, HttpEvidenceClient},
    ip_registry::{HttpIpRegistryClient, IpRegistry},
    ledger::LedgerActor,
    models::Transaction,
    notification::{HttpNotificationGateway, NotificationGateway},
    recorder::AttestationRecorder,
    EscrowResult,
};

/// External collaborators of the orchestrator
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerActor>,
    pub evidence: Arc<dyn EvidenceSubmitter>,
    pub ip_registry: Arc<dyn IpRegistry>,
    pub notifications: Arc<dyn NotificationGateway>,
    pub email: Arc<dyn EmailGateway>,
}

impl Collaborators {
    /// HTTP clients for every external network, from configuration
    pub fn http(config: &OrchestratorConfig, ledger: Arc<dyn LedgerActor>) -> EscrowResult<Self> {
        Ok(Self {
            ledger,
            evidence: Arc::new(HttpEvidenceClient::new(config.evidence.clone())?),
            ip_registry: Arc::new(HttpIpRegistryClient::new(config.ip_registry.clone())?),
            notifications: Arc::new(HttpNotificationGateway::new(
                config.notifications.clone(),
            )?),
            email: Arc::new(HttpEmailGateway::new(config.email.clone())?),
        })
    }
}

/// Fully wired orchestrator
pub struct EscrowOrchestrator {
    engine: Arc<TransitionEngine>,
    dispatcher: Arc<SideEffectDispatcher>,
}

impl EscrowOrchestrator {
    /// Wire HTTP collaborators around `ledger`. Must be called inside a Tokio runtime.
    pub fn new(config: &OrchestratorConfig, ledger: Arc<dyn LedgerActor>) -> EscrowResult<Self> {
        let collaborators = Collaborators::http(config, ledger)?;
        Ok(Self::with_collaborators(config, collaborators))
    }

    pub fn with_collaborators(config: &OrchestratorConfig, collaborators: Collaborators) -> Self {
        info!("Initializing escrow orchestrator");

        let ledger_timeout = Duration::from_millis(config.ledger.timeout_ms);
        let recorder = Arc::new(AttestationRecorder::new(
            collaborators.ledger.clone(),
            ledger_timeout,
        ));
        let pipeline = Arc::new(AttestationPipeline::new(
            collaborators.evidence,
            collaborators.ip_registry,
            recorder,
            config.evidence.tags.clone(),
        ));
        let dispatcher = Arc::new(SideEffectDispatcher::start(
            &config.dispatcher,
            pipeline,
            collaborators.notifications,
            collaborators.email,
        ));
        let cache: Arc<dyn CacheService<Vec<Transaction>>> = Arc::new(TtlCache::new(
            config.cache.ttl(),
            config.cache.max_entries,
        ));
        let engine = Arc::new(TransitionEngine::new(
            collaborators.ledger,
            cache,
            dispatcher.clone(),
            ledger_timeout,
        ));

        info!(
            workers = dispatcher.worker_count(),
            ledger_timeout_ms = config.ledger.timeout_ms,
            "Escrow orchestrator initialized"
        );

        Self { engine, dispatcher }
    }

    /// Transition engine for all escrow operations
    pub fn engine(&self) -> Arc<TransitionEngine> {
        self.engine.clone()
    }

    /// Failed side effects recorded so far
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dispatcher.dead_letters().await
    }

    /// Wait for outstanding side effects before exit
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Shutting down escrow orchestrator");
        let drained = self.dispatcher.flush(grace).await;
        if drained {
            info!("Side effects drained");
        } else {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "Shutdown grace period elapsed with side effects outstanding"
            );
        }
        drained
    }
}
