//! Shared doubles for the escrow integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use escrow_orchestrator::{
    config::{EvidenceConfig, OrchestratorConfig},
    email::{EmailGateway, EmailMessage},
    engine::TransitionEngine,
    evidence::HttpEvidenceClient,
    ip_registry::{IpRegistry, WorkDescriptor},
    ledger::{InMemoryLedger, LedgerActor},
    models::{
        AuditEntry, InitiatedMilestones, MilestonePlanRequest, MilestoneRequest, Recipient,
        ReleaseFrequency, Transaction,
    },
    notification::{Notification, NotificationGateway},
    orchestrator::Collaborators,
    EscrowError, EscrowOrchestrator, EscrowResult,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";
pub const CAROL: &str = "carol";

/// In-memory ledger that can be taken offline, made to stall or read slowly,
/// and counts transition writes that reached it
#[derive(Default)]
pub struct FlakyLedger {
    inner: InMemoryLedger,
    pub offline: AtomicBool,
    pub stall: AtomicBool,
    /// Delay before every read, in milliseconds
    pub read_delay_ms: AtomicU64,
    /// List transactions newest first instead of in creation order
    pub newest_first: AtomicBool,
    /// Plan initiated right before the next refund lands
    pub initiate_before_refund: Mutex<Option<(String, MilestonePlanRequest)>>,
    writes: AtomicUsize,
}

impl FlakyLedger {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn read_gate(&self) -> EscrowResult<()> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.gate().await
    }

    async fn gate(&self) -> EscrowResult<()> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(EscrowError::connectivity("ledger replica unreachable"));
        }
        Ok(())
    }

    async fn write_gate(&self) -> EscrowResult<()> {
        self.gate().await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LedgerActor for FlakyLedger {
    async fn get_transaction(&self, transaction_id: &str) -> EscrowResult<Option<Transaction>> {
        self.read_gate().await?;
        self.inner.get_transaction(transaction_id).await
    }

    async fn list_transactions(&self, principal: &str) -> EscrowResult<Vec<Transaction>> {
        self.read_gate().await?;
        let mut listed = self.inner.list_transactions(principal).await?;
        if self.newest_first.load(Ordering::SeqCst) {
            listed.reverse();
        }
        Ok(listed)
    }

    async fn cancel_escrow(&self, initiator: &str, transaction_id: &str) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner.cancel_escrow(initiator, transaction_id).await
    }

    async fn refund_escrow(&self, initiator: &str, transaction_index: usize) -> EscrowResult<()> {
        self.write_gate().await?;
        if let Some((caller, plan)) = self.initiate_before_refund.lock().await.take() {
            self.inner.initiate_multiple_milestones(&caller, &plan).await?;
        }
        let index = if self.newest_first.load(Ordering::SeqCst) {
            let listed = self.inner.list_transactions(initiator).await?.len();
            listed.checked_sub(transaction_index + 1).unwrap_or(listed)
        } else {
            transaction_index
        };
        self.inner.refund_escrow(initiator, index).await
    }

    async fn initiate_multiple_milestones(
        &self,
        caller: &str,
        plan: &MilestonePlanRequest,
    ) -> EscrowResult<InitiatedMilestones> {
        self.write_gate().await?;
        self.inner.initiate_multiple_milestones(caller, plan).await
    }

    async fn sign_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
        signed_document_ref: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .sign_contract(
                transaction_id,
                milestone_id,
                recipient_id,
                caller,
                signed_document_ref,
            )
            .await
    }

    async fn approve_signed_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .approve_signed_contract(transaction_id, milestone_id, caller)
            .await
    }

    async fn approve_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .approve_milestone(transaction_id, milestone_id, caller)
            .await
    }

    async fn decline_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .decline_milestone(transaction_id, milestone_id, recipient_id, caller)
            .await
    }

    async fn complete_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .complete_milestone(transaction_id, milestone_id, caller)
            .await
    }

    async fn release_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .release_milestone(transaction_id, milestone_id, caller)
            .await
    }

    async fn release_milestone_payment(
        &self,
        transaction_id: &str,
        payment_index: usize,
        caller: &str,
    ) -> EscrowResult<()> {
        self.write_gate().await?;
        self.inner
            .release_milestone_payment(transaction_id, payment_index, caller)
            .await
    }

    async fn record_attestation(&self, entry: &AuditEntry) -> EscrowResult<()> {
        self.gate().await?;
        self.inner.record_attestation(entry).await
    }

    async fn attestations(&self, transaction_id: &str) -> EscrowResult<Vec<AuditEntry>> {
        self.gate().await?;
        self.inner.attestations(transaction_id).await
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    pub published: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationGateway for RecordingNotifications {
    async fn publish(&self, notification: &Notification) -> EscrowResult<()> {
        self.published.lock().await.push(notification.clone());
        Ok(())
    }

    fn channel_prefix(&self) -> &str {
        "escrow"
    }
}

#[derive(Default)]
pub struct RecordingEmail {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl EmailGateway for RecordingEmail {
    async fn send(&self, message: &EmailMessage) -> EscrowResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EscrowError::external_api("mail provider down"));
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRegistry {
    pub works: Mutex<Vec<WorkDescriptor>>,
}

#[async_trait]
impl IpRegistry for RecordingRegistry {
    async fn register_work(&self, work: &WorkDescriptor) -> EscrowResult<String> {
        let mut works = self.works.lock().await;
        works.push(work.clone());
        Ok(format!("0xregistry{}", works.len()))
    }

    fn license(&self) -> &str {
        "cc-by-4.0"
    }

    fn work_type(&self) -> &str {
        "milestone_deliverable"
    }
}

pub struct Harness {
    pub orchestrator: EscrowOrchestrator,
    pub engine: Arc<TransitionEngine>,
    pub ledger: Arc<FlakyLedger>,
    pub notifications: Arc<RecordingNotifications>,
    pub email: Arc<RecordingEmail>,
    pub registry: Arc<RecordingRegistry>,
}

impl Harness {
    /// Orchestrator whose evidence network lives at `evidence_url`
    pub fn new(evidence_url: &str) -> Self {
        Self::with_ledger_timeout(evidence_url, 2_000)
    }

    pub fn with_ledger_timeout(evidence_url: &str, ledger_timeout_ms: u64) -> Self {
        let mut config = OrchestratorConfig::default();
        config.ledger.timeout_ms = ledger_timeout_ms;
        config.dispatcher.job_timeout_ms = 2_000;

        let ledger = Arc::new(FlakyLedger::default());
        let notifications = Arc::new(RecordingNotifications::default());
        let email = Arc::new(RecordingEmail::default());
        let registry = Arc::new(RecordingRegistry::default());
        let evidence = HttpEvidenceClient::new(EvidenceConfig {
            url: evidence_url.to_string(),
            timeout_ms: 1_000,
            ..EvidenceConfig::default()
        })
        .expect("evidence client");

        let orchestrator = EscrowOrchestrator::with_collaborators(
            &config,
            Collaborators {
                ledger: ledger.clone(),
                evidence: Arc::new(evidence),
                ip_registry: registry.clone(),
                notifications: notifications.clone(),
                email: email.clone(),
            },
        );
        let engine = orchestrator.engine();

        Self {
            orchestrator,
            engine,
            ledger,
            notifications,
            email,
            registry,
        }
    }

    /// Wait for every queued side effect
    pub async fn settle(&self) {
        assert!(
            self.orchestrator.shutdown(Duration::from_secs(10)).await,
            "side effects did not drain"
        );
    }

    pub async fn transaction(&self, transaction_id: &str) -> Transaction {
        self.engine
            .get_transaction(transaction_id)
            .await
            .expect("transaction")
    }
}

pub fn recipient(id: &str, amount_sats: u64) -> Recipient {
    Recipient {
        id: id.to_string(),
        email: Some(format!("{}@example.com", id)),
        amount_sats,
    }
}

/// Two milestones of 0.25 BTC each for Bob
pub fn half_btc_plan() -> MilestonePlanRequest {
    MilestonePlanRequest {
        title: "Album artwork".to_string(),
        initiator_email: Some("alice@example.com".to_string()),
        milestones: vec![
            MilestoneRequest {
                title: "Cover".to_string(),
                amount_sats: 25_000_000,
                frequency: ReleaseFrequency::Once,
                recipients: vec![recipient(BOB, 25_000_000)],
            },
            MilestoneRequest {
                title: "Booklet".to_string(),
                amount_sats: 25_000_000,
                frequency: ReleaseFrequency::Monthly { months: 2 },
                recipients: vec![recipient(BOB, 25_000_000)],
            },
        ],
    }
}
