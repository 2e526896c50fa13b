//! Ledger actor surface
//!
//! The ledger (a canister in production) owns every transaction and
//! milestone. [`LedgerActor`] is the surface the orchestrator consumes:
//! transitions, reads, and the append-only attestation audit trail.
//! [`InMemoryLedger`] implements it with in-process storage for tests and
//! local runs, applying the same rules as the engine atomically per call.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::EscrowError,
    lifecycle,
    models::{AuditEntry, InitiatedMilestones, MilestonePlanRequest, Transaction},
    EscrowResult,
};

/// Operations exposed by the authoritative ledger
#[async_trait]
pub trait LedgerActor: Send + Sync {
    /// Fetch one transaction
    async fn get_transaction(&self, transaction_id: &str) -> EscrowResult<Option<Transaction>>;

    /// Transactions where `principal` is initiator or recipient, in creation order
    async fn list_transactions(&self, principal: &str) -> EscrowResult<Vec<Transaction>>;

    async fn cancel_escrow(&self, initiator: &str, transaction_id: &str) -> EscrowResult<()>;

    /// Refund the transaction at `transaction_index` of the initiator's list
    async fn refund_escrow(&self, initiator: &str, transaction_index: usize) -> EscrowResult<()>;

    async fn initiate_multiple_milestones(
        &self,
        caller: &str,
        plan: &MilestonePlanRequest,
    ) -> EscrowResult<InitiatedMilestones>;

    async fn sign_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
        signed_document_ref: &str,
    ) -> EscrowResult<()>;

    async fn approve_signed_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()>;

    async fn approve_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()>;

    async fn decline_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
    ) -> EscrowResult<()>;

    async fn complete_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()>;

    async fn release_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()>;

    async fn release_milestone_payment(
        &self,
        transaction_id: &str,
        payment_index: usize,
        caller: &str,
    ) -> EscrowResult<()>;

    /// Append an attestation link to the audit trail
    async fn record_attestation(&self, entry: &AuditEntry) -> EscrowResult<()>;

    /// Audit entries recorded for a transaction
    async fn attestations(&self, transaction_id: &str) -> EscrowResult<Vec<AuditEntry>>;
}

/// In-process ledger
#[derive(Default)]
pub struct InMemoryLedger {
    /// Insertion order is creation order
    transactions: Arc<RwLock<Vec<Transaction>>>,
    audit_log: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `apply` to a copy of the stored transaction and commit only on success
    async fn mutate<R, F>(&self, transaction_id: &str, apply: F) -> EscrowResult<R>
    where
        F: FnOnce(&mut Transaction) -> EscrowResult<R> + Send,
        R: Send,
    {
        let mut transactions = self.transactions.write().await;
        let stored = transactions
            .iter_mut()
            .find(|tx| tx.id == transaction_id)
            .ok_or_else(|| {
                EscrowError::not_found(format!("Transaction {} not found", transaction_id))
            })?;

        let mut working = stored.clone();
        let result = apply(&mut working)?;
        *stored = working;
        Ok(result)
    }

    fn involves(tx: &Transaction, principal: &str) -> bool {
        tx.parties().iter().any(|party| party == principal)
    }
}

#[async_trait]
impl LedgerActor for InMemoryLedger {
    async fn get_transaction(&self, transaction_id: &str) -> EscrowResult<Option<Transaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .find(|tx| tx.id == transaction_id)
            .cloned())
    }

    async fn list_transactions(&self, principal: &str) -> EscrowResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|tx| Self::involves(tx, principal))
            .cloned()
            .collect())
    }

    async fn cancel_escrow(&self, initiator: &str, transaction_id: &str) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| lifecycle::cancel(tx, initiator))
            .await
    }

    async fn refund_escrow(&self, initiator: &str, transaction_index: usize) -> EscrowResult<()> {
        let mut transactions = self.transactions.write().await;
        let stored = transactions
            .iter_mut()
            .filter(|tx| Self::involves(tx, initiator))
            .nth(transaction_index)
            .ok_or_else(|| {
                EscrowError::not_found(format!(
                    "No transaction at index {} for {}",
                    transaction_index, initiator
                ))
            })?;

        let mut working = stored.clone();
        lifecycle::refund(&mut working, initiator)?;
        *stored = working;
        Ok(())
    }

    async fn initiate_multiple_milestones(
        &self,
        caller: &str,
        plan: &MilestonePlanRequest,
    ) -> EscrowResult<InitiatedMilestones> {
        let transaction_id = Uuid::new_v4().to_string();
        let milestone_ids: Vec<String> = plan
            .milestones
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        let mut transaction =
            Transaction::from_plan(transaction_id.clone(), &milestone_ids, caller, plan);
        lifecycle::issue_contracts(&mut transaction)?;
        self.transactions.write().await.push(transaction);

        info!(
            transaction_id = %transaction_id,
            milestones = milestone_ids.len(),
            "Ledger created milestone transaction"
        );

        Ok(InitiatedMilestones {
            transaction_id,
            milestone_ids,
        })
    }

    async fn sign_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
        signed_document_ref: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::sign_contract(
                tx,
                milestone_id,
                recipient_id,
                caller,
                signed_document_ref,
                Utc::now(),
            )
        })
        .await
    }

    async fn approve_signed_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::approve_signed_contract(tx, milestone_id, caller)
        })
        .await
    }

    async fn approve_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::approve_milestone(tx, milestone_id, caller)
        })
        .await
    }

    async fn decline_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::decline_milestone(tx, milestone_id, recipient_id, caller)
        })
        .await
    }

    async fn complete_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::complete_milestone(tx, milestone_id, caller)
        })
        .await
    }

    async fn release_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::release_milestone(tx, milestone_id, caller, Utc::now()).map(|_| ())
        })
        .await
    }

    async fn release_milestone_payment(
        &self,
        transaction_id: &str,
        payment_index: usize,
        caller: &str,
    ) -> EscrowResult<()> {
        self.mutate(transaction_id, |tx| {
            lifecycle::release_payment(tx, payment_index, caller, Utc::now()).map(|_| ())
        })
        .await
    }

    async fn record_attestation(&self, entry: &AuditEntry) -> EscrowResult<()> {
        self.audit_log.write().await.push(entry.clone());
        Ok(())
    }

    async fn attestations(&self, transaction_id: &str) -> EscrowResult<Vec<AuditEntry>> {
        Ok(self
            .audit_log
            .read()
            .await
            .iter()
            .filter(|entry| entry.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}
