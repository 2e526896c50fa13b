//! Transition Engine - validates and executes escrow state transitions
//!
//! Every operation follows the same path:
//! 1. validate the request shape,
//! 2. read a snapshot from the ledger and dry-run the lifecycle rules on it,
//!    so unauthorized or out-of-state requests never reach the ledger,
//! 3. perform exactly one ledger call, bounded by the ledger timeout,
//! 4. invalidate cached reads of every party, read the transaction back from
//!    the ledger and hand that copy to the side-effect dispatcher.
//!
//! The dry-run copy only gates the request; callers and side effects always
//! see the state the ledger stored.
//!
//! Side effects never influence the result returned to the caller.

use bitcoin::Amount;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::CacheService,
    dispatcher::SideEffectDispatcher,
    error::EscrowError,
    ledger::LedgerActor,
    lifecycle,
    models::{
        AuditEntry, CompletedTransition, EscrowEvent, EscrowEventType, InitiatedMilestones,
        MilestonePlanRequest, ReleaseFrequency, Transaction,
    },
    EscrowResult,
};

/// One page of a principal's transactions
#[derive(Debug, Clone)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

/// Executes ledger transitions and triggers their side effects
pub struct TransitionEngine {
    ledger: Arc<dyn LedgerActor>,
    cache: Arc<dyn CacheService<Vec<Transaction>>>,
    dispatcher: Arc<SideEffectDispatcher>,
    ledger_timeout: Duration,
}

impl TransitionEngine {
    pub fn new(
        ledger: Arc<dyn LedgerActor>,
        cache: Arc<dyn CacheService<Vec<Transaction>>>,
        dispatcher: Arc<SideEffectDispatcher>,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            dispatcher,
            ledger_timeout,
        }
    }

    /// Cancel a pre-terminal transaction
    pub async fn cancel(&self, initiator: &str, transaction_id: &str) -> EscrowResult<Transaction> {
        validate_id("initiator", initiator)?;
        validate_id("transaction id", transaction_id)?;

        let mut working = self.snapshot(transaction_id).await?;
        lifecycle::cancel(&mut working, initiator)?;

        self.ledger_call("cancel_escrow", self.ledger.cancel_escrow(initiator, transaction_id))
            .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let event = EscrowEvent::new(
            EscrowEventType::EscrowCancelled,
            transaction_id,
            None,
            initiator,
            serde_json::json!({ "funds_allocated_sats": transaction.funds_allocated_sats }),
        );
        self.complete(event, transaction).await
    }

    /// Refund the transaction at `transaction_index` of the initiator's list and return its id.
    ///
    /// The index addresses the list as the ledger orders it; the cached copy
    /// is dropped first so the lookup reads fresh state. After the write the
    /// list is read again and the id at the same index is the one reported.
    pub async fn refund(&self, initiator: &str, transaction_index: usize) -> EscrowResult<String> {
        validate_id("initiator", initiator)?;

        self.cache.invalidate(&list_key(initiator)).await;
        let listed = self
            .ledger_call("list_transactions", self.ledger.list_transactions(initiator))
            .await?;
        let mut working = listed.into_iter().nth(transaction_index).ok_or_else(|| {
            EscrowError::not_found(format!(
                "No transaction at index {} for {}",
                transaction_index, initiator
            ))
        })?;
        lifecycle::refund(&mut working, initiator)?;

        self.ledger_call(
            "refund_escrow",
            self.ledger.refund_escrow(initiator, transaction_index),
        )
        .await?;

        for party in working.parties() {
            self.cache.invalidate(&list_key(&party)).await;
        }
        let relisted = self
            .ledger_call("list_transactions", self.ledger.list_transactions(initiator))
            .await?;
        let transaction = match relisted.into_iter().nth(transaction_index) {
            Some(found) if found.id == working.id => found,
            Some(found) => {
                warn!(
                    initiator = %initiator,
                    transaction_index,
                    checked = %working.id,
                    refunded = %found.id,
                    "Refund index moved between validation and write"
                );
                for party in found.parties() {
                    self.cache.invalidate(&list_key(&party)).await;
                }
                found
            }
            None => {
                warn!(
                    initiator = %initiator,
                    transaction_index,
                    checked = %working.id,
                    "Refund index no longer resolves after write"
                );
                self.snapshot(&working.id).await?
            }
        };

        let transaction_id = transaction.id.clone();
        let event = EscrowEvent::new(
            EscrowEventType::EscrowRefunded,
            &transaction_id,
            None,
            initiator,
            serde_json::json!({
                "transaction_index": transaction_index,
                "funds_allocated_sats": transaction.funds_allocated_sats,
            }),
        );
        self.complete(event, transaction).await?;
        Ok(transaction_id)
    }

    /// Create a transaction and its milestones; the caller becomes the client
    pub async fn initiate_multiple_milestones(
        &self,
        caller: &str,
        plan: &MilestonePlanRequest,
    ) -> EscrowResult<InitiatedMilestones> {
        validate_id("caller", caller)?;
        validate_plan(plan)?;

        info!(
            caller = %caller,
            milestones = plan.milestones.len(),
            "Initiating milestone transaction: {}",
            plan.title
        );

        let created = self
            .ledger_call(
                "initiate_multiple_milestones",
                self.ledger.initiate_multiple_milestones(caller, plan),
            )
            .await?;
        if created.milestone_ids.len() != plan.milestones.len() {
            return Err(EscrowError::internal(format!(
                "Ledger returned {} milestone ids for {} milestones",
                created.milestone_ids.len(),
                plan.milestones.len()
            )));
        }

        let mut parties = vec![caller.to_string()];
        parties.extend(
            plan.milestones
                .iter()
                .flat_map(|m| m.recipients.iter().map(|r| r.id.clone())),
        );
        let transaction = self.settle(&created.transaction_id, &parties).await?;

        let event = EscrowEvent::new(
            EscrowEventType::MilestonesInitiated,
            &created.transaction_id,
            None,
            caller,
            serde_json::json!({
                "milestone_ids": created.milestone_ids,
                "funds_allocated_sats": transaction.funds_allocated_sats,
            }),
        );
        self.complete(event, transaction).await?;
        Ok(created)
    }

    /// Record a recipient's signature on the milestone contract
    pub async fn recipient_sign_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
        signed_document_ref: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("milestone id", milestone_id)?;
        validate_id("recipient id", recipient_id)?;
        validate_id("caller", caller)?;
        validate_document_ref(signed_document_ref)?;

        let mut working = self.snapshot(transaction_id).await?;
        lifecycle::sign_contract(
            &mut working,
            milestone_id,
            recipient_id,
            caller,
            signed_document_ref,
            Utc::now(),
        )?;

        self.ledger_call(
            "sign_contract",
            self.ledger.sign_contract(
                transaction_id,
                milestone_id,
                recipient_id,
                caller,
                signed_document_ref,
            ),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let all_signed = transaction
            .milestone(milestone_id)
            .map(|m| m.all_signed())
            .unwrap_or(false);
        let event = EscrowEvent::new(
            EscrowEventType::MilestoneContractSigned,
            transaction_id,
            Some(milestone_id),
            caller,
            serde_json::json!({
                "signed_document_ref": signed_document_ref,
                "all_signed": all_signed,
            }),
        );
        self.complete(event, transaction).await
    }

    /// Client approves a fully signed milestone contract
    pub async fn client_approved_signed_contract(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("milestone id", milestone_id)?;
        validate_id("caller", caller)?;

        let mut working = self.snapshot(transaction_id).await?;
        lifecycle::approve_signed_contract(&mut working, milestone_id, caller)?;

        self.ledger_call(
            "approve_signed_contract",
            self.ledger.approve_signed_contract(transaction_id, milestone_id, caller),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let event = EscrowEvent::new(
            EscrowEventType::MilestoneContractApproved,
            transaction_id,
            Some(milestone_id),
            caller,
            serde_json::json!({ "transaction_status": transaction.status }),
        );
        self.complete(event, transaction).await
    }

    /// Client approves the delivered work, unlocking the next release
    pub async fn approve_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("milestone id", milestone_id)?;
        validate_id("caller", caller)?;

        let mut working = self.snapshot(transaction_id).await?;
        lifecycle::approve_milestone(&mut working, milestone_id, caller)?;

        self.ledger_call(
            "approve_milestone",
            self.ledger.approve_milestone(transaction_id, milestone_id, caller),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let event = EscrowEvent::new(
            EscrowEventType::MilestoneApproved,
            transaction_id,
            Some(milestone_id),
            caller,
            serde_json::json!({}),
        );
        self.complete(event, transaction).await
    }

    /// A recipient declines the milestone
    pub async fn decline_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        recipient_id: &str,
        caller: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("milestone id", milestone_id)?;
        validate_id("recipient id", recipient_id)?;
        validate_id("caller", caller)?;

        let mut working = self.snapshot(transaction_id).await?;
        lifecycle::decline_milestone(&mut working, milestone_id, recipient_id, caller)?;

        self.ledger_call(
            "decline_milestone",
            self.ledger.decline_milestone(transaction_id, milestone_id, recipient_id, caller),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let event = EscrowEvent::new(
            EscrowEventType::MilestoneDeclined,
            transaction_id,
            Some(milestone_id),
            caller,
            serde_json::json!({ "transaction_status": transaction.status }),
        );
        self.complete(event, transaction).await
    }

    /// Release the next payment of an approved milestone
    pub async fn release_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("milestone id", milestone_id)?;
        validate_id("caller", caller)?;

        let mut working = self.snapshot(transaction_id).await?;
        let expected =
            lifecycle::release_milestone(&mut working, milestone_id, caller, Utc::now())?;

        self.ledger_call(
            "release_milestone",
            self.ledger.release_milestone(transaction_id, milestone_id, caller),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        // Latest release on the ledger's copy
        let payment = transaction
            .milestone(milestone_id)
            .and_then(|m| {
                m.payments
                    .iter()
                    .filter(|p| p.is_released())
                    .max_by_key(|p| p.released_at)
            })
            .map(|p| p.index)
            .unwrap_or(expected);
        let event = EscrowEvent::new(
            EscrowEventType::MilestoneReleased,
            transaction_id,
            Some(milestone_id),
            caller,
            serde_json::json!({ "payment": payment }),
        );
        self.complete(event, transaction).await
    }

    /// Release one scheduled payment, indexed across the whole plan
    pub async fn client_release_milestone_payment(
        &self,
        transaction_id: &str,
        payment_index: usize,
        caller: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("caller", caller)?;

        let mut working = self.snapshot(transaction_id).await?;
        let milestone_id =
            lifecycle::release_payment(&mut working, payment_index, caller, Utc::now())?;

        self.ledger_call(
            "release_milestone_payment",
            self.ledger.release_milestone_payment(transaction_id, payment_index, caller),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let event = EscrowEvent::new(
            EscrowEventType::MilestonePaymentReleased,
            transaction_id,
            Some(&milestone_id),
            caller,
            serde_json::json!({ "payment_index": payment_index }),
        );
        self.complete(event, transaction).await
    }

    /// A recipient marks a fully released milestone as completed
    pub async fn complete_milestone(
        &self,
        transaction_id: &str,
        milestone_id: &str,
        caller: &str,
    ) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        validate_id("milestone id", milestone_id)?;
        validate_id("caller", caller)?;

        let mut working = self.snapshot(transaction_id).await?;
        lifecycle::complete_milestone(&mut working, milestone_id, caller)?;

        self.ledger_call(
            "complete_milestone",
            self.ledger.complete_milestone(transaction_id, milestone_id, caller),
        )
        .await?;

        let transaction = self.settle(transaction_id, &working.parties()).await?;
        let event = EscrowEvent::new(
            EscrowEventType::MilestoneCompleted,
            transaction_id,
            Some(milestone_id),
            caller,
            serde_json::json!({ "transaction_status": transaction.status }),
        );
        self.complete(event, transaction).await
    }

    /// Fetch one transaction straight from the ledger
    pub async fn get_transaction(&self, transaction_id: &str) -> EscrowResult<Transaction> {
        validate_id("transaction id", transaction_id)?;
        self.snapshot(transaction_id).await
    }

    /// Page through the transactions a principal takes part in
    pub async fn list_transactions(
        &self,
        principal: &str,
        page: usize,
        page_size: usize,
    ) -> EscrowResult<TransactionPage> {
        validate_id("principal", principal)?;
        if page_size == 0 {
            return Err(EscrowError::validation("Page size must be greater than 0"));
        }

        let key = list_key(principal);
        let transactions = match self.cache.get(&key).await {
            Some(cached) => {
                debug!(principal = %principal, "Transaction list served from cache");
                cached
            }
            None => {
                let fresh = self
                    .ledger_call("list_transactions", self.ledger.list_transactions(principal))
                    .await?;
                self.cache.set(&key, fresh.clone()).await;
                fresh
            }
        };

        let total = transactions.len();
        let transactions = transactions
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(TransactionPage {
            transactions,
            page,
            page_size,
            total,
        })
    }

    /// Attestation links recorded for a transaction
    pub async fn audit_trail(&self, transaction_id: &str) -> EscrowResult<Vec<AuditEntry>> {
        validate_id("transaction id", transaction_id)?;
        self.ledger_call("attestations", self.ledger.attestations(transaction_id))
            .await
    }

    async fn snapshot(&self, transaction_id: &str) -> EscrowResult<Transaction> {
        self.ledger_call("get_transaction", self.ledger.get_transaction(transaction_id))
            .await?
            .ok_or_else(|| {
                EscrowError::not_found(format!("Transaction {} not found", transaction_id))
            })
    }

    /// Await one ledger call; expiry of the ledger timeout is a connectivity failure
    async fn ledger_call<T, F>(&self, operation: &str, call: F) -> EscrowResult<T>
    where
        F: Future<Output = EscrowResult<T>>,
    {
        match tokio::time::timeout(self.ledger_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(operation, error = %e, "Ledger call failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.ledger_timeout.as_millis() as u64,
                    "Ledger call timed out"
                );
                Err(EscrowError::connectivity(format!(
                    "Ledger call {} timed out after {} ms",
                    operation,
                    self.ledger_timeout.as_millis()
                )))
            }
        }
    }

    /// Drop cached lists of `parties` and read back the ledger's copy after a write
    async fn settle(&self, transaction_id: &str, parties: &[String]) -> EscrowResult<Transaction> {
        for party in parties {
            self.cache.invalidate(&list_key(party)).await;
        }
        self.snapshot(transaction_id).await
    }

    /// Fan out side effects of an accepted transition
    async fn complete(
        &self,
        event: EscrowEvent,
        transaction: Transaction,
    ) -> EscrowResult<Transaction> {
        info!(
            event_type = %event.event_type,
            transaction_id = %event.escrow_id,
            actor = %event.actor,
            status = ?transaction.effective_status(),
            "Transition accepted by ledger"
        );

        let transition = CompletedTransition { event, transaction };
        self.dispatcher.dispatch(&transition).await;
        Ok(transition.transaction)
    }
}

fn list_key(principal: &str) -> String {
    format!("transactions:{}", principal)
}

fn validate_id(field: &str, value: &str) -> EscrowResult<()> {
    if value.trim().is_empty() {
        return Err(EscrowError::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

fn validate_document_ref(signed_document_ref: &str) -> EscrowResult<()> {
    Uuid::parse_str(signed_document_ref).map_err(|_| {
        EscrowError::validation(format!(
            "Signed document reference {} is not a UUID",
            signed_document_ref
        ))
    })?;
    Ok(())
}

/// Shape checks for a milestone plan
fn validate_plan(plan: &MilestonePlanRequest) -> EscrowResult<()> {
    if plan.title.trim().is_empty() {
        return Err(EscrowError::validation("Title cannot be empty"));
    }
    if plan.milestones.is_empty() {
        return Err(EscrowError::validation("At least one milestone is required"));
    }

    let mut total: u64 = 0;
    for (position, milestone) in plan.milestones.iter().enumerate() {
        let label = format!("Milestone {}", position + 1);
        if milestone.title.trim().is_empty() {
            return Err(EscrowError::validation(format!("{} needs a title", label)));
        }
        if milestone.amount_sats == 0 {
            return Err(EscrowError::validation(format!(
                "{} amount must be greater than 0",
                label
            )));
        }
        if let ReleaseFrequency::Monthly { months: 0 } = milestone.frequency {
            return Err(EscrowError::validation(format!(
                "{} must release over at least one month",
                label
            )));
        }
        if milestone.recipients.is_empty() {
            return Err(EscrowError::validation(format!(
                "{} needs at least one recipient",
                label
            )));
        }

        let mut seen = HashSet::new();
        let mut shares: u64 = 0;
        for recipient in &milestone.recipients {
            validate_id("recipient id", &recipient.id)?;
            if !seen.insert(recipient.id.as_str()) {
                return Err(EscrowError::validation(format!(
                    "{} lists recipient {} twice",
                    label, recipient.id
                )));
            }
            if recipient.amount_sats == 0 {
                return Err(EscrowError::validation(format!(
                    "{} allocates nothing to {}",
                    label, recipient.id
                )));
            }
            shares = shares.checked_add(recipient.amount_sats).ok_or_else(|| {
                EscrowError::validation(format!("{} recipient shares overflow", label))
            })?;
        }
        if shares != milestone.amount_sats {
            return Err(EscrowError::validation(format!(
                "{} recipient shares ({} sats) do not add up to its amount ({} sats)",
                label, shares, milestone.amount_sats
            )));
        }

        total = total
            .checked_add(milestone.amount_sats)
            .ok_or_else(|| EscrowError::validation("Plan total overflows"))?;
    }

    if Amount::from_sat(total) > Amount::MAX_MONEY {
        return Err(EscrowError::validation(format!(
            "Plan total {} sats exceeds the bitcoin money supply",
            total
        )));
    }
    Ok(())
}
