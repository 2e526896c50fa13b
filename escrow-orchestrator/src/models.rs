//! Core data models for the escrow orchestrator
//!
//! Transactions and milestones are owned by the ledger; the orchestrator only
//! works on clones returned by ledger reads. This module holds those shapes,
//! the lifecycle state machines, and the ephemeral event/evidence records
//! that feed the attestation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{error::EscrowError, EscrowResult};

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created but not yet submitted
    Draft,
    /// Awaiting recipient signatures / client approval
    Pending,
    /// At least one milestone contract approved
    Confirmed,
    /// Display-only: raw status says released but payments are outstanding
    Ongoing,
    /// All funds released
    Released,
    /// Cancelled by the initiator
    Cancelled,
    /// Declined by the recipients
    Declined,
    /// Funds returned to the initiator
    Refund,
}

impl TransactionStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Released | Self::Cancelled | Self::Declined | Self::Refund
        )
    }
}

/// Milestone sub-state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Created,
    /// Contracts issued, waiting for every recipient to sign
    ContractPending,
    /// Every recipient signed, waiting for the client
    ContractSigned,
    /// Client approved the signed contract; payments may be released
    Approved,
    /// At least one payment released
    PaymentReleased,
    Completed,
    Declined,
}

impl MilestoneStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Declined)
    }

    /// Check if this state allows recipient signatures
    pub fn can_sign_contract(&self) -> bool {
        matches!(self, Self::ContractPending)
    }

    /// Check if this state allows the client to approve the signed contract
    pub fn can_approve_contract(&self) -> bool {
        matches!(self, Self::ContractSigned)
    }

    /// Check if this state allows payment approval and release
    pub fn accepts_releases(&self) -> bool {
        matches!(self, Self::Approved | Self::PaymentReleased)
    }

    /// Check if this state allows the recipient to decline
    pub fn can_decline(&self) -> bool {
        matches!(self, Self::ContractPending | Self::Approved)
    }
}

/// How a milestone's allocation is paid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReleaseFrequency {
    /// Single payment
    Once,
    /// One payment per month
    Monthly { months: u32 },
}

impl ReleaseFrequency {
    /// Number of release payments this frequency produces
    pub fn payment_count(&self) -> u32 {
        match self {
            Self::Once => 1,
            Self::Monthly { months } => *months,
        }
    }
}

/// A party receiving funds, with its allocation share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub email: Option<String>,
    pub amount_sats: u64,
}

/// Per-recipient contract signature record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSignature {
    pub recipient_id: String,
    pub signed_document_ref: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
}

impl ContractSignature {
    pub fn is_signed(&self) -> bool {
        self.signed_at.is_some()
    }
}

/// One scheduled payment of a milestone (index doubles as the month number)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePayment {
    pub index: u32,
    pub released_at: Option<DateTime<Utc>>,
}

impl ReleasePayment {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Sub-agreement within a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    pub amount_sats: u64,
    pub frequency: ReleaseFrequency,
    pub recipients: Vec<Recipient>,
    pub signatures: Vec<ContractSignature>,
    pub payments: Vec<ReleasePayment>,
    pub status: MilestoneStatus,
    /// Set by the client's work approval, consumed by the next release
    pub work_approved: bool,
    pub created_at: DateTime<Utc>,
}

impl Milestone {
    /// A milestone is fully released iff every expected payment has a release timestamp
    pub fn is_fully_released(&self) -> bool {
        !self.payments.is_empty() && self.payments.iter().all(ReleasePayment::is_released)
    }

    /// Check whether `id` is one of this milestone's recipients
    pub fn is_recipient(&self, id: &str) -> bool {
        self.recipients.iter().any(|r| r.id == id)
    }

    /// Check whether every recipient has signed the contract
    pub fn all_signed(&self) -> bool {
        !self.signatures.is_empty() && self.signatures.iter().all(ContractSignature::is_signed)
    }

    /// First payment that has not been released yet
    pub fn next_unreleased_payment(&self) -> Option<&ReleasePayment> {
        self.payments.iter().find(|p| !p.is_released())
    }

    /// Validate a sub-state transition
    pub fn validate_transition(&self, to_state: MilestoneStatus) -> EscrowResult<()> {
        let valid = match (&self.status, &to_state) {
            (MilestoneStatus::Created, MilestoneStatus::ContractPending) => true,
            (MilestoneStatus::ContractPending, MilestoneStatus::ContractSigned) => true,
            (MilestoneStatus::ContractPending, MilestoneStatus::Declined) => true,
            (MilestoneStatus::ContractSigned, MilestoneStatus::Approved) => true,
            (MilestoneStatus::Approved, MilestoneStatus::PaymentReleased) => true,
            (MilestoneStatus::Approved, MilestoneStatus::Declined) => true,
            (MilestoneStatus::PaymentReleased, MilestoneStatus::PaymentReleased) => true,
            (MilestoneStatus::PaymentReleased, MilestoneStatus::Completed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(EscrowError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to_state),
                "Invalid milestone transition".to_string(),
            ))
        }
    }
}

/// Ordered milestones belonging to one transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestonePlan {
    pub milestones: Vec<Milestone>,
}

/// Escrow agreement as stored on the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub title: String,
    pub initiator: String,
    pub initiator_email: Option<String>,
    pub recipients: Vec<Recipient>,
    pub funds_allocated_sats: u64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub milestone_plan: Option<MilestonePlan>,
}

impl Transaction {
    /// Build a pending transaction with freshly issued milestones from a plan.
    ///
    /// Ids are supplied by the ledger; `milestone_ids` must line up with
    /// `plan.milestones`.
    pub fn from_plan(
        id: String,
        milestone_ids: &[String],
        initiator: &str,
        plan: &MilestonePlanRequest,
    ) -> Self {
        let now = Utc::now();
        let milestones: Vec<Milestone> = plan
            .milestones
            .iter()
            .zip(milestone_ids)
            .map(|(request, milestone_id)| Milestone {
                id: milestone_id.clone(),
                title: request.title.clone(),
                amount_sats: request.amount_sats,
                frequency: request.frequency,
                recipients: request.recipients.clone(),
                signatures: request
                    .recipients
                    .iter()
                    .map(|r| ContractSignature {
                        recipient_id: r.id.clone(),
                        signed_document_ref: None,
                        signed_at: None,
                    })
                    .collect(),
                payments: (1..=request.frequency.payment_count())
                    .map(|index| ReleasePayment {
                        index,
                        released_at: None,
                    })
                    .collect(),
                status: MilestoneStatus::Created,
                work_approved: false,
                created_at: now,
            })
            .collect();

        // Aggregate shares per recipient across the plan, first appearance wins ordering
        let mut recipients: Vec<Recipient> = Vec::new();
        for recipient in milestones.iter().flat_map(|m| m.recipients.iter()) {
            match recipients.iter_mut().find(|r| r.id == recipient.id) {
                Some(existing) => existing.amount_sats += recipient.amount_sats,
                None => recipients.push(recipient.clone()),
            }
        }

        Self {
            id,
            title: plan.title.clone(),
            initiator: initiator.to_string(),
            initiator_email: plan.initiator_email.clone(),
            recipients,
            funds_allocated_sats: milestones.iter().map(|m| m.amount_sats).sum(),
            status: TransactionStatus::Pending,
            created_at: now,
            milestone_plan: Some(MilestonePlan { milestones }),
        }
    }

    /// Status as it should be displayed.
    ///
    /// A milestone transaction reported as released is downgraded to ongoing
    /// while any non-declined milestone still has unreleased payments.
    pub fn effective_status(&self) -> TransactionStatus {
        match (&self.status, &self.milestone_plan) {
            (TransactionStatus::Released, Some(plan))
                if plan
                    .milestones
                    .iter()
                    .filter(|m| m.status != MilestoneStatus::Declined)
                    .any(|m| !m.is_fully_released()) =>
            {
                TransactionStatus::Ongoing
            }
            _ => self.status,
        }
    }

    pub fn milestones(&self) -> &[Milestone] {
        self.milestone_plan
            .as_ref()
            .map(|plan| plan.milestones.as_slice())
            .unwrap_or(&[])
    }

    pub fn milestone(&self, milestone_id: &str) -> Option<&Milestone> {
        self.milestones().iter().find(|m| m.id == milestone_id)
    }

    pub fn milestone_mut(&mut self, milestone_id: &str) -> Option<&mut Milestone> {
        self.milestone_plan
            .as_mut()?
            .milestones
            .iter_mut()
            .find(|m| m.id == milestone_id)
    }

    /// Resolve a plan-wide payment index to `(milestone position, payment position)`.
    ///
    /// Payments are counted across milestones in plan order.
    pub fn locate_payment(&self, payment_index: usize) -> Option<(usize, usize)> {
        let mut remaining = payment_index;
        for (milestone_pos, milestone) in self.milestones().iter().enumerate() {
            if remaining < milestone.payments.len() {
                return Some((milestone_pos, remaining));
            }
            remaining -= milestone.payments.len();
        }
        None
    }

    /// Every identity involved in this transaction, initiator first
    pub fn parties(&self) -> Vec<String> {
        let mut parties = vec![self.initiator.clone()];
        let recipient_ids = self
            .recipients
            .iter()
            .chain(self.milestones().iter().flat_map(|m| m.recipients.iter()))
            .map(|r| &r.id);
        for id in recipient_ids {
            if !parties.contains(id) {
                parties.push(id.clone());
            }
        }
        parties
    }

    /// Email address known for a party, if any
    pub fn email_for(&self, party: &str) -> Option<&str> {
        if party == self.initiator {
            return self.initiator_email.as_deref();
        }
        self.recipients
            .iter()
            .chain(self.milestones().iter().flat_map(|m| m.recipients.iter()))
            .find(|r| r.id == party)
            .and_then(|r| r.email.as_deref())
    }
}

/// Request to create a transaction with its milestone plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestonePlanRequest {
    pub title: String,
    pub initiator_email: Option<String>,
    pub milestones: Vec<MilestoneRequest>,
}

/// One milestone of a plan request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneRequest {
    pub title: String,
    pub amount_sats: u64,
    pub frequency: ReleaseFrequency,
    pub recipients: Vec<Recipient>,
}

/// Ids assigned by the ledger for a newly initiated plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedMilestones {
    pub transaction_id: String,
    pub milestone_ids: Vec<String>,
}

/// Event type tags for transitions and their attestations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowEventType {
    MilestonesInitiated,
    MilestoneContractSigned,
    MilestoneContractApproved,
    MilestoneApproved,
    MilestoneDeclined,
    MilestoneCompleted,
    MilestoneReleased,
    MilestonePaymentReleased,
    EscrowCancelled,
    EscrowRefunded,
    ApproveAttest,
    ReleaseAttest,
    CompleteAttest,
}

impl EscrowEventType {
    /// Stable wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MilestonesInitiated => "milestones_initiated",
            Self::MilestoneContractSigned => "milestone_contract_signed",
            Self::MilestoneContractApproved => "milestone_contract_approved",
            Self::MilestoneApproved => "milestone_approved",
            Self::MilestoneDeclined => "milestone_declined",
            Self::MilestoneCompleted => "milestone_completed",
            Self::MilestoneReleased => "milestone_released",
            Self::MilestonePaymentReleased => "milestone_payment_released",
            Self::EscrowCancelled => "escrow_cancelled",
            Self::EscrowRefunded => "escrow_refunded",
            Self::ApproveAttest => "approve_attest",
            Self::ReleaseAttest => "release_attest",
            Self::CompleteAttest => "complete_attest",
        }
    }

    /// Audit event type used when the creative work behind this event is
    /// registered with the IP registry
    pub fn ip_attestation_type(&self) -> Option<EscrowEventType> {
        match self {
            Self::MilestoneApproved => Some(Self::ApproveAttest),
            Self::MilestoneReleased => Some(Self::ReleaseAttest),
            Self::MilestoneCompleted => Some(Self::CompleteAttest),
            _ => None,
        }
    }
}

impl fmt::Display for EscrowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one transition, only ever canonicalized and hashed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub event_type: EscrowEventType,
    pub escrow_id: String,
    pub milestone_id: Option<String>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl EscrowEvent {
    pub fn new(
        event_type: EscrowEventType,
        escrow_id: &str,
        milestone_id: Option<&str>,
        actor: &str,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            escrow_id: escrow_id.to_string(),
            milestone_id: milestone_id.map(str::to_string),
            actor: actor.to_string(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Result of one evidence submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub accepted: bool,
    pub fingerprint: String,
    pub event_id: Option<String>,
    pub document_ref: Option<String>,
    pub message: Option<String>,
}

/// Attestation-to-ledger link, an append-only audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub transaction_id: String,
    pub event_type: String,
    pub fingerprint: String,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

/// A transition that the ledger accepted, handed to the side-effect dispatcher
#[derive(Debug, Clone)]
pub struct CompletedTransition {
    pub event: EscrowEvent,
    /// Snapshot of the transaction taken after the ledger write
    pub transaction: Transaction,
}
