//! Transition rules shared by the engine and the in-memory ledger
//!
//! Each function checks existence, then caller authorization, then lifecycle
//! state, and only then mutates the given transaction. The engine runs them
//! against a snapshot to reject bad requests locally; a ledger runs them
//! against its stored copy inside one atomic write.

use chrono::{DateTime, Utc};

use crate::{
    error::EscrowError,
    models::{Milestone, MilestoneStatus, Transaction, TransactionStatus},
    EscrowResult,
};

fn ensure_open(tx: &Transaction, to_state: &str) -> EscrowResult<()> {
    if tx.status.is_terminal() {
        return Err(EscrowError::state_transition(
            format!("{:?}", tx.status),
            to_state.to_string(),
            format!("Transaction {} is already closed", tx.id),
        ));
    }
    Ok(())
}

fn ensure_client(tx: &Transaction, caller: &str) -> EscrowResult<()> {
    if tx.initiator != caller {
        return Err(EscrowError::authorization(format!(
            "{} is not the client of transaction {}",
            caller, tx.id
        )));
    }
    Ok(())
}

fn ensure_recipient(milestone: &Milestone, recipient_id: &str, caller: &str) -> EscrowResult<()> {
    if caller != recipient_id {
        return Err(EscrowError::authorization(format!(
            "{} cannot act for recipient {}",
            caller, recipient_id
        )));
    }
    if !milestone.is_recipient(recipient_id) {
        return Err(EscrowError::authorization(format!(
            "{} is not a recipient of milestone {}",
            recipient_id, milestone.id
        )));
    }
    Ok(())
}

fn state_error(milestone: &Milestone, to_state: MilestoneStatus, reason: &str) -> EscrowError {
    EscrowError::state_transition(
        format!("{:?}", milestone.status),
        format!("{:?}", to_state),
        reason.to_string(),
    )
}

fn milestone_not_found(tx: &Transaction, milestone_id: &str) -> EscrowError {
    EscrowError::not_found(format!(
        "Milestone {} not found in transaction {}",
        milestone_id, tx.id
    ))
}

fn milestone<'a>(tx: &'a Transaction, milestone_id: &str) -> EscrowResult<&'a Milestone> {
    tx.milestone(milestone_id).ok_or_else(|| milestone_not_found(tx, milestone_id))
}

fn milestone_mut<'a>(
    tx: &'a mut Transaction,
    milestone_id: &str,
) -> EscrowResult<&'a mut Milestone> {
    let missing = milestone_not_found(tx, milestone_id);
    tx.milestone_mut(milestone_id).ok_or(missing)
}

/// Close the transaction once every milestone reached a terminal sub-state
fn settle_if_finished(tx: &mut Transaction) {
    let milestones = tx.milestones();
    if milestones.is_empty() || !milestones.iter().all(|m| m.status.is_terminal()) {
        return;
    }
    tx.status = if milestones
        .iter()
        .any(|m| m.status == MilestoneStatus::Completed)
    {
        TransactionStatus::Released
    } else {
        TransactionStatus::Declined
    };
}

/// Move freshly created milestones to `contract_pending`
pub fn issue_contracts(tx: &mut Transaction) -> EscrowResult<()> {
    if let Some(plan) = tx.milestone_plan.as_mut() {
        for milestone in plan.milestones.iter_mut() {
            milestone.validate_transition(MilestoneStatus::ContractPending)?;
            milestone.status = MilestoneStatus::ContractPending;
        }
    }
    Ok(())
}

pub fn cancel(tx: &mut Transaction, initiator: &str) -> EscrowResult<()> {
    if tx.initiator != initiator {
        return Err(EscrowError::authorization(format!(
            "Only the initiator can cancel transaction {}",
            tx.id
        )));
    }
    ensure_open(tx, "Cancelled")?;
    tx.status = TransactionStatus::Cancelled;
    Ok(())
}

pub fn refund(tx: &mut Transaction, initiator: &str) -> EscrowResult<()> {
    if tx.initiator != initiator {
        return Err(EscrowError::authorization(format!(
            "Only the initiator can refund transaction {}",
            tx.id
        )));
    }
    ensure_open(tx, "Refund")?;
    tx.status = TransactionStatus::Refund;
    Ok(())
}

pub fn sign_contract(
    tx: &mut Transaction,
    milestone_id: &str,
    recipient_id: &str,
    caller: &str,
    signed_document_ref: &str,
    now: DateTime<Utc>,
) -> EscrowResult<()> {
    ensure_recipient(milestone(tx, milestone_id)?, recipient_id, caller)?;
    ensure_open(tx, "ContractSigned")?;
    let milestone = milestone_mut(tx, milestone_id)?;
    if !milestone.status.can_sign_contract() {
        return Err(state_error(
            milestone,
            MilestoneStatus::ContractSigned,
            "Contracts can only be signed while pending",
        ));
    }

    let signature = milestone
        .signatures
        .iter_mut()
        .find(|s| s.recipient_id == recipient_id)
        .ok_or_else(|| {
            EscrowError::not_found(format!("No contract issued to {}", recipient_id))
        })?;
    if signature.is_signed() {
        return Err(EscrowError::state_transition(
            "ContractPending".to_string(),
            "ContractSigned".to_string(),
            format!("{} already signed", recipient_id),
        ));
    }
    signature.signed_document_ref = Some(signed_document_ref.to_string());
    signature.signed_at = Some(now);

    if milestone.all_signed() {
        milestone.validate_transition(MilestoneStatus::ContractSigned)?;
        milestone.status = MilestoneStatus::ContractSigned;
    }
    Ok(())
}

pub fn approve_signed_contract(
    tx: &mut Transaction,
    milestone_id: &str,
    caller: &str,
) -> EscrowResult<()> {
    milestone(tx, milestone_id)?;
    ensure_client(tx, caller)?;
    ensure_open(tx, "Approved")?;
    let milestone = milestone_mut(tx, milestone_id)?;
    if !milestone.status.can_approve_contract() {
        return Err(state_error(
            milestone,
            MilestoneStatus::Approved,
            "Contract must be signed by every recipient first",
        ));
    }
    milestone.validate_transition(MilestoneStatus::Approved)?;
    milestone.status = MilestoneStatus::Approved;

    if tx.status == TransactionStatus::Pending {
        tx.status = TransactionStatus::Confirmed;
    }
    Ok(())
}

pub fn approve_milestone(
    tx: &mut Transaction,
    milestone_id: &str,
    caller: &str,
) -> EscrowResult<()> {
    milestone(tx, milestone_id)?;
    ensure_client(tx, caller)?;
    ensure_open(tx, "Approved")?;
    let milestone = milestone_mut(tx, milestone_id)?;
    if !milestone.status.accepts_releases() || milestone.next_unreleased_payment().is_none() {
        return Err(state_error(
            milestone,
            MilestoneStatus::Approved,
            "Milestone has no payment awaiting approval",
        ));
    }
    if milestone.work_approved {
        return Err(state_error(
            milestone,
            MilestoneStatus::Approved,
            "Milestone work is already approved",
        ));
    }
    milestone.work_approved = true;
    Ok(())
}

pub fn decline_milestone(
    tx: &mut Transaction,
    milestone_id: &str,
    recipient_id: &str,
    caller: &str,
) -> EscrowResult<()> {
    ensure_recipient(milestone(tx, milestone_id)?, recipient_id, caller)?;
    ensure_open(tx, "Declined")?;
    let milestone = milestone_mut(tx, milestone_id)?;
    if !milestone.status.can_decline() {
        return Err(state_error(
            milestone,
            MilestoneStatus::Declined,
            "Milestone can no longer be declined",
        ));
    }
    milestone.validate_transition(MilestoneStatus::Declined)?;
    milestone.status = MilestoneStatus::Declined;
    milestone.work_approved = false;

    settle_if_finished(tx);
    Ok(())
}

/// Release the next payment of an approved milestone; returns its index
pub fn release_milestone(
    tx: &mut Transaction,
    milestone_id: &str,
    caller: &str,
    now: DateTime<Utc>,
) -> EscrowResult<u32> {
    milestone(tx, milestone_id)?;
    ensure_client(tx, caller)?;
    ensure_open(tx, "PaymentReleased")?;
    let milestone = milestone_mut(tx, milestone_id)?;
    if !milestone.status.accepts_releases() {
        return Err(state_error(
            milestone,
            MilestoneStatus::PaymentReleased,
            "Milestone does not accept releases",
        ));
    }
    if !milestone.work_approved {
        return Err(state_error(
            milestone,
            MilestoneStatus::PaymentReleased,
            "Milestone work must be approved before release",
        ));
    }
    milestone.validate_transition(MilestoneStatus::PaymentReleased)?;

    let payment = milestone
        .payments
        .iter_mut()
        .find(|p| !p.is_released())
        .ok_or_else(|| {
            EscrowError::state_transition(
                "PaymentReleased".to_string(),
                "PaymentReleased".to_string(),
                "Every payment is already released".to_string(),
            )
        })?;
    payment.released_at = Some(now);
    let index = payment.index;

    milestone.status = MilestoneStatus::PaymentReleased;
    milestone.work_approved = false;
    Ok(index)
}

/// Release one payment addressed by its plan-wide index; returns the owning milestone id
pub fn release_payment(
    tx: &mut Transaction,
    payment_index: usize,
    caller: &str,
    now: DateTime<Utc>,
) -> EscrowResult<String> {
    let (milestone_pos, payment_pos) = tx.locate_payment(payment_index).ok_or_else(|| {
        EscrowError::not_found(format!(
            "Payment {} not found in transaction {}",
            payment_index, tx.id
        ))
    })?;
    ensure_client(tx, caller)?;
    ensure_open(tx, "PaymentReleased")?;

    let plan = tx
        .milestone_plan
        .as_mut()
        .ok_or_else(|| EscrowError::internal("Located payment without a milestone plan"))?;
    let milestone = &mut plan.milestones[milestone_pos];
    if !milestone.status.accepts_releases() {
        return Err(state_error(
            milestone,
            MilestoneStatus::PaymentReleased,
            "Milestone does not accept releases",
        ));
    }
    if milestone.payments[payment_pos].is_released() {
        return Err(state_error(
            milestone,
            MilestoneStatus::PaymentReleased,
            "Payment is already released",
        ));
    }
    milestone.validate_transition(MilestoneStatus::PaymentReleased)?;
    milestone.payments[payment_pos].released_at = Some(now);
    milestone.status = MilestoneStatus::PaymentReleased;
    Ok(milestone.id.clone())
}

pub fn complete_milestone(
    tx: &mut Transaction,
    milestone_id: &str,
    caller: &str,
) -> EscrowResult<()> {
    let current = milestone(tx, milestone_id)?;
    if !current.is_recipient(caller) {
        return Err(EscrowError::authorization(format!(
            "{} is not a recipient of milestone {}",
            caller, current.id
        )));
    }
    ensure_open(tx, "Completed")?;
    let milestone = milestone_mut(tx, milestone_id)?;
    if !milestone.is_fully_released() {
        return Err(state_error(
            milestone,
            MilestoneStatus::Completed,
            "Every payment must be released before completion",
        ));
    }
    milestone.validate_transition(MilestoneStatus::Completed)?;
    milestone.status = MilestoneStatus::Completed;

    settle_if_finished(tx);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{MilestonePlanRequest, MilestoneRequest, Recipient, ReleaseFrequency};

    fn pending_transaction(months: u32) -> Transaction {
        let plan = MilestonePlanRequest {
            title: "Mural".to_string(),
            initiator_email: None,
            milestones: vec![
                MilestoneRequest {
                    title: "Sketch".to_string(),
                    amount_sats: 1_000,
                    frequency: ReleaseFrequency::Monthly { months },
                    recipients: vec![Recipient {
                        id: "bob".to_string(),
                        email: None,
                        amount_sats: 1_000,
                    }],
                },
                MilestoneRequest {
                    title: "Paint".to_string(),
                    amount_sats: 2_000,
                    frequency: ReleaseFrequency::Once,
                    recipients: vec![Recipient {
                        id: "carol".to_string(),
                        email: None,
                        amount_sats: 2_000,
                    }],
                },
            ],
        };
        let ids = vec!["m1".to_string(), "m2".to_string()];
        let mut tx = Transaction::from_plan("tx".to_string(), &ids, "alice", &plan);
        issue_contracts(&mut tx).unwrap();
        tx
    }

    fn approved_transaction(months: u32) -> Transaction {
        let mut tx = pending_transaction(months);
        sign_contract(&mut tx, "m1", "bob", "bob", "doc", Utc::now()).unwrap();
        approve_signed_contract(&mut tx, "m1", "alice").unwrap();
        tx
    }

    #[test]
    fn test_sign_then_approve_confirms_transaction() {
        let tx = approved_transaction(1);
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.milestone("m1").unwrap().status, MilestoneStatus::Approved);
        assert_eq!(
            tx.milestone("m2").unwrap().status,
            MilestoneStatus::ContractPending
        );
    }

    #[test]
    fn test_only_named_recipient_can_sign() {
        let mut tx = pending_transaction(1);
        let err = sign_contract(&mut tx, "m1", "bob", "mallory", "doc", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = sign_contract(&mut tx, "m1", "carol", "carol", "doc", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[test]
    fn test_decline_by_non_recipient_is_unauthorized() {
        let mut tx = pending_transaction(1);
        let before = tx.milestone("m1").unwrap().status;
        let err = decline_milestone(&mut tx, "m1", "bob", "alice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(tx.milestone("m1").unwrap().status, before);
    }

    #[test]
    fn test_release_requires_work_approval() {
        let mut tx = approved_transaction(2);
        let err = release_milestone(&mut tx, "m1", "alice", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        approve_milestone(&mut tx, "m1", "alice").unwrap();
        let index = release_milestone(&mut tx, "m1", "alice", Utc::now()).unwrap();
        assert_eq!(index, 1);
        let milestone = tx.milestone("m1").unwrap();
        assert_eq!(milestone.status, MilestoneStatus::PaymentReleased);
        assert!(!milestone.work_approved);
    }

    #[test]
    fn test_release_on_completed_milestone_fails() {
        let mut tx = approved_transaction(1);
        approve_milestone(&mut tx, "m1", "alice").unwrap();
        release_milestone(&mut tx, "m1", "alice", Utc::now()).unwrap();
        complete_milestone(&mut tx, "m1", "bob").unwrap();

        let err = release_milestone(&mut tx, "m1", "alice", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(tx.milestone("m1").unwrap().status, MilestoneStatus::Completed);
    }

    #[test]
    fn test_release_payment_by_plan_index() {
        let mut tx = approved_transaction(2);
        let milestone_id = release_payment(&mut tx, 1, "alice", Utc::now()).unwrap();
        assert_eq!(milestone_id, "m1");
        let milestone = tx.milestone("m1").unwrap();
        assert!(milestone.payments[1].is_released());
        assert!(!milestone.payments[0].is_released());

        // Index 2 belongs to m2, still waiting for signatures
        let err = release_payment(&mut tx, 2, "alice", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        let err = release_payment(&mut tx, 1, "alice", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn test_transaction_settles_when_milestones_finish() {
        let mut tx = approved_transaction(1);
        decline_milestone(&mut tx, "m2", "carol", "carol").unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);

        approve_milestone(&mut tx, "m1", "alice").unwrap();
        release_milestone(&mut tx, "m1", "alice", Utc::now()).unwrap();
        complete_milestone(&mut tx, "m1", "bob").unwrap();
        assert_eq!(tx.status, TransactionStatus::Released);
        assert_eq!(tx.effective_status(), TransactionStatus::Released);
    }

    #[test]
    fn test_cancelled_transaction_rejects_milestone_work() {
        let mut tx = pending_transaction(1);
        let err = cancel(&mut tx, "bob").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        cancel(&mut tx, "alice").unwrap();
        assert_eq!(tx.status, TransactionStatus::Cancelled);

        let err = sign_contract(&mut tx, "m1", "bob", "bob", "doc", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        let err = refund(&mut tx, "alice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn test_closed_transaction_still_reports_unauthorized_callers() {
        let mut tx = approved_transaction(1);
        cancel(&mut tx, "alice").unwrap();

        let err = sign_contract(&mut tx, "m2", "carol", "mallory", "doc", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = approve_milestone(&mut tx, "m1", "bob").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = release_payment(&mut tx, 0, "bob", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = complete_milestone(&mut tx, "m1", "alice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = approve_milestone(&mut tx, "missing", "bob").unwrap_err();
        assert!(matches!(err, EscrowError::NotFound(_)));
    }
}
