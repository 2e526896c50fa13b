//! Transactional email for escrow lifecycle events

use async_trait::async_trait;
use bitcoin::{Amount, Denomination};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{
    config::EmailConfig,
    error::EscrowError,
    models::{EscrowEventType, Transaction},
    EscrowResult,
};

/// Template selector understood by the email provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    EscrowCancelled,
    EscrowRefunded,
    MilestoneCreated,
    MilestoneSigned,
    MilestoneContractApproved,
    MilestoneApproved,
    MilestoneDeclined,
    MilestoneReleased,
    MilestonePaymentReleased,
    MilestoneCompleted,
}

impl EmailKind {
    /// Email sent for a transition event, if any
    pub fn for_event(event_type: EscrowEventType) -> Option<Self> {
        match event_type {
            EscrowEventType::EscrowCancelled => Some(Self::EscrowCancelled),
            EscrowEventType::EscrowRefunded => Some(Self::EscrowRefunded),
            EscrowEventType::MilestonesInitiated => Some(Self::MilestoneCreated),
            EscrowEventType::MilestoneContractSigned => Some(Self::MilestoneSigned),
            EscrowEventType::MilestoneContractApproved => Some(Self::MilestoneContractApproved),
            EscrowEventType::MilestoneApproved => Some(Self::MilestoneApproved),
            EscrowEventType::MilestoneDeclined => Some(Self::MilestoneDeclined),
            EscrowEventType::MilestoneReleased => Some(Self::MilestoneReleased),
            EscrowEventType::MilestonePaymentReleased => Some(Self::MilestonePaymentReleased),
            EscrowEventType::MilestoneCompleted => Some(Self::MilestoneCompleted),
            EscrowEventType::ApproveAttest
            | EscrowEventType::ReleaseAttest
            | EscrowEventType::CompleteAttest => None,
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            Self::EscrowCancelled => "Escrow cancelled",
            Self::EscrowRefunded => "Escrow refunded",
            Self::MilestoneCreated => "New milestone contract",
            Self::MilestoneSigned => "Milestone contract signed",
            Self::MilestoneContractApproved => "Milestone contract approved",
            Self::MilestoneApproved => "Milestone work approved",
            Self::MilestoneDeclined => "Milestone declined",
            Self::MilestoneReleased => "Milestone payment released",
            Self::MilestonePaymentReleased => "Scheduled payment released",
            Self::MilestoneCompleted => "Milestone completed",
        }
    }
}

/// One outgoing email
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub kind: EmailKind,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub data: serde_json::Value,
}

impl EmailMessage {
    /// Render the email for `to` about `transaction`, optionally scoped to one milestone
    pub fn compose(
        kind: EmailKind,
        to: &str,
        transaction: &Transaction,
        milestone_id: Option<&str>,
        actor: &str,
    ) -> Self {
        let milestone = milestone_id.and_then(|id| transaction.milestone(id));
        let (scope, amount_sats) = match milestone {
            Some(m) => (format!("milestone \"{}\"", m.title), m.amount_sats),
            None => (
                format!("escrow \"{}\"", transaction.title),
                transaction.funds_allocated_sats,
            ),
        };
        let amount = format_btc(amount_sats);

        Self {
            kind,
            to: to.to_string(),
            subject: format!("{}: {}", kind.headline(), transaction.title),
            text: format!(
                "{} for {} ({}) by {}.",
                kind.headline(),
                scope,
                amount,
                actor
            ),
            data: serde_json::json!({
                "transaction_id": transaction.id,
                "milestone_id": milestone_id,
                "actor": actor,
                "amount_sats": amount_sats,
                "amount": amount,
                "status": transaction.effective_status(),
            }),
        }
    }
}

/// Human-readable BTC amount
pub fn format_btc(sats: u64) -> String {
    Amount::from_sat(sats).to_string_with_denomination(Denomination::Bitcoin)
}

#[derive(Debug, Deserialize)]
struct EmailResponse {
    success: bool,
}

/// Email delivery provider
#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> EscrowResult<()>;
}

/// HTTP client for the email provider
pub struct HttpEmailGateway {
    http: reqwest::Client,
    config: EmailConfig,
}

impl HttpEmailGateway {
    pub fn new(config: EmailConfig) -> EscrowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EscrowError::config(format!("Email HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl EmailGateway for HttpEmailGateway {
    async fn send(&self, message: &EmailMessage) -> EscrowResult<()> {
        debug!(kind = ?message.kind, to = %message.to, "Sending email");

        let response = self
            .http
            .post(&self.config.url)
            .json(message)
            .send()
            .await
            .map_err(|e| EscrowError::connectivity(format!("Email provider unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EscrowError::external_api(format!(
                "Email provider returned {}",
                status
            )));
        }

        let body: EmailResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::external_api(format!("Email provider response: {}", e)))?;
        if !body.success {
            return Err(EscrowError::external_api(format!(
                "Email provider refused {:?} to {}",
                message.kind, message.to
            )));
        }
        Ok(())
    }
}
