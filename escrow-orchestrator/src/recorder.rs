//! Attestation Recorder - links attestations to the ledger audit trail

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::{error::EscrowError, ledger::LedgerActor, models::AuditEntry, EscrowResult};

/// Writes audit entries through the ledger under a bounded timeout
pub struct AttestationRecorder {
    ledger: Arc<dyn LedgerActor>,
    timeout: Duration,
}

impl AttestationRecorder {
    pub fn new(ledger: Arc<dyn LedgerActor>, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    /// Append `(transaction_id, event_type, fingerprint, actor)` to the audit trail.
    ///
    /// Failures are logged here and handed back to the side-effect worker,
    /// never to the caller of the original transition.
    pub async fn record(
        &self,
        transaction_id: &str,
        event_type: &str,
        fingerprint: &str,
        actor: &str,
    ) -> EscrowResult<AuditEntry> {
        let entry = AuditEntry {
            transaction_id: transaction_id.to_string(),
            event_type: event_type.to_string(),
            fingerprint: fingerprint.to_string(),
            actor: actor.to_string(),
            recorded_at: Utc::now(),
        };

        let outcome = match tokio::time::timeout(
            self.timeout,
            self.ledger.record_attestation(&entry),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EscrowError::timeout(format!(
                "Recording attestation took longer than {:?}",
                self.timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                info!(
                    transaction_id = %transaction_id,
                    event_type = %event_type,
                    actor = %actor,
                    fingerprint = %fingerprint,
                    "Attestation recorded on ledger"
                );
                Ok(entry)
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction_id,
                    event_type = %event_type,
                    actor = %actor,
                    error = %e,
                    "Failed to record attestation"
                );
                Err(e)
            }
        }
    }
}
