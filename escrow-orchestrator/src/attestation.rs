//! Attestation pipeline
//!
//! Event attestation: canonicalize the event, hash it, submit the fingerprint
//! to the evidence network and, when accepted, record the link on the ledger.
//!
//! Work attestation: register the milestone deliverable with the IP registry
//! and record the registry transaction hash under the `*_attest` event type.
//!
//! Both run inside side-effect workers and report through `anyhow` so the
//! dispatcher can dead-letter them with their full context chain.

use anyhow::{anyhow, bail, Context};
use std::sync::Arc;
use tracing::debug;

use crate::{
    evidence::{EvidenceSubmission, EvidenceSubmitter},
    hasher,
    ip_registry::{IpRegistry, WorkDescriptor},
    models::{AuditEntry, EscrowEvent, Transaction},
    recorder::AttestationRecorder,
};

pub struct AttestationPipeline {
    evidence: Arc<dyn EvidenceSubmitter>,
    ip_registry: Arc<dyn IpRegistry>,
    recorder: Arc<AttestationRecorder>,
    tags: Vec<String>,
}

impl AttestationPipeline {
    pub fn new(
        evidence: Arc<dyn EvidenceSubmitter>,
        ip_registry: Arc<dyn IpRegistry>,
        recorder: Arc<AttestationRecorder>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            evidence,
            ip_registry,
            recorder,
            tags,
        }
    }

    /// Canonicalize, hash, submit and record one event
    pub async fn attest_event(&self, event: &EscrowEvent) -> anyhow::Result<AuditEntry> {
        let fingerprint = hasher::hash_event(event).context("fingerprinting event")?;
        debug!(
            event_type = %event.event_type,
            transaction_id = %event.escrow_id,
            fingerprint = %fingerprint,
            "Event fingerprinted"
        );

        let submission = EvidenceSubmission::new(event.clone(), &fingerprint, self.tags.clone());
        let record = self
            .evidence
            .submit(&submission)
            .await
            .ok_or_else(|| anyhow!("evidence network produced no record"))?;

        if !record.accepted {
            bail!(
                "evidence network rejected {}: {}",
                fingerprint,
                record.message.as_deref().unwrap_or("no reason given")
            );
        }

        self.recorder
            .record(
                &event.escrow_id,
                event.event_type.as_str(),
                &record.fingerprint,
                &event.actor,
            )
            .await
            .context("recording evidence fingerprint on ledger")
    }

    /// Register the milestone deliverable behind `event` and record the registry hash
    pub async fn attest_work(
        &self,
        event: &EscrowEvent,
        transaction: &Transaction,
    ) -> anyhow::Result<AuditEntry> {
        let audit_type = event
            .event_type
            .ip_attestation_type()
            .ok_or_else(|| anyhow!("{} carries no creative work", event.event_type))?;
        let milestone_id = event
            .milestone_id
            .as_deref()
            .ok_or_else(|| anyhow!("{} event without milestone", event.event_type))?;
        let milestone = transaction
            .milestone(milestone_id)
            .ok_or_else(|| anyhow!("milestone {} missing from snapshot", milestone_id))?;

        let work_hash = hasher::hash_event(milestone).context("fingerprinting milestone")?;
        let creator = milestone
            .recipients
            .iter()
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let work = WorkDescriptor {
            escrow_id: transaction.id.clone(),
            work_id: milestone.id.clone(),
            work_type: self.ip_registry.work_type().to_string(),
            work_hash: work_hash.into_string(),
            creator,
            license: self.ip_registry.license().to_string(),
            description: format!("{} / {}", transaction.title, milestone.title),
            created_at: milestone.created_at,
        };

        let registry_hash = self
            .ip_registry
            .register_work(&work)
            .await
            .context("registering work with IP registry")?;

        self.recorder
            .record(
                &transaction.id,
                audit_type.as_str(),
                &registry_hash,
                &event.actor,
            )
            .await
            .context("recording IP registry hash on ledger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{InMemoryLedger, LedgerActor},
        models::{
            EscrowEventType, EvidenceRecord, MilestonePlanRequest, MilestoneRequest, Recipient,
            ReleaseFrequency,
        },
        EscrowResult,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct FixedEvidence(Option<EvidenceRecord>);

    #[async_trait]
    impl EvidenceSubmitter for FixedEvidence {
        async fn submit(&self, _submission: &EvidenceSubmission) -> Option<EvidenceRecord> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingRegistry {
        works: Mutex<Vec<WorkDescriptor>>,
    }

    #[async_trait]
    impl IpRegistry for RecordingRegistry {
        async fn register_work(&self, work: &WorkDescriptor) -> EscrowResult<String> {
            self.works.lock().await.push(work.clone());
            Ok("0xfeed".to_string())
        }

        fn license(&self) -> &str {
            "cc-by-4.0"
        }

        fn work_type(&self) -> &str {
            "milestone_deliverable"
        }
    }

    fn accepted(hash: &str) -> Option<EvidenceRecord> {
        Some(EvidenceRecord {
            accepted: true,
            fingerprint: hash.to_string(),
            event_id: None,
            document_ref: None,
            message: None,
        })
    }

    fn pipeline(
        evidence: Option<EvidenceRecord>,
    ) -> (AttestationPipeline, Arc<InMemoryLedger>, Arc<RecordingRegistry>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(RecordingRegistry::default());
        let recorder = Arc::new(AttestationRecorder::new(
            ledger.clone(),
            Duration::from_secs(1),
        ));
        let pipeline = AttestationPipeline::new(
            Arc::new(FixedEvidence(evidence)),
            registry.clone(),
            recorder,
            vec!["escrow".to_string()],
        );
        (pipeline, ledger, registry)
    }

    fn event(event_type: EscrowEventType, milestone_id: Option<&str>) -> EscrowEvent {
        EscrowEvent::new(event_type, "tx-1", milestone_id, "alice", serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_accepted_evidence_is_recorded() {
        let (pipeline, ledger, _) = pipeline(accepted("abc123"));
        pipeline
            .attest_event(&event(EscrowEventType::MilestoneContractApproved, Some("m-1")))
            .await
            .unwrap();

        let trail = ledger.attestations("tx-1").await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].fingerprint, "abc123");
        assert_eq!(trail[0].event_type, "milestone_contract_approved");
    }

    #[tokio::test]
    async fn test_missing_or_rejected_evidence_records_nothing() {
        let (pipeline, ledger, _) = pipeline(None);
        assert!(pipeline
            .attest_event(&event(EscrowEventType::EscrowCancelled, None))
            .await
            .is_err());

        let mut rejected = accepted("abc123");
        if let Some(record) = rejected.as_mut() {
            record.accepted = false;
        }
        let (rejecting, _, _) = pipeline_with(rejected, ledger.clone());
        assert!(rejecting
            .attest_event(&event(EscrowEventType::EscrowCancelled, None))
            .await
            .is_err());

        assert!(ledger.attestations("tx-1").await.unwrap().is_empty());
    }

    fn pipeline_with(
        evidence: Option<EvidenceRecord>,
        ledger: Arc<InMemoryLedger>,
    ) -> (AttestationPipeline, Arc<InMemoryLedger>, Arc<RecordingRegistry>) {
        let registry = Arc::new(RecordingRegistry::default());
        let recorder = Arc::new(AttestationRecorder::new(
            ledger.clone(),
            Duration::from_secs(1),
        ));
        let pipeline = AttestationPipeline::new(
            Arc::new(FixedEvidence(evidence)),
            registry.clone(),
            recorder,
            Vec::new(),
        );
        (pipeline, ledger, registry)
    }

    #[tokio::test]
    async fn test_work_attestation_records_registry_hash() {
        let (pipeline, ledger, registry) = pipeline(None);
        let plan = MilestonePlanRequest {
            title: "Score".to_string(),
            initiator_email: None,
            milestones: vec![MilestoneRequest {
                title: "Theme".to_string(),
                amount_sats: 1_000,
                frequency: ReleaseFrequency::Once,
                recipients: vec![Recipient {
                    id: "bob".to_string(),
                    email: None,
                    amount_sats: 1_000,
                }],
            }],
        };
        let tx = Transaction::from_plan("tx-1".to_string(), &["m-1".to_string()], "alice", &plan);

        pipeline
            .attest_work(&event(EscrowEventType::MilestoneReleased, Some("m-1")), &tx)
            .await
            .unwrap();

        let works = registry.works.lock().await;
        assert_eq!(works[0].creator, "bob");
        assert_eq!(works[0].work_hash.len(), 64);

        let trail = ledger.attestations("tx-1").await.unwrap();
        assert_eq!(trail[0].event_type, "release_attest");
        assert_eq!(trail[0].fingerprint, "0xfeed");
    }

    #[tokio::test]
    async fn test_work_attestation_requires_attestable_event() {
        let (pipeline, _, registry) = pipeline(None);
        let plan = MilestonePlanRequest {
            title: "Score".to_string(),
            initiator_email: None,
            milestones: Vec::new(),
        };
        let tx = Transaction::from_plan("tx-1".to_string(), &[], "alice", &plan);
        assert!(pipeline
            .attest_work(&event(EscrowEventType::MilestoneDeclined, Some("m-1")), &tx)
            .await
            .is_err());
        assert!(registry.works.lock().await.is_empty());
    }
}
