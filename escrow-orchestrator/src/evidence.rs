//! Evidence Submitter - anchors event fingerprints on an external evidence network
//!
//! Submission is strictly optional: any network error, timeout, non-2xx
//! response (the service answers 503 while its backend is unavailable) or
//! undecodable body yields `None`, never an error. One attempt per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    config::EvidenceConfig,
    error::EscrowError,
    hasher::Fingerprint,
    models::{EscrowEvent, EvidenceRecord},
    EscrowResult,
};

/// Payload submitted for one event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceSubmission {
    pub escrow_event: EscrowEvent,
    /// Content fingerprint of the canonical event, used as document id
    pub document_id: String,
    pub tags: Vec<String>,
}

/// Raw response of the evidence network
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvidenceResponse {
    accepted: bool,
    hash: Option<String>,
    event_id: Option<String>,
    document_ref: Option<String>,
    message: Option<String>,
}

/// Anything able to attest an event fingerprint
#[async_trait]
pub trait EvidenceSubmitter: Send + Sync {
    /// Submit once; `None` means no evidence was produced
    async fn submit(&self, submission: &EvidenceSubmission) -> Option<EvidenceRecord>;
}

/// HTTP client for the evidence network
pub struct HttpEvidenceClient {
    http: reqwest::Client,
    config: EvidenceConfig,
}

impl HttpEvidenceClient {
    pub fn new(config: EvidenceConfig) -> EscrowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EscrowError::config(format!("Evidence HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    async fn post(&self, submission: &EvidenceSubmission) -> Result<EvidenceResponse, String> {
        let response = self
            .http
            .post(&self.config.url)
            .json(submission)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err("evidence backend unavailable".to_string());
        }
        if !status.is_success() {
            return Err(format!("unexpected status {}", status));
        }

        response
            .json::<EvidenceResponse>()
            .await
            .map_err(|e| format!("undecodable response: {}", e))
    }
}

#[async_trait]
impl EvidenceSubmitter for HttpEvidenceClient {
    async fn submit(&self, submission: &EvidenceSubmission) -> Option<EvidenceRecord> {
        let event = &submission.escrow_event;
        debug!(
            event_type = %event.event_type,
            transaction_id = %event.escrow_id,
            document_id = %submission.document_id,
            "Submitting evidence"
        );

        match self.post(submission).await {
            Ok(response) => {
                let record = into_record(response, &submission.document_id);
                info!(
                    event_type = %event.event_type,
                    transaction_id = %event.escrow_id,
                    accepted = record.accepted,
                    fingerprint = %record.fingerprint,
                    "Evidence network answered"
                );
                Some(record)
            }
            Err(reason) => {
                warn!(
                    event_type = %event.event_type,
                    transaction_id = %event.escrow_id,
                    actor = %event.actor,
                    %reason,
                    "No evidence produced"
                );
                None
            }
        }
    }
}

/// The service's hash wins over the local fingerprint when present
fn into_record(response: EvidenceResponse, local_fingerprint: &str) -> EvidenceRecord {
    let fingerprint = response
        .hash
        .filter(|hash| !hash.trim().is_empty())
        .unwrap_or_else(|| local_fingerprint.to_string());
    EvidenceRecord {
        accepted: response.accepted,
        fingerprint,
        event_id: response.event_id,
        document_ref: response.document_ref,
        message: response.message,
    }
}

impl EvidenceSubmission {
    pub fn new(escrow_event: EscrowEvent, fingerprint: &Fingerprint, tags: Vec<String>) -> Self {
        Self {
            escrow_event,
            document_id: fingerprint.as_str().to_string(),
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(hash: Option<&str>) -> EvidenceResponse {
        EvidenceResponse {
            accepted: true,
            hash: hash.map(str::to_string),
            event_id: Some("evt-1".to_string()),
            document_ref: None,
            message: None,
        }
    }

    #[test]
    fn test_service_hash_preferred() {
        let record = into_record(response(Some("abc123")), "local");
        assert_eq!(record.fingerprint, "abc123");
        assert_eq!(record.event_id.as_deref(), Some("evt-1"));
    }

    #[test]
    fn test_local_fingerprint_fallback() {
        assert_eq!(into_record(response(None), "local").fingerprint, "local");
        assert_eq!(into_record(response(Some("  ")), "local").fingerprint, "local");
    }

    #[test]
    fn test_submission_wire_shape() {
        let event = EscrowEvent::new(
            crate::models::EscrowEventType::EscrowCancelled,
            "tx-1",
            None,
            "alice",
            serde_json::json!({}),
        );
        let fingerprint = crate::hasher::hash_bytes(b"event");
        let submission = EvidenceSubmission::new(event, &fingerprint, vec!["escrow".into()]);
        let value = serde_json::to_value(&submission).unwrap();

        assert_eq!(value["documentId"], fingerprint.as_str());
        assert_eq!(value["escrowEvent"]["event_type"], "escrow_cancelled");
        assert_eq!(value["tags"][0], "escrow");
    }
}
