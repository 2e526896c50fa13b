//! IP registry client - registers milestone deliverables as creative works
//!
//! Used for milestone approval, release and completion. A successful
//! registration returns an external transaction hash that is written to the
//! ledger audit trail under the matching `*_attest` event type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::{config::IpRegistryConfig, error::EscrowError, EscrowResult};

/// Work descriptor accepted by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkDescriptor {
    pub escrow_id: String,
    pub work_id: String,
    pub work_type: String,
    pub work_hash: String,
    pub creator: String,
    pub license: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Registry response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub success: bool,
    pub transaction_hash: Option<String>,
}

/// Anything able to register a creative work
#[async_trait]
pub trait IpRegistry: Send + Sync {
    /// Register a work and return the registry's transaction hash
    async fn register_work(&self, work: &WorkDescriptor) -> EscrowResult<String>;

    /// License string to declare on new works
    fn license(&self) -> &str;

    /// Work type to declare on new works
    fn work_type(&self) -> &str;
}

/// HTTP client for the IP registry network
pub struct HttpIpRegistryClient {
    http: reqwest::Client,
    config: IpRegistryConfig,
}

impl HttpIpRegistryClient {
    pub fn new(config: IpRegistryConfig) -> EscrowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EscrowError::config(format!("IP registry HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl IpRegistry for HttpIpRegistryClient {
    async fn register_work(&self, work: &WorkDescriptor) -> EscrowResult<String> {
        debug!(
            transaction_id = %work.escrow_id,
            work_id = %work.work_id,
            "Registering work with IP registry"
        );

        let response = self
            .http
            .post(&self.config.url)
            .json(work)
            .send()
            .await
            .map_err(|e| EscrowError::connectivity(format!("IP registry unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EscrowError::external_api(format!(
                "IP registry returned {}",
                status
            )));
        }

        let body: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::external_api(format!("IP registry response: {}", e)))?;

        match (body.success, body.transaction_hash) {
            (true, Some(hash)) if !hash.is_empty() => {
                info!(
                    transaction_id = %work.escrow_id,
                    work_id = %work.work_id,
                    registry_tx = %hash,
                    "Work registered"
                );
                Ok(hash)
            }
            (true, _) => Err(EscrowError::external_api(
                "IP registry reported success without a transaction hash",
            )),
            (false, _) => Err(EscrowError::external_api("IP registry rejected the work")),
        }
    }

    fn license(&self) -> &str {
        &self.config.license
    }

    fn work_type(&self) -> &str {
        &self.config.work_type
    }
}
