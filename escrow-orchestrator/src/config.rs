//! Orchestrator configuration
//!
//! Loaded from an optional file followed by `ESCROW__`-prefixed environment
//! variables (`ESCROW__EVIDENCE__URL=...`). Every field has a default so an
//! empty environment yields a usable local setup.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::EscrowResult;

/// Ledger actor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Bound on every ledger call, transitions and audit writes alike
    pub timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

/// Evidence-anchoring network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// Tags attached to every submission
    pub tags: Vec<String>,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8090/api/evidence".to_string(),
            timeout_ms: 5_000,
            tags: vec!["escrow".to_string()],
        }
    }
}

/// IP-registry network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpRegistryConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// License declared for registered works
    pub license: String,
    pub work_type: String,
}

impl Default for IpRegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8091/api/register-work".to_string(),
            timeout_ms: 5_000,
            license: "all-rights-reserved".to_string(),
            work_type: "milestone_deliverable".to_string(),
        }
    }
}

/// Real-time notification transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// Namespace prepended to the escrow id to form a channel name
    pub channel_prefix: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8092/api/publish".to_string(),
            timeout_ms: 3_000,
            channel_prefix: "escrow".to_string(),
        }
    }
}

/// Transactional email gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8093/api/email/send".to_string(),
            timeout_ms: 5_000,
        }
    }
}

/// Side-effect worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Oldest dead letters are dropped beyond this many entries
    pub dead_letter_capacity: usize,
    /// Upper bound for one external call made by a job
    pub job_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_024,
            dead_letter_capacity: 10_000,
            job_timeout_ms: 15_000,
        }
    }
}

impl DispatcherConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// Read cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            max_entries: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Full orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub ledger: LedgerConfig,
    pub evidence: EvidenceConfig,
    pub ip_registry: IpRegistryConfig,
    pub notifications: NotificationConfig,
    pub email: EmailConfig,
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
}

impl OrchestratorConfig {
    /// Environment variable prefix
    pub const ENV_PREFIX: &'static str = "ESCROW";

    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        // A missing .env file is normal outside development
        let _ = dotenv::dotenv();

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            debug!(path, "Loading orchestrator configuration file");
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(Self::ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("evidence.tags")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.dispatcher.workers, 4);
        assert!(config.dispatcher.queue_capacity > 0);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(config.evidence.tags, vec!["escrow".to_string()]);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(
                "[dispatcher]\nworkers = 8\n[evidence]\nurl = \"https://evidence.example/api\"\n",
                ::config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: OrchestratorConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.dispatcher.queue_capacity, 1_024);
        assert_eq!(config.evidence.url, "https://evidence.example/api");
        assert_eq!(config.evidence.timeout_ms, 5_000);
        assert_eq!(config.ledger.timeout_ms, 10_000);
    }
}
