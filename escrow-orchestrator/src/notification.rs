//! Notification gateway - pushes escrow events to real-time channels
//!
//! Every escrow has one channel, `<prefix>-<escrow id>`; the event type is the
//! event name on that channel. Subscribers use the same channel name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{
    config::NotificationConfig, error::EscrowError, models::EscrowEventType, EscrowResult,
};

/// One message published on an escrow channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub event: String,
    pub data: serde_json::Value,
}

impl Notification {
    pub fn new(
        channel_prefix: &str,
        escrow_id: &str,
        event_type: EscrowEventType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            channel: channel_name(channel_prefix, escrow_id),
            event: event_type.as_str().to_string(),
            data,
        }
    }
}

/// Channel name for an escrow's chat/notification stream
pub fn channel_name(prefix: &str, escrow_id: &str) -> String {
    format!("{}-{}", prefix, escrow_id)
}

/// Real-time delivery transport
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn publish(&self, notification: &Notification) -> EscrowResult<()>;

    /// Namespace used to build channel names
    fn channel_prefix(&self) -> &str;
}

/// HTTP publisher for the notification transport
pub struct HttpNotificationGateway {
    http: reqwest::Client,
    config: NotificationConfig,
}

impl HttpNotificationGateway {
    pub fn new(config: NotificationConfig) -> EscrowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EscrowError::config(format!("Notification HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn publish(&self, notification: &Notification) -> EscrowResult<()> {
        debug!(
            channel = %notification.channel,
            event = %notification.event,
            "Publishing notification"
        );

        let response = self
            .http
            .post(&self.config.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                EscrowError::connectivity(format!("Notification transport unreachable: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(EscrowError::external_api(format!(
                "Notification transport returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn channel_prefix(&self) -> &str {
        &self.config.channel_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_is_namespaced_per_escrow() {
        let notification = Notification::new(
            "escrow",
            "tx-42",
            EscrowEventType::MilestoneReleased,
            serde_json::json!({"milestone_id": "m-1"}),
        );
        assert_eq!(notification.channel, "escrow-tx-42");
        assert_eq!(notification.event, "milestone_released");
        assert_eq!(channel_name("escrow", "tx-42"), notification.channel);
    }
}
