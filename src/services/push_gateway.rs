//! Outbound client for the external push gateway. The gateway is treated
//! as unreliable: one HTTP call per task attempt, never retried inside a
//! call. Retrying is the push consumer's job, with backoff.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::PushGatewayConfig;

/// Boolean success plus the raw status, kept for logging and for the
/// dead-letter record.
#[derive(Debug, Clone)]
pub struct PushDeliveryResult {
    pub success: bool,
    pub status: String,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send_batch(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> PushDeliveryResult;
}

pub struct HttpPushGateway {
    http: reqwest::Client,
    config: PushGatewayConfig,
}

impl HttpPushGateway {
    pub fn new(config: PushGatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl PushTransport for HttpPushGateway {
    async fn send_batch(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> PushDeliveryResult {
        let payload = json!({
            "registration_ids": tokens,
            "notification": { "title": title, "body": body },
            "data": data,
        });

        let response = self
            .http
            .post(&self.config.url)
            .header("Authorization", format!("key={}", self.config.server_key))
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(tokens = tokens.len(), "push gateway accepted batch");
                PushDeliveryResult {
                    success: true,
                    status: resp.status().to_string(),
                }
            }
            Ok(resp) => {
                let status = resp.status().to_string();
                let detail = resp.text().await.unwrap_or_default();
                PushDeliveryResult {
                    success: false,
                    status: format!("{} {}", status, detail),
                }
            }
            Err(e) => PushDeliveryResult {
                success: false,
                status: format!("transport error: {}", e),
            },
        }
    }
}

/// Stand-in used when no gateway is configured: tasks complete without an
/// external call so the queue never backs up on a feature that is off.
pub struct DisabledPushGateway;

#[async_trait]
impl PushTransport for DisabledPushGateway {
    async fn send_batch(
        &self,
        tokens: &[String],
        _title: &str,
        _body: &str,
        _data: serde_json::Value,
    ) -> PushDeliveryResult {
        debug!(tokens = tokens.len(), "push gateway not configured, dropping batch");
        PushDeliveryResult {
            success: true,
            status: "gateway disabled".to_string(),
        }
    }
}
