//! Operator alerts delivered to a webhook.

use async_trait::async_trait;
use domain::services::{NotificationResult, OperatorNotification, OperatorNotifier};
use reqwest::Client;
use shared::crypto::hmac_sha256_hex;
use std::time::Duration;

/// Webhook delivery timeout in seconds.
const WEBHOOK_TIMEOUT_SECS: u64 = 5;

/// Header carrying `sha256=<hex hmac>` of the body when a secret is set.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Posts operator notifications as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl OperatorNotifier for WebhookNotifier {
    async fn notify(&self, notification: OperatorNotification) -> NotificationResult {
        let payload = match serde_json::to_string(&notification) {
            Ok(payload) => payload,
            Err(e) => return NotificationResult::Failed(e.to_string()),
        };

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            let signature = hmac_sha256_hex(secret, payload.as_bytes());
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", signature));
        }

        match request.body(payload).send().await {
            Ok(response) if response.status().is_success() => NotificationResult::Sent,
            Ok(response) => NotificationResult::Failed(format!(
                "Webhook returned HTTP {}",
                response.status().as_u16()
            )),
            Err(e) => NotificationResult::Failed(e.to_string()),
        }
    }
}
