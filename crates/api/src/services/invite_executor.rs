//! HTTP client for the invite automation service.

use async_trait::async_trait;
use domain::services::{InviteError, InviteExecutor, InviteRequest};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::middleware::metrics::record_invitation_attempt;

/// Body posted to the automation service.
#[derive(Debug, Serialize)]
struct InvitePayload<'a> {
    order_ref: &'a str,
    target_email: &'a str,
    account_identity: &'a str,
    lease_id: Uuid,
}

/// Posts invitation requests to an external automation endpoint.
///
/// A 2xx response is success. 4xx responses are permanent rejections and
/// everything else (5xx, connect errors, timeouts) means the service is
/// unavailable.
pub struct HttpInviteExecutor {
    client: Client,
    url: String,
}

/// Client timeout for a pipeline attempt timeout. The client gives up first,
/// so a slow service is reported as a timed-out request rather than the
/// attempt being dropped mid-flight.
pub fn client_timeout(attempt_timeout: Duration) -> Duration {
    attempt_timeout * 9 / 10
}

impl HttpInviteExecutor {
    /// `attempt_timeout` is the pipeline's per-attempt budget.
    pub fn new(url: impl Into<String>, attempt_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(client_timeout(attempt_timeout))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl InviteExecutor for HttpInviteExecutor {
    async fn invite(&self, request: &InviteRequest) -> Result<(), InviteError> {
        let payload = InvitePayload {
            order_ref: &request.order_ref,
            target_email: &request.target_email,
            account_identity: &request.account_identity,
            lease_id: request.lease_id,
        };

        let response = match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                record_invitation_attempt(if e.is_timeout() { "timeout" } else { "failure" });
                warn!(order_ref = %request.order_ref, error = %e, "Invite request failed");
                return Err(InviteError::Unavailable(e.to_string()));
            }
        };

        let status = response.status();
        if status.is_success() {
            record_invitation_attempt("success");
            debug!(order_ref = %request.order_ref, status = status.as_u16(), "Invite accepted");
            return Ok(());
        }

        record_invitation_attempt("failure");
        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status.is_client_error() {
            Err(InviteError::Rejected(message))
        } else {
            Err(InviteError::Unavailable(message))
        }
    }
}
