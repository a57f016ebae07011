//! Payment provider callback endpoint.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use domain::models::PaymentStatus;
use domain::services::{CallbackOutcome, PaymentEffect, ReconcileError};
use serde::Serialize;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::metrics::{
    record_allocation_no_capacity, record_lease_assigned, record_leases_released,
    record_payment_callback,
};

/// Lowercase hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Callback-Signature";

/// Event name; only `payment_status` is acted on.
pub const EVENT_HEADER: &str = "X-Callback-Event";

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
}

/// POST /api/v1/payments/callback
///
/// The body is taken raw so the signature is checked over exactly the bytes
/// the provider signed. Duplicate and ignored deliveries still answer 200 so
/// the provider stops redelivering.
pub async fn payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let event = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());

    let outcome = match state.reconciler.handle_callback(&body, signature, event).await {
        Ok(outcome) => outcome,
        Err(e) => {
            record_payment_callback(match e {
                ReconcileError::InvalidSignature => "rejected",
                _ => "failed",
            });
            return Err(e.into());
        }
    };

    let response = match outcome {
        CallbackOutcome::Applied {
            order_ref,
            to,
            effect,
            ..
        } => {
            record_payment_callback("applied");
            record_effect(&effect);
            CallbackResponse {
                success: true,
                outcome: "applied",
                order_ref: Some(order_ref),
                payment_status: Some(to),
            }
        }
        CallbackOutcome::Noop { order_ref, status } => {
            record_payment_callback("noop");
            CallbackResponse {
                success: true,
                outcome: "noop",
                order_ref: Some(order_ref),
                payment_status: Some(status),
            }
        }
        CallbackOutcome::Ignored(_) => {
            record_payment_callback("ignored");
            CallbackResponse {
                success: true,
                outcome: "ignored",
                order_ref: None,
                payment_status: None,
            }
        }
    };

    Ok(Json(response))
}

fn record_effect(effect: &PaymentEffect) {
    match effect {
        PaymentEffect::Assigned => record_lease_assigned(),
        PaymentEffect::NoCapacity => record_allocation_no_capacity(),
        PaymentEffect::AllocationFailed => {}
        PaymentEffect::Released { count, reason } => record_leases_released(reason, *count),
    }
}
