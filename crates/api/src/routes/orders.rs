//! Order intake and status endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use domain::models::order::CreateOrderRequest;
use domain::models::{InvitationStatus, PaymentStatus};
use serde::Serialize;
use validator::Validate;

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_ref: String,
    pub package_id: String,
    pub amount: i64,
    pub payment_status: PaymentStatus,
    pub invitation_status: InvitationStatus,
    pub created_at: DateTime<Utc>,
}

/// POST /api/v1/orders
///
/// Creates a pending order priced from the package catalogue. The returned
/// `order_ref` is the merchant reference the payment provider echoes back.
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;

    let order = state.orders.create_order(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_ref: order.order_ref,
            package_id: order.package_id,
            amount: order.amount,
            payment_status: order.payment_status,
            invitation_status: order.invitation_status,
            created_at: order.created_at,
        }),
    ))
}

/// GET /api/v1/orders/:order_ref/status
pub async fn get_order_status(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.orders.order_status(&order_ref).await?;
    Ok(Json(status))
}
