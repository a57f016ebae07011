//! Admin order routes: listing, invitation history and re-invites.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use domain::models::{InvitationAttempt, InvitationStatus, Order, OrderFilter, PaymentStatus};
use serde::{Deserialize, Serialize};
use shared::pagination::{PageInfo, PageRequest};

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::AdminKey;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/admin/orders", get(list_orders))
        .route(
            "/api/v1/admin/orders/:order_ref/invitations",
            get(list_invitation_attempts).post(resend_invitation),
        )
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub payment_status: Option<String>,
    pub invitation_status: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListOrdersResponse {
    pub data: Vec<Order>,
    pub pagination: PageInfo,
}

#[derive(Debug, Serialize)]
pub struct InvitationAttemptsResponse {
    pub order_ref: String,
    pub invitation_status: InvitationStatus,
    pub attempts: Vec<InvitationAttempt>,
}

#[derive(Debug, Serialize)]
pub struct ResendInvitationResponse {
    pub order_ref: String,
    pub invitation_status: InvitationStatus,
    /// Number the first attempt of the new run is recorded under.
    pub first_attempt: u32,
}

/// GET /api/v1/admin/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let payment_status = query
        .payment_status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<PaymentStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let invitation_status = query
        .invitation_status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<InvitationStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let filter = OrderFilter {
        payment_status,
        invitation_status,
    };
    let page = PageRequest::new(query.page, query.per_page);

    let (orders, total) = state.store.list_orders(&filter, page).await?;

    Ok(Json(ListOrdersResponse {
        data: orders,
        pagination: PageInfo::new(page, total),
    }))
}

/// GET /api/v1/admin/orders/:order_ref/invitations
pub async fn list_invitation_attempts(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .store
        .find_order_by_ref(&order_ref)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {} not found", order_ref)))?;
    let attempts = state.store.list_invitation_attempts(order.id).await?;

    Ok(Json(InvitationAttemptsResponse {
        order_ref: order.order_ref,
        invitation_status: order.invitation_status,
        attempts,
    }))
}

/// POST /api/v1/admin/orders/:order_ref/invitations
///
/// Starts a new invitation run in the background and answers right away.
pub async fn resend_invitation(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(order_ref): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let resent = state
        .invitations
        .resend(&order_ref, &admin.audit_actor())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ResendInvitationResponse {
            order_ref: resent.order.order_ref,
            invitation_status: resent.order.invitation_status,
            first_attempt: resent.first_attempt,
        }),
    ))
}
