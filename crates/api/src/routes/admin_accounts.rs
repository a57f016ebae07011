//! Admin pool account routes.
//!
//! Adding capacity (a new account, a raised capacity, a re-enabled account)
//! immediately re-runs assignment for paid orders waiting on stock.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use domain::models::pool_account::{
    CreatePoolAccountRequest, PoolAccountResponse, UpdatePoolAccountRequest,
};
use domain::models::AccountStatus;
use serde::{Deserialize, Serialize};
use shared::pagination::{PageInfo, PageRequest};
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::metrics::record_lease_assigned;
use crate::middleware::AdminKey;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_accounts).post(create_account))
        .route("/:account_id", put(update_account).delete(delete_account))
        .route("/:account_id/suspend", post(suspend_account))
        .route("/:account_id/enable", post(enable_account))
}

#[derive(Debug, Deserialize)]
pub struct ListAccountsQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListAccountsResponse {
    pub data: Vec<PoolAccountResponse>,
    pub pagination: PageInfo,
}

/// GET /api/v1/admin/accounts
pub async fn list_accounts(
    State(state): State<AppState>,
    Query(query): Query<ListAccountsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AccountStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let page = PageRequest::new(query.page, query.per_page);

    let (accounts, total) = state.store.list_accounts(status, page).await?;

    Ok(Json(ListAccountsResponse {
        data: accounts.into_iter().map(PoolAccountResponse::from).collect(),
        pagination: PageInfo::new(page, total),
    }))
}

/// POST /api/v1/admin/accounts
pub async fn create_account(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Json(request): Json<CreatePoolAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;

    let account = state
        .allocator
        .create_account(
            &request.identity,
            request.capacity,
            request.note,
            &admin.audit_actor(),
        )
        .await?;

    retry_waiting_orders(&state).await;
    Ok((StatusCode::CREATED, Json(PoolAccountResponse::from(account))))
}

/// PUT /api/v1/admin/accounts/:account_id
pub async fn update_account(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<UpdatePoolAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;
    let capacity_changed = request.capacity.is_some();

    let account = state
        .allocator
        .update_account(account_id, request, &admin.audit_actor())
        .await?;

    if capacity_changed {
        retry_waiting_orders(&state).await;
    }
    Ok(Json(PoolAccountResponse::from(account)))
}

/// DELETE /api/v1/admin/accounts/:account_id
///
/// Refused with 409 while the account still has active leases.
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .allocator
        .delete_account(account_id, &admin.audit_actor())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/admin/accounts/:account_id/suspend
pub async fn suspend_account(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state
        .allocator
        .suspend_account(account_id, &admin.audit_actor())
        .await?;
    Ok(Json(PoolAccountResponse::from(account)))
}

/// POST /api/v1/admin/accounts/:account_id/enable
pub async fn enable_account(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state
        .allocator
        .enable_account(account_id, &admin.audit_actor())
        .await?;

    retry_waiting_orders(&state).await;
    Ok(Json(PoolAccountResponse::from(account)))
}

/// Best effort: the account change is already committed.
async fn retry_waiting_orders(state: &AppState) {
    match state.reconciler.retry_pending_stock().await {
        Ok(report) => {
            for _ in 0..report.assigned {
                record_lease_assigned();
            }
        }
        Err(e) => tracing::warn!(error = %e, "Pending stock retry after pool change failed"),
    }
}
