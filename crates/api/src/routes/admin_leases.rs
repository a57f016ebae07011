//! Admin lease routes: listing, manual assignment, extension and closing.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use domain::models::lease::{
    CloseLeaseRequest, ExtendLeaseRequest, LeaseResponse, ManualAssignRequest,
};
use domain::models::{LeaseFilter, LeaseStatus, PoolAccount};
use domain::services::{ADMIN_RELEASED_REASON, ADMIN_REVOKED_REASON};
use serde::{Deserialize, Serialize};
use shared::pagination::{PageInfo, PageRequest};
use shared::validation::validate_duration_days;
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::metrics::{record_lease_assigned, record_leases_released};
use crate::middleware::AdminKey;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_leases).post(assign_lease))
        .route("/:lease_id/extend", post(extend_lease))
        .route("/:lease_id/release", post(release_lease))
        .route("/:lease_id/revoke", post(revoke_lease))
}

#[derive(Debug, Deserialize)]
pub struct ListLeasesQuery {
    pub status: Option<String>,
    pub holder: Option<String>,
    pub account_id: Option<Uuid>,
    pub expiring_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListLeasesResponse {
    pub data: Vec<LeaseResponse>,
    pub pagination: PageInfo,
}

#[derive(Debug, Serialize)]
pub struct ExtendLeaseResponse {
    #[serde(flatten)]
    pub lease: LeaseResponse,
    pub previous_end_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CloseLeaseResponse {
    #[serde(flatten)]
    pub lease: LeaseResponse,
    pub already_closed: bool,
}

/// GET /api/v1/admin/leases
pub async fn list_leases(
    State(state): State<AppState>,
    Query(query): Query<ListLeasesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<LeaseStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let filter = LeaseFilter {
        status,
        holder_id: query.holder.filter(|h| !h.trim().is_empty()),
        account_id: query.account_id,
        expiring_before: query.expiring_before,
    };
    let page = PageRequest::new(query.page, query.per_page);

    let (leases, total) = state.store.list_leases(&filter, page).await?;

    let mut accounts: HashMap<Uuid, Option<PoolAccount>> = HashMap::new();
    for lease in &leases {
        if !accounts.contains_key(&lease.account_id) {
            let account = state.store.find_account(lease.account_id).await?;
            accounts.insert(lease.account_id, account);
        }
    }

    let data = leases
        .into_iter()
        .map(|lease| {
            let account = accounts.get(&lease.account_id).and_then(Option::as_ref);
            LeaseResponse::new(lease, account)
        })
        .collect();

    Ok(Json(ListLeasesResponse {
        data,
        pagination: PageInfo::new(page, total),
    }))
}

/// POST /api/v1/admin/leases
///
/// Assigns a seat to a paid order that has none, then starts its invitation.
pub async fn assign_lease(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Json(request): Json<ManualAssignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;

    let assignment = state
        .reconciler
        .assign_paid_order(
            &request.order_ref,
            request.holder_id.as_deref(),
            request.duration_days.map(chrono::Duration::days),
            &admin.audit_actor(),
        )
        .await?;
    record_lease_assigned();

    let mut response = LeaseResponse::new(assignment.lease, None);
    response.account_identity = Some(assignment.account_identity);
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /api/v1/admin/leases/:lease_id/extend
pub async fn extend_lease(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(lease_id): Path<Uuid>,
    Json(request): Json<ExtendLeaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_duration_days(request.additional_days).map_err(|e| {
        ApiError::Validation(
            e.message
                .map(|m| m.to_string())
                .unwrap_or_else(|| e.code.to_string()),
        )
    })?;

    let extension = state
        .allocator
        .extend_assignment(
            lease_id,
            chrono::Duration::days(request.additional_days),
            &admin.audit_actor(),
        )
        .await?;

    let account = state.store.find_account(extension.lease.account_id).await?;
    Ok(Json(ExtendLeaseResponse {
        lease: LeaseResponse::new(extension.lease, account.as_ref()),
        previous_end_at: extension.previous_end_at,
    }))
}

/// POST /api/v1/admin/leases/:lease_id/release
///
/// The body is optional; the reason defaults to `admin_released`.
pub async fn release_lease(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(lease_id): Path<Uuid>,
    request: Option<Json<CloseLeaseRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = close_reason(request, ADMIN_RELEASED_REASON)?;
    let release = state
        .allocator
        .release_assignment(lease_id, &reason, &admin.audit_actor())
        .await?;
    if !release.already_closed {
        record_leases_released(ADMIN_RELEASED_REASON, 1);
    }
    Ok(Json(close_response(release)))
}

/// POST /api/v1/admin/leases/:lease_id/revoke
pub async fn revoke_lease(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminKey>,
    Path(lease_id): Path<Uuid>,
    request: Option<Json<CloseLeaseRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = close_reason(request, ADMIN_REVOKED_REASON)?;
    let release = state
        .allocator
        .revoke_assignment(lease_id, &reason, &admin.audit_actor())
        .await?;
    if !release.already_closed {
        record_leases_released(ADMIN_REVOKED_REASON, 1);
    }
    Ok(Json(close_response(release)))
}

fn close_reason(
    request: Option<Json<CloseLeaseRequest>>,
    default: &str,
) -> Result<String, ApiError> {
    let Json(request) = request.unwrap_or_default();
    request.validate()?;
    Ok(request
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| default.to_string()))
}

fn close_response(release: domain::models::Release) -> CloseLeaseResponse {
    let mut lease = LeaseResponse::new(release.lease, None);
    lease.account_identity = Some(release.account_identity);
    CloseLeaseResponse {
        lease,
        already_closed: release.already_closed,
    }
}
