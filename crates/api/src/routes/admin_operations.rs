//! On-demand runs of the background jobs.

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use domain::services::EXPIRED_REASON;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::metrics::{record_lease_assigned, record_leases_released};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/admin/sweeps", post(run_sweep))
        .route("/api/v1/admin/stock-retries", post(run_stock_retry))
        .route("/api/v1/admin/invitation-resumes", post(run_invitation_resume))
}

/// POST /api/v1/admin/sweeps
pub async fn run_sweep(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.sweeper.run_once().await?;
    record_leases_released(EXPIRED_REASON, report.leases.released);
    Ok(Json(report))
}

/// POST /api/v1/admin/stock-retries
pub async fn run_stock_retry(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.reconciler.retry_pending_stock().await?;
    for _ in 0..report.assigned {
        record_lease_assigned();
    }
    Ok(Json(report))
}

/// POST /api/v1/admin/invitation-resumes
pub async fn run_invitation_resume(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let resumed = state.invitations.resume_stalled(100).await?;
    Ok(Json(resumed.report))
}
