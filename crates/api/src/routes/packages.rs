//! Package catalogue endpoint.

use axum::{extract::State, Json};
use domain::models::Package;
use serde::Serialize;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub struct ListPackagesResponse {
    pub data: Vec<Package>,
}

/// GET /api/v1/packages
pub async fn list_packages(State(state): State<AppState>) -> Json<ListPackagesResponse> {
    Json(ListPackagesResponse {
        data: state.orders.catalog().list(),
    })
}
