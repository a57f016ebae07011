//! Audit log routes.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use domain::models::{ActorType, AuditAction, AuditEntry, AuditFilter};
use serde::{Deserialize, Serialize};
use shared::pagination::{PageInfo, PageRequest};

use crate::app::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_audit_logs))
}

#[derive(Debug, Deserialize)]
pub struct ListAuditLogsQuery {
    pub action: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_type: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListAuditLogsResponse {
    pub data: Vec<AuditEntry>,
    pub pagination: PageInfo,
}

impl ListAuditLogsQuery {
    fn filter(&self) -> Result<AuditFilter, ApiError> {
        Ok(AuditFilter {
            action: parse_opt::<AuditAction>(self.action.as_deref())?,
            entity_type: non_empty(self.entity_type.as_deref()),
            entity_id: non_empty(self.entity_id.as_deref()),
            actor_type: parse_opt::<ActorType>(self.actor_type.as_deref())?,
        })
    }
}

/// GET /api/v1/admin/audit-logs
///
/// Newest first.
pub async fn list_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<ListAuditLogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.filter()?;
    let page = PageRequest::new(query.page, query.per_page);

    let (entries, total) = state.store.list_audit_entries(&filter, page).await?;

    Ok(Json(ListAuditLogsResponse {
        data: entries,
        pagination: PageInfo::new(page, total),
    }))
}

fn parse_opt<T>(value: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr<Err = String>,
{
    non_empty(value)
        .map(|v| v.parse::<T>())
        .transpose()
        .map_err(ApiError::Validation)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
