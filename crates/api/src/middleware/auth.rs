//! Admin authentication middleware.
//!
//! Admin routes require the `X-Admin-Key` header. The key is checked against
//! the SHA-256 digest of the configured key, so the plain key is never kept
//! in application state.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use domain::models::AuditActor;
use serde_json::json;
use shared::crypto::matches_sha256_digest;

use crate::app::AppState;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Optional operator name recorded on audit entries.
pub const ADMIN_ACTOR_HEADER: &str = "X-Admin-Actor";

const MAX_ACTOR_LEN: usize = 100;

/// Authenticated admin, stored in request extensions.
#[derive(Debug, Clone)]
pub struct AdminKey {
    pub actor: String,
}

impl AdminKey {
    pub fn audit_actor(&self) -> AuditActor {
        AuditActor::admin(self.actor.clone())
    }
}

/// Middleware for admin-only routes.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_key_digest.as_deref() else {
        return unauthorized_response("Admin API is not configured");
    };

    let presented = req
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(key) if matches_sha256_digest(key, expected) => {}
        _ => {
            tracing::warn!("Rejected admin request with invalid or missing key");
            return unauthorized_response("Invalid or missing admin key");
        }
    }

    let actor = req
        .headers()
        .get(ADMIN_ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_ACTOR_LEN).collect())
        .unwrap_or_else(|| "admin".to_string());

    req.extensions_mut().insert(AdminKey { actor });
    next.run(req).await
}

/// Helper to create unauthorized response.
fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "message": message
        })),
    )
        .into_response()
}
