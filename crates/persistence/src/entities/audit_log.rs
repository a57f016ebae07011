//! Audit log entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::AuditEntry;
use domain::store::StoreError;
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

use super::parse_column;

/// Database row mapping for the audit_log table.
#[derive(Debug, Clone, FromRow)]
pub struct AuditLogEntity {
    pub id: Uuid,
    pub actor_type: String,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AuditLogEntity> for AuditEntry {
    type Error = StoreError;

    fn try_from(entity: AuditLogEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity.id,
            actor_type: parse_column("audit_log", "actor_type", &entity.actor_type)?,
            action: parse_column("audit_log", "action", &entity.action)?,
            actor: entity.actor,
            entity_type: entity.entity_type,
            entity_id: entity.entity_id,
            payload: entity.payload,
            created_at: entity.created_at,
        })
    }
}
