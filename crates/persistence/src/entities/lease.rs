//! Lease entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::Lease;
use domain::store::StoreError;
use sqlx::FromRow;
use uuid::Uuid;

use super::parse_column;

/// Database row mapping for the leases table.
#[derive(Debug, Clone, FromRow)]
pub struct LeaseEntity {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub holder_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<LeaseEntity> for Lease {
    type Error = StoreError;

    fn try_from(entity: LeaseEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity.id,
            order_id: entity.order_id,
            account_id: entity.account_id,
            status: parse_column("leases", "status", &entity.status)?,
            holder_id: entity.holder_id,
            start_at: entity.start_at,
            end_at: entity.end_at,
            reason: entity.reason,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        })
    }
}
