//! Pool account entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::PoolAccount;
use domain::store::StoreError;
use sqlx::FromRow;
use uuid::Uuid;

use super::parse_column;

/// Database row mapping for the pool_accounts table.
#[derive(Debug, Clone, FromRow)]
pub struct PoolAccountEntity {
    pub id: Uuid,
    pub identity: String,
    pub capacity: Option<i32>,
    pub seats_used: i32,
    pub status: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PoolAccountEntity> for PoolAccount {
    type Error = StoreError;

    fn try_from(entity: PoolAccountEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity.id,
            status: parse_column("pool_accounts", "status", &entity.status)?,
            identity: entity.identity,
            capacity: entity.capacity,
            seats_used: entity.seats_used,
            note: entity.note,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        })
    }
}
