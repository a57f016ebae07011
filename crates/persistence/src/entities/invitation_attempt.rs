//! Invitation attempt entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::InvitationAttempt;
use domain::store::StoreError;
use sqlx::FromRow;
use uuid::Uuid;

use super::parse_column;

/// Database row mapping for the invitation_attempts table.
#[derive(Debug, Clone, FromRow)]
pub struct InvitationAttemptEntity {
    pub id: Uuid,
    pub order_id: Uuid,
    pub lease_id: Option<Uuid>,
    pub attempt_number: i32,
    pub outcome: String,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl TryFrom<InvitationAttemptEntity> for InvitationAttempt {
    type Error = StoreError;

    fn try_from(entity: InvitationAttemptEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity.id,
            order_id: entity.order_id,
            lease_id: entity.lease_id,
            attempt_number: entity.attempt_number,
            outcome: parse_column("invitation_attempts", "outcome", &entity.outcome)?,
            error_message: entity.error_message,
            attempted_at: entity.attempted_at,
        })
    }
}
