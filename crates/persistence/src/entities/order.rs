//! Order entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::Order;
use domain::store::StoreError;
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

use super::parse_column;

/// Database row mapping for the orders table.
#[derive(Debug, Clone, FromRow)]
pub struct OrderEntity {
    pub id: Uuid,
    pub order_ref: String,
    pub reference: Option<String>,
    pub customer_email: String,
    pub full_name: Option<String>,
    pub package_id: String,
    pub amount: i64,
    pub payment_status: String,
    pub invitation_status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub raw_callback: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderEntity> for Order {
    type Error = StoreError;

    fn try_from(entity: OrderEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity.id,
            payment_status: parse_column("orders", "payment_status", &entity.payment_status)?,
            invitation_status: parse_column("orders", "invitation_status", &entity.invitation_status)?,
            order_ref: entity.order_ref,
            reference: entity.reference,
            customer_email: entity.customer_email,
            full_name: entity.full_name,
            package_id: entity.package_id,
            amount: entity.amount,
            paid_at: entity.paid_at,
            raw_callback: entity.raw_callback,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        })
    }
}
