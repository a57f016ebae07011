//! Audit entry construction.
//!
//! Services build entries here and append them through the same unit of
//! work as the mutation they describe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::models::{AuditAction, AuditActor, NewAuditEntry};

/// Builder for audit entries with a fluent API.
#[derive(Debug, Clone)]
pub struct AuditEntryBuilder {
    actor: AuditActor,
    action: AuditAction,
    entity_type: String,
    entity_id: Option<String>,
    payload: Map<String, JsonValue>,
}

impl AuditEntryBuilder {
    pub fn new(actor: &AuditActor, action: AuditAction) -> Self {
        Self {
            actor: actor.clone(),
            action,
            entity_type: String::new(),
            entity_id: None,
            payload: Map::new(),
        }
    }

    /// Set the entity being acted upon.
    pub fn on_entity(mut self, entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        self.entity_type = entity_type.into();
        self.entity_id = Some(entity_id.to_string());
        self
    }

    /// Add a payload field. Values that fail to serialize are stored as null.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(JsonValue::Null);
        self.payload.insert(key.into(), value);
        self
    }

    pub fn build(self, at: DateTime<Utc>) -> NewAuditEntry {
        NewAuditEntry {
            id: Uuid::new_v4(),
            actor_type: self.actor.actor_type,
            actor: self.actor.name,
            action: self.action,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            payload: JsonValue::Object(self.payload),
            created_at: at,
        }
    }
}

/// Helper functions for the entries every flow writes.
pub mod audit_helpers {
    use super::*;
    use crate::models::{
        InvitationStatus, Lease, Order, PaymentStatus, PoolAccount,
    };

    pub fn lease_assigned(
        actor: &AuditActor,
        lease: &Lease,
        account: &PoolAccount,
        order_ref: &str,
        at: DateTime<Utc>,
    ) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, AuditAction::LeaseAssign)
            .on_entity("lease", lease.id)
            .with_field("account_id", account.id)
            .with_field("account_identity", &account.identity)
            .with_field("holder_id", &lease.holder_id)
            .with_field("order_ref", order_ref)
            .with_field("start_at", lease.start_at)
            .with_field("end_at", lease.end_at)
            .with_field("seats_used", account.seats_used)
            .build(at)
    }

    /// Release or revoke, depending on `action`.
    pub fn lease_closed(
        actor: &AuditActor,
        action: AuditAction,
        lease: &Lease,
        account_identity: &str,
        at: DateTime<Utc>,
    ) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, action)
            .on_entity("lease", lease.id)
            .with_field("account_id", lease.account_id)
            .with_field("account_identity", account_identity)
            .with_field("holder_id", &lease.holder_id)
            .with_field("status", lease.status)
            .with_field("reason", &lease.reason)
            .with_field("closed_at", at)
            .build(at)
    }

    pub fn lease_extended(
        actor: &AuditActor,
        lease: &Lease,
        previous_end_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, AuditAction::LeaseExtend)
            .on_entity("lease", lease.id)
            .with_field("holder_id", &lease.holder_id)
            .with_field("previous_end_at", previous_end_at)
            .with_field("end_at", lease.end_at)
            .build(at)
    }

    pub fn account_changed(
        actor: &AuditActor,
        action: AuditAction,
        account: &PoolAccount,
        at: DateTime<Utc>,
    ) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, action)
            .on_entity("account", account.id)
            .with_field("identity", &account.identity)
            .with_field("capacity", account.capacity)
            .with_field("seats_used", account.seats_used)
            .with_field("status", account.status)
            .build(at)
    }

    pub fn order_created(actor: &AuditActor, order: &Order, at: DateTime<Utc>) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, AuditAction::OrderCreate)
            .on_entity("order", order.id)
            .with_field("order_ref", &order.order_ref)
            .with_field("package_id", &order.package_id)
            .with_field("amount", order.amount)
            .build(at)
    }

    pub fn order_payment_status(
        actor: &AuditActor,
        order: &Order,
        previous: PaymentStatus,
        at: DateTime<Utc>,
    ) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, AuditAction::OrderPaymentStatus)
            .on_entity("order", order.id)
            .with_field("order_ref", &order.order_ref)
            .with_field("reference", &order.reference)
            .with_field("from", previous)
            .with_field("to", order.payment_status)
            .build(at)
    }

    pub fn order_expired(actor: &AuditActor, order: &Order, at: DateTime<Utc>) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, AuditAction::OrderExpire)
            .on_entity("order", order.id)
            .with_field("order_ref", &order.order_ref)
            .with_field("created_at", order.created_at)
            .build(at)
    }

    pub fn order_invitation_status(
        actor: &AuditActor,
        order: &Order,
        previous: InvitationStatus,
        at: DateTime<Utc>,
    ) -> NewAuditEntry {
        AuditEntryBuilder::new(actor, AuditAction::OrderInvitationStatus)
            .on_entity("order", order.id)
            .with_field("order_ref", &order.order_ref)
            .with_field("from", previous)
            .with_field("to", order.invitation_status)
            .build(at)
    }
}
