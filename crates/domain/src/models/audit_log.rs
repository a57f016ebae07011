//! Audit log domain models.
//!
//! Every lease and pool mutation appends one entry in the same unit of work
//! that performs it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

/// Actor types that can perform audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Background jobs and internal flows.
    System,
    /// Operator acting through the admin API.
    Admin,
    /// Payment provider callback.
    PaymentProvider,
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(ActorType::System),
            "admin" => Ok(ActorType::Admin),
            "payment_provider" => Ok(ActorType::PaymentProvider),
            _ => Err(format!("Unknown actor type: {}", s)),
        }
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::System => write!(f, "system"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::PaymentProvider => write!(f, "payment_provider"),
        }
    }
}

/// Audited actions following the format: resource.operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    // Lease actions
    #[serde(rename = "lease.assign")]
    LeaseAssign,
    #[serde(rename = "lease.release")]
    LeaseRelease,
    #[serde(rename = "lease.revoke")]
    LeaseRevoke,
    #[serde(rename = "lease.extend")]
    LeaseExtend,

    // Pool account actions
    #[serde(rename = "account.create")]
    AccountCreate,
    #[serde(rename = "account.update")]
    AccountUpdate,
    #[serde(rename = "account.suspend")]
    AccountSuspend,
    #[serde(rename = "account.enable")]
    AccountEnable,
    #[serde(rename = "account.delete")]
    AccountDelete,

    // Order actions
    #[serde(rename = "order.create")]
    OrderCreate,
    #[serde(rename = "order.payment_status")]
    OrderPaymentStatus,
    #[serde(rename = "order.expire")]
    OrderExpire,
    #[serde(rename = "order.invitation_status")]
    OrderInvitationStatus,
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lease.assign" => Ok(AuditAction::LeaseAssign),
            "lease.release" => Ok(AuditAction::LeaseRelease),
            "lease.revoke" => Ok(AuditAction::LeaseRevoke),
            "lease.extend" => Ok(AuditAction::LeaseExtend),
            "account.create" => Ok(AuditAction::AccountCreate),
            "account.update" => Ok(AuditAction::AccountUpdate),
            "account.suspend" => Ok(AuditAction::AccountSuspend),
            "account.enable" => Ok(AuditAction::AccountEnable),
            "account.delete" => Ok(AuditAction::AccountDelete),
            "order.create" => Ok(AuditAction::OrderCreate),
            "order.payment_status" => Ok(AuditAction::OrderPaymentStatus),
            "order.expire" => Ok(AuditAction::OrderExpire),
            "order.invitation_status" => Ok(AuditAction::OrderInvitationStatus),
            _ => Err(format!("Unknown audit action: {}", s)),
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::LeaseAssign => "lease.assign",
            AuditAction::LeaseRelease => "lease.release",
            AuditAction::LeaseRevoke => "lease.revoke",
            AuditAction::LeaseExtend => "lease.extend",
            AuditAction::AccountCreate => "account.create",
            AuditAction::AccountUpdate => "account.update",
            AuditAction::AccountSuspend => "account.suspend",
            AuditAction::AccountEnable => "account.enable",
            AuditAction::AccountDelete => "account.delete",
            AuditAction::OrderCreate => "order.create",
            AuditAction::OrderPaymentStatus => "order.payment_status",
            AuditAction::OrderExpire => "order.expire",
            AuditAction::OrderInvitationStatus => "order.invitation_status",
        };
        write!(f, "{}", s)
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub name: String,
}

impl AuditActor {
    /// Create a system actor.
    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            name: "system".to_string(),
        }
    }

    /// Create an admin actor.
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Admin,
            name: name.into(),
        }
    }

    /// Create a payment provider actor.
    pub fn payment_provider(name: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::PaymentProvider,
            name: name.into(),
        }
    }
}

/// Audit log entry domain model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_type: ActorType,
    pub actor: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Input for appending an audit entry.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub actor_type: ActorType,
    pub actor: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Filters for the audit log listing.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_type: Option<ActorType>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.action.map_or(true, |a| entry.action == a)
            && self.entity_type.as_deref().map_or(true, |t| entry.entity_type == t)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |id| entry.entity_id.as_deref() == Some(id))
            && self.actor_type.map_or(true, |t| entry.actor_type == t)
    }
}
