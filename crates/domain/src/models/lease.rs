//! Lease domain model.
//!
//! A lease binds one holder to one seat of a pool account for a bounded
//! time window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use super::pool_account::PoolAccount;

/// Lease status. Only `Active` leases occupy a seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Active,
    Ended,
    Revoked,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Active => "ACTIVE",
            LeaseStatus::Ended => "ENDED",
            LeaseStatus::Revoked => "REVOKED",
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, LeaseStatus::Active)
    }
}

impl FromStr for LeaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(LeaseStatus::Active),
            "ENDED" => Ok(LeaseStatus::Ended),
            "REVOKED" => Ok(LeaseStatus::Revoked),
            _ => Err(format!("Unknown lease status: {}", s)),
        }
    }
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lease domain model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub holder_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: LeaseStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self) -> bool {
        self.status == LeaseStatus::Active
    }

    /// True when the lease is still active but its window has run out.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.end_at <= now
    }
}

/// Data needed to insert a lease.
#[derive(Debug, Clone)]
pub struct NewLease {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub holder_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// Filters for the admin lease listing.
#[derive(Debug, Clone, Default)]
pub struct LeaseFilter {
    pub status: Option<LeaseStatus>,
    pub holder_id: Option<String>,
    pub account_id: Option<Uuid>,
    pub expiring_before: Option<DateTime<Utc>>,
}

impl LeaseFilter {
    pub fn matches(&self, lease: &Lease) -> bool {
        self.status.map_or(true, |s| lease.status == s)
            && self.holder_id.as_deref().map_or(true, |h| lease.holder_id == h)
            && self.account_id.map_or(true, |a| lease.account_id == a)
            && self.expiring_before.map_or(true, |t| lease.end_at < t)
    }
}

/// Result of a successful seat assignment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub lease: Lease,
    pub account_id: Uuid,
    pub account_identity: String,
}

/// Outcome of an assignment attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    Assigned(Assignment),
    /// No account had a free seat. Nothing was written.
    NoCapacity,
}

impl AssignOutcome {
    pub fn assignment(&self) -> Option<&Assignment> {
        match self {
            AssignOutcome::Assigned(a) => Some(a),
            AssignOutcome::NoCapacity => None,
        }
    }
}

/// Result of releasing or revoking a lease.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Release {
    pub lease: Lease,
    pub account_identity: String,
    /// True when the lease was already closed and nothing changed.
    pub already_closed: bool,
}

/// Result of extending a lease.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extension {
    pub lease: Lease,
    pub previous_end_at: DateTime<Utc>,
}

/// Summary of one expiry cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub found: usize,
    pub released: usize,
    pub failed: usize,
}

/// Request payload for a manual admin assignment.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ManualAssignRequest {
    pub order_ref: String,

    #[validate(length(min = 1, max = 255, message = "Holder is required"))]
    pub holder_id: Option<String>,

    #[validate(range(min = 1, max = 3650, message = "Duration must be between 1 and 3650 days"))]
    pub duration_days: Option<i64>,
}

/// Request payload for extending a lease.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtendLeaseRequest {
    pub additional_days: i64,
}

/// Request payload for releasing or revoking a lease.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CloseLeaseRequest {
    #[validate(length(max = 255, message = "Reason must be at most 255 characters"))]
    pub reason: Option<String>,
}

/// Admin-facing projection of a lease.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub account_identity: Option<String>,
    pub holder_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: LeaseStatus,
    pub reason: Option<String>,
}

impl LeaseResponse {
    pub fn new(lease: Lease, account: Option<&PoolAccount>) -> Self {
        Self {
            id: lease.id,
            order_id: lease.order_id,
            account_id: lease.account_id,
            account_identity: account.map(|a| a.identity.clone()),
            holder_id: lease.holder_id,
            start_at: lease.start_at,
            end_at: lease.end_at,
            status: lease.status,
            reason: lease.reason,
        }
    }
}
