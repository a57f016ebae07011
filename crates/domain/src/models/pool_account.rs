//! Pool account domain model.
//!
//! A pool account is one shared third-party subscription whose seats are
//! handed out to paying customers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Lifecycle status of a pool account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Has at least one free seat and may be picked.
    Available,
    /// Every seat is occupied.
    Assigned,
    /// Taken out of rotation by an operator.
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Available => "AVAILABLE",
            AccountStatus::Assigned => "ASSIGNED",
            AccountStatus::Suspended => "SUSPENDED",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AVAILABLE" => Ok(AccountStatus::Available),
            "ASSIGNED" => Ok(AccountStatus::Assigned),
            "SUSPENDED" => Ok(AccountStatus::Suspended),
            _ => Err(format!("Unknown account status: {}", s)),
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Computes the status an account should carry for a given seat count.
///
/// Suspension is sticky: occupancy changes never lift it.
pub fn occupancy_status(current: AccountStatus, capacity: Option<i32>, seats_used: i32) -> AccountStatus {
    if current == AccountStatus::Suspended {
        return AccountStatus::Suspended;
    }
    if seats_used >= capacity.unwrap_or(1) {
        AccountStatus::Assigned
    } else {
        AccountStatus::Available
    }
}

/// Pool account domain model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolAccount {
    pub id: Uuid,
    pub identity: String,
    /// Seat count; `None` means a single-seat account.
    pub capacity: Option<i32>,
    pub seats_used: i32,
    pub status: AccountStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PoolAccount {
    pub fn effective_capacity(&self) -> i32 {
        self.capacity.unwrap_or(1)
    }

    /// True when the account may be handed to a new holder.
    pub fn has_free_seat(&self) -> bool {
        self.status == AccountStatus::Available && self.seats_used < self.effective_capacity()
    }

    /// Applies a new seat count and recomputes the status from it.
    pub fn set_seats_used(&mut self, seats_used: i32, at: DateTime<Utc>) {
        self.seats_used = seats_used.max(0);
        self.status = occupancy_status(self.status, self.capacity, self.seats_used);
        self.updated_at = at;
    }
}

/// Data needed to insert a pool account.
#[derive(Debug, Clone)]
pub struct NewPoolAccount {
    pub id: Uuid,
    pub identity: String,
    pub capacity: Option<i32>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request payload for registering a pool account.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePoolAccountRequest {
    #[validate(email(message = "Identity must be a valid email address"))]
    pub identity: String,

    #[validate(range(min = 1, message = "Capacity must be at least 1"))]
    pub capacity: Option<i32>,

    #[validate(length(max = 500, message = "Note must be at most 500 characters"))]
    pub note: Option<String>,
}

/// Request payload for editing a pool account.
///
/// Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdatePoolAccountRequest {
    #[validate(email(message = "Identity must be a valid email address"))]
    pub identity: Option<String>,

    #[validate(range(min = 1, message = "Capacity must be at least 1"))]
    pub capacity: Option<i32>,

    #[validate(length(max = 500, message = "Note must be at most 500 characters"))]
    pub note: Option<String>,
}

/// Admin-facing projection of a pool account.
#[derive(Debug, Clone, Serialize)]
pub struct PoolAccountResponse {
    pub id: Uuid,
    pub identity: String,
    pub capacity: Option<i32>,
    pub effective_capacity: i32,
    pub seats_used: i32,
    pub status: AccountStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PoolAccount> for PoolAccountResponse {
    fn from(account: PoolAccount) -> Self {
        Self {
            effective_capacity: account.effective_capacity(),
            id: account.id,
            identity: account.identity,
            capacity: account.capacity,
            seats_used: account.seats_used,
            status: account.status,
            note: account.note,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}
