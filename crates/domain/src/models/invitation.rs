//! Invitation attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Result of one call to the invite executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "failure" => Ok(AttemptOutcome::Failure),
            "timeout" => Ok(AttemptOutcome::Timeout),
            _ => Err(format!("Unknown attempt outcome: {}", s)),
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationAttempt {
    pub id: Uuid,
    pub order_id: Uuid,
    pub lease_id: Option<Uuid>,
    /// 1-based.
    pub attempt_number: i32,
    pub outcome: AttemptOutcome,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvitationAttempt {
    pub id: Uuid,
    pub order_id: Uuid,
    pub lease_id: Option<Uuid>,
    pub attempt_number: i32,
    pub outcome: AttemptOutcome,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}
