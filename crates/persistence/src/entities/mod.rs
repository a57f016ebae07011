//! Database entity definitions.
//!
//! Entities map database rows 1:1. Status columns are stored as text and
//! parsed into domain enums on conversion; an unknown value surfaces as
//! [`StoreError::Corrupt`](domain::store::StoreError::Corrupt).

pub mod audit_log;
pub mod invitation_attempt;
pub mod lease;
pub mod order;
pub mod pool_account;

pub use audit_log::AuditLogEntity;
pub use invitation_attempt::InvitationAttemptEntity;
pub use lease::LeaseEntity;
pub use order::OrderEntity;
pub use pool_account::PoolAccountEntity;

use domain::store::StoreError;
use std::str::FromStr;

/// Parses a stored enum column.
pub(crate) fn parse_column<T>(table: &str, column: &str, value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| StoreError::Corrupt(format!("{}.{}: {}", table, column, e)))
}
