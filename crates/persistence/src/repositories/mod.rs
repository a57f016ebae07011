//! Repository implementations for database operations.
//!
//! Repositories are plain query functions generic over [`sqlx::PgExecutor`],
//! so the same SQL runs against the pool for reads and against an open
//! transaction inside a unit of work.

pub mod audit_log;
pub mod invitation_attempt;
pub mod lease;
pub mod order;
pub mod pool_account;
