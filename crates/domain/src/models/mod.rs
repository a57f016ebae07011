//! Domain models for the seat lease service.

pub mod audit_log;
pub mod invitation;
pub mod lease;
pub mod order;
pub mod pool_account;

pub use audit_log::{ActorType, AuditAction, AuditActor, AuditEntry, AuditFilter, NewAuditEntry};
pub use invitation::{AttemptOutcome, InvitationAttempt, NewInvitationAttempt};
pub use lease::{
    AssignOutcome, Assignment, CleanupReport, Extension, Lease, LeaseFilter, LeaseStatus, NewLease,
    Release,
};
pub use order::{InvitationStatus, NewOrder, Order, OrderFilter, Package, PaymentStatus};
pub use pool_account::{occupancy_status, AccountStatus, NewPoolAccount, PoolAccount};
