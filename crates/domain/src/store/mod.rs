//! Storage abstraction for allocation state.
//!
//! All mutations go through a [`UnitOfWork`]: a transaction that holds
//! exclusive locks on the rows it touched until it is committed or rolled
//! back. Dropping an uncommitted unit of work discards its writes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::pagination::PageRequest;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AccountStatus, AuditEntry, AuditFilter, InvitationAttempt, InvitationStatus, Lease,
    LeaseFilter, NewAuditEntry, NewInvitationAttempt, NewLease, NewOrder, NewPoolAccount, Order,
    OrderFilter, PoolAccount,
};

pub use memory::InMemoryStore;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Shared handle to the allocation state.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Opens a unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Cheap connectivity check behind `/api/health/ready`.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_account(&self, id: Uuid) -> Result<Option<PoolAccount>, StoreError>;

    /// Accounts ordered by creation time, with the total matching count.
    async fn list_accounts(
        &self,
        status: Option<AccountStatus>,
        page: PageRequest,
    ) -> Result<(Vec<PoolAccount>, i64), StoreError>;

    async fn find_lease(&self, id: Uuid) -> Result<Option<Lease>, StoreError>;

    /// Leases ordered newest first, with the total matching count.
    async fn list_leases(
        &self,
        filter: &LeaseFilter,
        page: PageRequest,
    ) -> Result<(Vec<Lease>, i64), StoreError>;

    /// Most recently started active lease of a holder.
    async fn find_active_lease_for_holder(&self, holder_id: &str) -> Result<Option<Lease>, StoreError>;

    async fn find_active_leases_for_order(&self, order_id: Uuid) -> Result<Vec<Lease>, StoreError>;

    /// Active leases whose `end_at` is at or before `now`.
    async fn find_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError>;

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>, StoreError>;

    /// Looks up an order by the provider's transaction reference.
    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>, StoreError>;

    /// Orders newest first, with the total matching count.
    async fn list_orders(
        &self,
        filter: &OrderFilter,
        page: PageRequest,
    ) -> Result<(Vec<Order>, i64), StoreError>;

    /// Oldest first.
    async fn list_orders_by_invitation_status(
        &self,
        status: InvitationStatus,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError>;

    /// Orders still pending payment that were created before `cutoff`.
    async fn find_stale_pending_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    /// Entries ordered newest first, with the total matching count.
    async fn list_audit_entries(
        &self,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<(Vec<AuditEntry>, i64), StoreError>;

    async fn list_invitation_attempts(&self, order_id: Uuid) -> Result<Vec<InvitationAttempt>, StoreError>;
}

/// A transaction over the allocation state.
///
/// `lock_*` methods return the current row and hold it exclusively until the
/// unit of work ends. `update_*` methods write the full mutable state of a
/// row previously read through the same unit of work.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Locks the oldest account with a free seat, skipping rows other units
    /// of work hold.
    async fn lock_next_available_account(&mut self) -> Result<Option<PoolAccount>, StoreError>;

    async fn lock_account(&mut self, id: Uuid) -> Result<Option<PoolAccount>, StoreError>;

    async fn lock_lease(&mut self, id: Uuid) -> Result<Option<Lease>, StoreError>;

    async fn lock_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Active leases of an order, locked.
    async fn active_leases_for_order(&mut self, order_id: Uuid) -> Result<Vec<Lease>, StoreError>;

    async fn count_active_leases(&mut self, account_id: Uuid) -> Result<i64, StoreError>;

    /// Fails with [`StoreError::Conflict`] on a duplicate identity.
    async fn insert_account(&mut self, account: NewPoolAccount) -> Result<PoolAccount, StoreError>;

    async fn update_account(&mut self, account: &PoolAccount) -> Result<(), StoreError>;

    /// Deletes the account together with its closed leases.
    async fn delete_account(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Conflict`] when the order already has an
    /// active lease.
    async fn insert_lease(&mut self, lease: NewLease) -> Result<Lease, StoreError>;

    async fn update_lease(&mut self, lease: &Lease) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Conflict`] on a duplicate order reference.
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError>;

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn insert_invitation_attempt(
        &mut self,
        attempt: NewInvitationAttempt,
    ) -> Result<InvitationAttempt, StoreError>;

    async fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
