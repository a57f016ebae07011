//! In-memory allocation store.
//!
//! A unit of work holds the store mutex for its whole lifetime and works on
//! a staged copy of the state. Commit publishes the copy; rollback or drop
//! discards it. Units of work are therefore fully serialized, which gives
//! the same exclusivity guarantees as row locks in PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::pagination::PageRequest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{AllocationStore, StoreError, UnitOfWork};
use crate::models::{
    AccountStatus, AuditEntry, AuditFilter, InvitationAttempt, InvitationStatus, Lease,
    LeaseFilter, LeaseStatus, NewAuditEntry, NewInvitationAttempt, NewLease, NewOrder,
    NewPoolAccount, Order, OrderFilter, PaymentStatus, PoolAccount,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, PoolAccount>,
    leases: HashMap<Uuid, Lease>,
    orders: HashMap<Uuid, Order>,
    attempts: Vec<InvitationAttempt>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn has_active_lease_for_order(&self, order_id: Uuid) -> bool {
        self.leases
            .values()
            .any(|l| l.order_id == order_id && l.status == LeaseStatus::Active)
    }
}

/// Allocation store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_audit_writes: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent audit append fail until reset. Used to check
    /// that a failing unit of work leaves no partial state behind.
    pub fn set_audit_failure(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    /// Every audit entry, oldest first.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    pub async fn all_leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.state.lock().await.leases.values().cloned().collect();
        leases.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        leases
    }
}

fn paginate<T>(items: Vec<T>, page: PageRequest) -> (Vec<T>, i64) {
    let total = items.len() as i64;
    let rows = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect();
    (rows, total)
}

fn by_creation(a: &PoolAccount, b: &PoolAccount) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

#[async_trait]
impl AllocationStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            staged,
            fail_audit_writes: self.fail_audit_writes.clone(),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<PoolAccount>, StoreError> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn list_accounts(
        &self,
        status: Option<AccountStatus>,
        page: PageRequest,
    ) -> Result<(Vec<PoolAccount>, i64), StoreError> {
        let state = self.state.lock().await;
        let mut accounts: Vec<PoolAccount> = state
            .accounts
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        accounts.sort_by(by_creation);
        Ok(paginate(accounts, page))
    }

    async fn find_lease(&self, id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.state.lock().await.leases.get(&id).cloned())
    }

    async fn list_leases(
        &self,
        filter: &LeaseFilter,
        page: PageRequest,
    ) -> Result<(Vec<Lease>, i64), StoreError> {
        let state = self.state.lock().await;
        let mut leases: Vec<Lease> = state
            .leases
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        leases.sort_by(|a, b| b.start_at.cmp(&a.start_at).then(b.id.cmp(&a.id)));
        Ok(paginate(leases, page))
    }

    async fn find_active_lease_for_holder(&self, holder_id: &str) -> Result<Option<Lease>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .leases
            .values()
            .filter(|l| l.holder_id == holder_id && l.status == LeaseStatus::Active)
            .max_by(|a, b| a.start_at.cmp(&b.start_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn find_active_leases_for_order(&self, order_id: Uuid) -> Result<Vec<Lease>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .leases
            .values()
            .filter(|l| l.order_id == order_id && l.status == LeaseStatus::Active)
            .cloned()
            .collect())
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError> {
        let state = self.state.lock().await;
        let mut leases: Vec<Lease> = state
            .leases
            .values()
            .filter(|l| l.is_expired_at(now))
            .cloned()
            .collect();
        leases.sort_by(|a, b| a.end_at.cmp(&b.end_at).then(a.id.cmp(&b.id)));
        Ok(leases)
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.orders.values().find(|o| o.order_ref == order_ref).cloned())
    }

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
        page: PageRequest,
    ) -> Result<(Vec<Order>, i64), StoreError> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(orders, page))
    }

    async fn list_orders_by_invitation_status(
        &self,
        status: InvitationStatus,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.invitation_status == status)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn find_stale_pending_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.payment_status == PaymentStatus::Pending && o.created_at < cutoff)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn list_audit_entries(
        &self,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<(Vec<AuditEntry>, i64), StoreError> {
        let state = self.state.lock().await;
        // Reverse first so that entries sharing a timestamp stay newest first.
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(entries, page))
    }

    async fn list_invitation_attempts(&self, order_id: Uuid) -> Result<Vec<InvitationAttempt>, StoreError> {
        let state = self.state.lock().await;
        let mut attempts: Vec<InvitationAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.order_id == order_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }
}

/// Unit of work over [`InMemoryStore`].
pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    fail_audit_writes: Arc<AtomicBool>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_next_available_account(&mut self) -> Result<Option<PoolAccount>, StoreError> {
        let mut candidates: Vec<&PoolAccount> = self
            .staged
            .accounts
            .values()
            .filter(|a| a.has_free_seat())
            .collect();
        candidates.sort_by(|a, b| by_creation(a, b));
        Ok(candidates.first().map(|a| (*a).clone()))
    }

    async fn lock_account(&mut self, id: Uuid) -> Result<Option<PoolAccount>, StoreError> {
        Ok(self.staged.accounts.get(&id).cloned())
    }

    async fn lock_lease(&mut self, id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.staged.leases.get(&id).cloned())
    }

    async fn lock_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.staged.orders.get(&id).cloned())
    }

    async fn active_leases_for_order(&mut self, order_id: Uuid) -> Result<Vec<Lease>, StoreError> {
        Ok(self
            .staged
            .leases
            .values()
            .filter(|l| l.order_id == order_id && l.status == LeaseStatus::Active)
            .cloned()
            .collect())
    }

    async fn count_active_leases(&mut self, account_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .staged
            .leases
            .values()
            .filter(|l| l.account_id == account_id && l.status == LeaseStatus::Active)
            .count() as i64)
    }

    async fn insert_account(&mut self, account: NewPoolAccount) -> Result<PoolAccount, StoreError> {
        if self.staged.accounts.values().any(|a| a.identity == account.identity) {
            return Err(StoreError::Conflict(format!(
                "Pool account {} already exists",
                account.identity
            )));
        }
        let record = PoolAccount {
            id: account.id,
            identity: account.identity,
            capacity: account.capacity,
            seats_used: 0,
            status: AccountStatus::Available,
            note: account.note,
            created_at: account.created_at,
            updated_at: account.created_at,
        };
        self.staged.accounts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_account(&mut self, account: &PoolAccount) -> Result<(), StoreError> {
        if self
            .staged
            .accounts
            .values()
            .any(|a| a.id != account.id && a.identity == account.identity)
        {
            return Err(StoreError::Conflict(format!(
                "Pool account {} already exists",
                account.identity
            )));
        }
        match self.staged.accounts.get_mut(&account.id) {
            Some(slot) => {
                *slot = account.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("pool account {}", account.id))),
        }
    }

    async fn delete_account(&mut self, id: Uuid) -> Result<(), StoreError> {
        if self.staged.accounts.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("pool account {}", id)));
        }
        self.staged.leases.retain(|_, l| l.account_id != id);
        Ok(())
    }

    async fn insert_lease(&mut self, lease: NewLease) -> Result<Lease, StoreError> {
        if !self.staged.accounts.contains_key(&lease.account_id) {
            return Err(StoreError::NotFound(format!("pool account {}", lease.account_id)));
        }
        if self.staged.has_active_lease_for_order(lease.order_id) {
            return Err(StoreError::Conflict(format!(
                "Order {} already has an active lease",
                lease.order_id
            )));
        }
        let record = Lease {
            id: lease.id,
            order_id: lease.order_id,
            account_id: lease.account_id,
            holder_id: lease.holder_id,
            start_at: lease.start_at,
            end_at: lease.end_at,
            status: LeaseStatus::Active,
            reason: None,
            created_at: lease.start_at,
            updated_at: lease.start_at,
        };
        self.staged.leases.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_lease(&mut self, lease: &Lease) -> Result<(), StoreError> {
        match self.staged.leases.get_mut(&lease.id) {
            Some(slot) => {
                *slot = lease.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("lease {}", lease.id))),
        }
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        if self.staged.orders.values().any(|o| o.order_ref == order.order_ref) {
            return Err(StoreError::Conflict(format!(
                "Order {} already exists",
                order.order_ref
            )));
        }
        let record = Order {
            id: order.id,
            order_ref: order.order_ref,
            reference: None,
            customer_email: order.customer_email,
            full_name: order.full_name,
            package_id: order.package_id,
            amount: order.amount,
            payment_status: PaymentStatus::Pending,
            invitation_status: InvitationStatus::Pending,
            paid_at: None,
            raw_callback: None,
            created_at: order.created_at,
            updated_at: order.created_at,
        };
        self.staged.orders.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        match self.staged.orders.get_mut(&order.id) {
            Some(slot) => {
                *slot = order.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("order {}", order.id))),
        }
    }

    async fn insert_invitation_attempt(
        &mut self,
        attempt: NewInvitationAttempt,
    ) -> Result<InvitationAttempt, StoreError> {
        let record = InvitationAttempt {
            id: attempt.id,
            order_id: attempt.order_id,
            lease_id: attempt.lease_id,
            attempt_number: attempt.attempt_number,
            outcome: attempt.outcome,
            error_message: attempt.error_message,
            attempted_at: attempt.attempted_at,
        };
        self.staged.attempts.push(record.clone());
        Ok(record)
    }

    async fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("audit log unavailable".to_string()));
        }
        let record = AuditEntry {
            id: entry.id,
            actor_type: entry.actor_type,
            actor: entry.actor,
            action: entry.action,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            payload: entry.payload,
            created_at: entry.created_at,
        };
        self.staged.audit.push(record.clone());
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryUnitOfWork {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_account(identity: &str, capacity: Option<i32>, at: DateTime<Utc>) -> NewPoolAccount {
        NewPoolAccount {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            capacity,
            note: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let account = uow
            .insert_account(new_account("a@example.com", None, Utc::now()))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        assert!(store.find_account(account.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let store = InMemoryStore::new();

        let mut uow = store.begin().await.unwrap();
        let rolled_back = uow
            .insert_account(new_account("a@example.com", None, Utc::now()))
            .await
            .unwrap();
        uow.rollback().await.unwrap();

        {
            let mut uow = store.begin().await.unwrap();
            uow.insert_account(new_account("b@example.com", None, Utc::now()))
                .await
                .unwrap();
        }

        assert!(store.find_account(rolled_back.id).await.unwrap().is_none());
        let (accounts, total) = store.list_accounts(None, PageRequest::default()).await.unwrap();
        assert!(accounts.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_duplicate_identity_conflicts() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.insert_account(new_account("a@example.com", None, Utc::now()))
            .await
            .unwrap();
        let err = uow
            .insert_account(new_account("a@example.com", Some(3), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_pick_prefers_oldest_free_account() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut uow = store.begin().await.unwrap();
        let newer = uow
            .insert_account(new_account("newer@example.com", None, now))
            .await
            .unwrap();
        let older = uow
            .insert_account(new_account("older@example.com", None, now - Duration::hours(1)))
            .await
            .unwrap();
        let mut suspended = uow
            .insert_account(new_account("oldest@example.com", None, now - Duration::hours(2)))
            .await
            .unwrap();
        suspended.status = AccountStatus::Suspended;
        uow.update_account(&suspended).await.unwrap();

        let picked = uow.lock_next_available_account().await.unwrap().unwrap();
        assert_eq!(picked.id, older.id);
        assert_ne!(picked.id, newer.id);
    }

    #[tokio::test]
    async fn test_second_active_lease_for_order_conflicts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut uow = store.begin().await.unwrap();
        let account = uow
            .insert_account(new_account("a@example.com", Some(2), now))
            .await
            .unwrap();
        let order_id = Uuid::new_v4();
        let lease = |id| NewLease {
            id,
            order_id,
            account_id: account.id,
            holder_id: "buyer@example.com".to_string(),
            start_at: now,
            end_at: now + Duration::days(30),
        };
        uow.insert_lease(lease(Uuid::new_v4())).await.unwrap();
        let err = uow.insert_lease(lease(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_audit_failure_injection() {
        let store = InMemoryStore::new();
        store.set_audit_failure(true);
        let mut uow = store.begin().await.unwrap();
        let result = uow
            .append_audit(NewAuditEntry {
                id: Uuid::new_v4(),
                actor_type: crate::models::ActorType::System,
                actor: "system".to_string(),
                action: crate::models::AuditAction::AccountCreate,
                entity_type: "account".to_string(),
                entity_id: None,
                payload: serde_json::json!({}),
                created_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_orders_filters_and_pages_newest_first() {
        let store = InMemoryStore::new();
        let start = Utc::now();
        let mut uow = store.begin().await.unwrap();
        let mut refs = Vec::new();
        for i in 0..3 {
            let mut order = uow
                .insert_order(NewOrder {
                    id: Uuid::new_v4(),
                    order_ref: format!("ORD-{}", i),
                    customer_email: "buyer@example.com".to_string(),
                    full_name: None,
                    package_id: "1_month".to_string(),
                    amount: 50_000,
                    created_at: start + Duration::minutes(i),
                })
                .await
                .unwrap();
            if i > 0 {
                order.payment_status = PaymentStatus::Paid;
                order.invitation_status = InvitationStatus::Sent;
                uow.update_order(&order).await.unwrap();
            }
            refs.push(order.order_ref);
        }
        uow.commit().await.unwrap();

        let paid = OrderFilter {
            payment_status: Some(PaymentStatus::Paid),
            ..Default::default()
        };
        let (orders, total) = store
            .list_orders(&paid, PageRequest::new(Some(1), Some(1)))
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(orders[0].order_ref, "ORD-2");

        let (orders, _) = store
            .list_orders(&paid, PageRequest::new(Some(2), Some(1)))
            .await
            .unwrap();
        assert_eq!(orders[0].order_ref, "ORD-1");

        let pending = OrderFilter {
            invitation_status: Some(InvitationStatus::Pending),
            ..Default::default()
        };
        let (orders, total) = store.list_orders(&pending, PageRequest::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(orders[0].order_ref, refs[0]);
    }
}
