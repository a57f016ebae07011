//! Lease allocator.
//!
//! Maps holders onto free seats of the account pool. Every operation runs in
//! one unit of work: the lease row, the account occupancy and the audit
//! entry are committed together or not at all.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::pool_account::UpdatePoolAccountRequest;
use crate::models::{
    occupancy_status, AccountStatus, AssignOutcome, Assignment, AuditAction, AuditActor,
    CleanupReport, Extension, Lease, LeaseStatus, NewLease, NewPoolAccount, Order, PoolAccount,
    Release,
};
use crate::services::audit::audit_helpers;
use crate::store::{AllocationStore, StoreError, UnitOfWork};
use shared::validation::{normalize_identity, validate_capacity};

/// Reason recorded when the sweeper closes an overdue lease.
pub const EXPIRED_REASON: &str = "expired";

/// Default reason for an admin revoke.
pub const ADMIN_REVOKED_REASON: &str = "admin_revoked";

/// Default reason for an admin release.
pub const ADMIN_RELEASED_REASON: &str = "admin_released";

/// Errors raised by allocator operations.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AllocationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AllocationError::NotFound(msg),
            StoreError::Conflict(msg) => AllocationError::Conflict(msg),
            other => AllocationError::Store(other),
        }
    }
}

fn ensure_positive(duration: Duration) -> Result<(), AllocationError> {
    if duration <= Duration::zero() {
        return Err(AllocationError::InvalidDuration(
            "Duration must be positive".to_string(),
        ));
    }
    Ok(())
}

/// `start + duration`, or an error when the result is out of range.
fn end_after(start: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, AllocationError> {
    start.checked_add_signed(duration).ok_or_else(|| {
        AllocationError::InvalidDuration(format!("Duration {} is out of range", duration))
    })
}

/// Commits on success and rolls back on failure.
pub(crate) async fn finish<T>(
    uow: Box<dyn UnitOfWork>,
    result: Result<T, AllocationError>,
) -> Result<T, AllocationError> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// Lease allocator over an [`AllocationStore`].
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn AllocationStore>,
    clock: Arc<dyn Clock>,
}

impl Allocator {
    pub fn new(store: Arc<dyn AllocationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn AllocationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Locks the next account with a free seat inside `uow`.
    pub async fn pick_available_account(
        &self,
        uow: &mut dyn UnitOfWork,
    ) -> Result<Option<PoolAccount>, AllocationError> {
        Ok(uow.lock_next_available_account().await?)
    }

    /// Assigns a seat for `order` to `holder_id` for `duration`.
    ///
    /// Returns [`AssignOutcome::NoCapacity`] without writing anything when
    /// the pool is exhausted.
    pub async fn assign_to_user(
        &self,
        order: &Order,
        holder_id: &str,
        duration: Duration,
        actor: &AuditActor,
    ) -> Result<AssignOutcome, AllocationError> {
        let mut uow = self.store.begin().await?;
        let result = self.assign_in(uow.as_mut(), order, holder_id, duration, actor).await;
        let outcome = finish(uow, result).await?;

        match &outcome {
            AssignOutcome::Assigned(assignment) => info!(
                lease_id = %assignment.lease.id,
                account_id = %assignment.account_id,
                order_ref = %order.order_ref,
                "Seat assigned"
            ),
            AssignOutcome::NoCapacity => warn!(
                order_ref = %order.order_ref,
                "No pool account has a free seat"
            ),
        }
        Ok(outcome)
    }

    /// Assignment steps without commit, for callers composing a larger unit
    /// of work.
    pub async fn assign_in(
        &self,
        uow: &mut dyn UnitOfWork,
        order: &Order,
        holder_id: &str,
        duration: Duration,
        actor: &AuditActor,
    ) -> Result<AssignOutcome, AllocationError> {
        ensure_positive(duration)?;
        let holder_id = normalize_identity(holder_id);
        if holder_id.is_empty() {
            return Err(AllocationError::Validation("Holder is required".to_string()));
        }

        if !uow.active_leases_for_order(order.id).await?.is_empty() {
            return Err(AllocationError::Conflict(format!(
                "Order {} already has an active lease",
                order.order_ref
            )));
        }

        let Some(mut account) = self.pick_available_account(uow).await? else {
            return Ok(AssignOutcome::NoCapacity);
        };

        let now = self.clock.now();
        let end_at = end_after(now, duration)?;
        let lease = uow
            .insert_lease(NewLease {
                id: Uuid::new_v4(),
                order_id: order.id,
                account_id: account.id,
                holder_id,
                start_at: now,
                end_at,
            })
            .await?;

        account.set_seats_used(account.seats_used + 1, now);
        uow.update_account(&account).await?;
        uow.append_audit(audit_helpers::lease_assigned(
            actor,
            &lease,
            &account,
            &order.order_ref,
            now,
        ))
        .await?;

        Ok(AssignOutcome::Assigned(Assignment {
            lease,
            account_id: account.id,
            account_identity: account.identity,
        }))
    }

    /// Ends a lease and frees its seat. Releasing a closed lease is a no-op.
    pub async fn release_assignment(
        &self,
        lease_id: Uuid,
        reason: &str,
        actor: &AuditActor,
    ) -> Result<Release, AllocationError> {
        self.close(lease_id, LeaseStatus::Ended, reason, actor).await
    }

    /// Like release, but marks the lease revoked.
    pub async fn revoke_assignment(
        &self,
        lease_id: Uuid,
        reason: &str,
        actor: &AuditActor,
    ) -> Result<Release, AllocationError> {
        self.close(lease_id, LeaseStatus::Revoked, reason, actor).await
    }

    async fn close(
        &self,
        lease_id: Uuid,
        status: LeaseStatus,
        reason: &str,
        actor: &AuditActor,
    ) -> Result<Release, AllocationError> {
        let mut uow = self.store.begin().await?;
        let result = self
            .close_in(uow.as_mut(), lease_id, status, reason, actor)
            .await;
        let release = finish(uow, result).await?;

        if !release.already_closed {
            info!(
                lease_id = %lease_id,
                account_id = %release.lease.account_id,
                status = %release.lease.status,
                reason = %reason,
                "Lease closed"
            );
        }
        Ok(release)
    }

    /// Release steps without commit.
    pub async fn release_in(
        &self,
        uow: &mut dyn UnitOfWork,
        lease_id: Uuid,
        reason: &str,
        actor: &AuditActor,
    ) -> Result<Release, AllocationError> {
        self.close_in(uow, lease_id, LeaseStatus::Ended, reason, actor).await
    }

    async fn close_in(
        &self,
        uow: &mut dyn UnitOfWork,
        lease_id: Uuid,
        status: LeaseStatus,
        reason: &str,
        actor: &AuditActor,
    ) -> Result<Release, AllocationError> {
        let mut lease = uow
            .lock_lease(lease_id)
            .await?
            .ok_or_else(|| AllocationError::NotFound(format!("Lease {} not found", lease_id)))?;
        let mut account = uow.lock_account(lease.account_id).await?.ok_or_else(|| {
            AllocationError::NotFound(format!("Pool account {} not found", lease.account_id))
        })?;

        if lease.status.is_closed() {
            return Ok(Release {
                lease,
                account_identity: account.identity,
                already_closed: true,
            });
        }

        let now = self.clock.now();
        lease.status = status;
        lease.reason = Some(reason.to_string());
        lease.updated_at = now;
        uow.update_lease(&lease).await?;

        account.set_seats_used(account.seats_used - 1, now);
        uow.update_account(&account).await?;

        let action = match status {
            LeaseStatus::Revoked => AuditAction::LeaseRevoke,
            _ => AuditAction::LeaseRelease,
        };
        uow.append_audit(audit_helpers::lease_closed(
            actor,
            action,
            &lease,
            &account.identity,
            now,
        ))
        .await?;

        Ok(Release {
            lease,
            account_identity: account.identity,
            already_closed: false,
        })
    }

    /// Pushes the end of an active lease out by `additional`.
    pub async fn extend_assignment(
        &self,
        lease_id: Uuid,
        additional: Duration,
        actor: &AuditActor,
    ) -> Result<Extension, AllocationError> {
        ensure_positive(additional)?;

        let mut uow = self.store.begin().await?;
        let result: Result<Extension, AllocationError> = async {
            let mut lease = uow
                .lock_lease(lease_id)
                .await?
                .ok_or_else(|| AllocationError::NotFound(format!("Lease {} not found", lease_id)))?;
            if lease.status.is_closed() {
                return Err(AllocationError::Conflict(format!(
                    "Lease {} is {} and cannot be extended",
                    lease_id, lease.status
                )));
            }

            let now = self.clock.now();
            let previous_end_at = lease.end_at;
            lease.end_at = end_after(previous_end_at, additional)?;
            lease.updated_at = now;
            uow.update_lease(&lease).await?;
            uow.append_audit(audit_helpers::lease_extended(actor, &lease, previous_end_at, now))
                .await?;

            Ok(Extension {
                lease,
                previous_end_at,
            })
        }
        .await;
        let extension = finish(uow, result).await?;

        info!(
            lease_id = %lease_id,
            end_at = %extension.lease.end_at,
            "Lease extended"
        );
        Ok(extension)
    }

    /// Active leases whose window has passed.
    pub async fn get_expired_assignments(&self) -> Result<Vec<Lease>, AllocationError> {
        Ok(self.store.find_expired_leases(self.clock.now()).await?)
    }

    /// Releases every overdue lease. Failures are counted and logged; the
    /// pass keeps going.
    pub async fn cleanup_expired_assignments(&self) -> Result<CleanupReport, AllocationError> {
        let expired = self.get_expired_assignments().await?;
        let actor = AuditActor::system();
        let mut report = CleanupReport {
            found: expired.len(),
            ..Default::default()
        };

        for lease in expired {
            match self.release_assignment(lease.id, EXPIRED_REASON, &actor).await {
                Ok(release) if !release.already_closed => report.released += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(lease_id = %lease.id, error = %e, "Failed to release expired lease");
                }
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                released = report.released,
                failed = report.failed,
                "Expired leases cleaned up"
            );
        }
        Ok(report)
    }

    /// The holder's most recently started active lease.
    pub async fn get_assignment_for_user(&self, holder_id: &str) -> Result<Option<Lease>, AllocationError> {
        Ok(self
            .store
            .find_active_lease_for_holder(&normalize_identity(holder_id))
            .await?)
    }

    /// Registers a new pool account.
    pub async fn create_account(
        &self,
        identity: &str,
        capacity: Option<i32>,
        note: Option<String>,
        actor: &AuditActor,
    ) -> Result<PoolAccount, AllocationError> {
        let identity = normalize_identity(identity);
        if identity.is_empty() {
            return Err(AllocationError::Validation("Identity is required".to_string()));
        }
        if let Some(capacity) = capacity {
            validate_capacity(capacity)
                .map_err(|_| AllocationError::Validation("Capacity must be at least 1".to_string()))?;
        }

        let mut uow = self.store.begin().await?;
        let result: Result<PoolAccount, AllocationError> = async {
            let now = self.clock.now();
            let account = uow
                .insert_account(NewPoolAccount {
                    id: Uuid::new_v4(),
                    identity,
                    capacity,
                    note,
                    created_at: now,
                })
                .await?;
            uow.append_audit(audit_helpers::account_changed(
                actor,
                AuditAction::AccountCreate,
                &account,
                now,
            ))
            .await?;
            Ok(account)
        }
        .await;
        let account = finish(uow, result).await?;

        info!(account_id = %account.id, identity = %account.identity, "Pool account created");
        Ok(account)
    }

    /// Edits identity, capacity or note. Capacity may not drop below the
    /// seats currently in use.
    pub async fn update_account(
        &self,
        id: Uuid,
        changes: UpdatePoolAccountRequest,
        actor: &AuditActor,
    ) -> Result<PoolAccount, AllocationError> {
        let mut uow = self.store.begin().await?;
        let result: Result<PoolAccount, AllocationError> = async {
            let mut account = lock_account_or_not_found(uow.as_mut(), id).await?;
            let now = self.clock.now();

            if let Some(identity) = changes.identity {
                let identity = normalize_identity(&identity);
                if identity.is_empty() {
                    return Err(AllocationError::Validation("Identity is required".to_string()));
                }
                account.identity = identity;
            }
            if let Some(capacity) = changes.capacity {
                validate_capacity(capacity).map_err(|_| {
                    AllocationError::Validation("Capacity must be at least 1".to_string())
                })?;
                if capacity < account.seats_used {
                    return Err(AllocationError::Validation(format!(
                        "Capacity {} is below the {} seats in use",
                        capacity, account.seats_used
                    )));
                }
                account.capacity = Some(capacity);
            }
            if let Some(note) = changes.note {
                account.note = Some(note);
            }

            account.status = occupancy_status(account.status, account.capacity, account.seats_used);
            account.updated_at = now;
            uow.update_account(&account).await?;
            uow.append_audit(audit_helpers::account_changed(
                actor,
                AuditAction::AccountUpdate,
                &account,
                now,
            ))
            .await?;
            Ok(account)
        }
        .await;
        finish(uow, result).await
    }

    /// Takes an account out of rotation. Existing leases are untouched.
    pub async fn suspend_account(&self, id: Uuid, actor: &AuditActor) -> Result<PoolAccount, AllocationError> {
        self.set_suspended(id, true, actor).await
    }

    /// Returns a suspended account to rotation with a status derived from
    /// its occupancy.
    pub async fn enable_account(&self, id: Uuid, actor: &AuditActor) -> Result<PoolAccount, AllocationError> {
        self.set_suspended(id, false, actor).await
    }

    async fn set_suspended(
        &self,
        id: Uuid,
        suspended: bool,
        actor: &AuditActor,
    ) -> Result<PoolAccount, AllocationError> {
        let mut uow = self.store.begin().await?;
        let result: Result<PoolAccount, AllocationError> = async {
            let mut account = lock_account_or_not_found(uow.as_mut(), id).await?;
            let is_suspended = account.status == AccountStatus::Suspended;
            if is_suspended == suspended {
                return Ok(account);
            }

            let now = self.clock.now();
            let action = if suspended {
                account.status = AccountStatus::Suspended;
                AuditAction::AccountSuspend
            } else {
                account.status =
                    occupancy_status(AccountStatus::Available, account.capacity, account.seats_used);
                AuditAction::AccountEnable
            };
            account.updated_at = now;
            uow.update_account(&account).await?;
            uow.append_audit(audit_helpers::account_changed(actor, action, &account, now))
                .await?;
            Ok(account)
        }
        .await;
        let account = finish(uow, result).await?;

        info!(account_id = %id, status = %account.status, "Pool account status changed");
        Ok(account)
    }

    /// Deletes an account that no active lease references.
    pub async fn delete_account(&self, id: Uuid, actor: &AuditActor) -> Result<(), AllocationError> {
        let mut uow = self.store.begin().await?;
        let result: Result<(), AllocationError> = async {
            let account = lock_account_or_not_found(uow.as_mut(), id).await?;
            let active = uow.count_active_leases(id).await?;
            if active > 0 {
                return Err(AllocationError::Conflict(format!(
                    "Pool account {} still has {} active lease(s)",
                    account.identity, active
                )));
            }

            let now = self.clock.now();
            uow.delete_account(id).await?;
            uow.append_audit(audit_helpers::account_changed(
                actor,
                AuditAction::AccountDelete,
                &account,
                now,
            ))
            .await?;
            Ok(())
        }
        .await;
        finish(uow, result).await?;

        info!(account_id = %id, "Pool account deleted");
        Ok(())
    }
}

async fn lock_account_or_not_found(
    uow: &mut dyn UnitOfWork,
    id: Uuid,
) -> Result<PoolAccount, AllocationError> {
    uow.lock_account(id)
        .await?
        .ok_or_else(|| AllocationError::NotFound(format!("Pool account {} not found", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{InvitationStatus, PaymentStatus};
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};

    struct Harness {
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        allocator: Allocator,
    }

    fn harness() -> Harness {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        let allocator = Allocator::new(Arc::new(store.clone()), clock.clone());
        Harness {
            store,
            clock,
            allocator,
        }
    }

    fn order(n: u32) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            order_ref: format!("ORD-{:04}", n),
            reference: None,
            customer_email: format!("buyer{}@example.com", n),
            full_name: None,
            package_id: "1_month".to_string(),
            amount: 50_000,
            payment_status: PaymentStatus::Paid,
            invitation_status: InvitationStatus::Processing,
            paid_at: Some(now),
            raw_callback: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn admin() -> AuditActor {
        AuditActor::admin("ops")
    }

    async fn assigned(h: &Harness, n: u32) -> Assignment {
        let o = order(n);
        match h
            .allocator
            .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
            .await
            .unwrap()
        {
            AssignOutcome::Assigned(a) => a,
            AssignOutcome::NoCapacity => panic!("expected a seat"),
        }
    }

    #[tokio::test]
    async fn test_assign_single_seat_account() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();

        let assignment = assigned(&h, 1).await;
        assert_eq!(assignment.account_id, account.id);
        assert_eq!(assignment.account_identity, "pool-1@example.com");
        assert_eq!(assignment.lease.start_at, h.clock.now());
        assert_eq!(assignment.lease.end_at, h.clock.now() + Duration::days(30));
        assert_eq!(assignment.lease.status, LeaseStatus::Active);

        let account = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.seats_used, 1);
        assert_eq!(account.status, AccountStatus::Assigned);
    }

    #[tokio::test]
    async fn test_assign_multi_seat_until_full() {
        let h = harness();
        let account = h
            .allocator
            .create_account("family@example.com", Some(3), None, &admin())
            .await
            .unwrap();

        for n in 0..2 {
            assigned(&h, n).await;
        }
        let mid = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(mid.seats_used, 2);
        assert_eq!(mid.status, AccountStatus::Available);

        assigned(&h, 2).await;
        let full = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(full.seats_used, 3);
        assert_eq!(full.status, AccountStatus::Assigned);
    }

    #[tokio::test]
    async fn test_assign_with_empty_pool_reports_no_capacity() {
        let h = harness();
        let o = order(1);
        let outcome = h
            .allocator
            .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
            .await
            .unwrap();
        assert_eq!(outcome, AssignOutcome::NoCapacity);
        assert!(h.store.all_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_assign_skips_suspended_account() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", Some(5), None, &admin())
            .await
            .unwrap();
        h.allocator.suspend_account(account.id, &admin()).await.unwrap();

        let o = order(1);
        let outcome = h
            .allocator
            .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
            .await
            .unwrap();
        assert_eq!(outcome, AssignOutcome::NoCapacity);
    }

    #[tokio::test]
    async fn test_assign_rejects_non_positive_duration() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let o = order(1);
        let err = h
            .allocator
            .assign_to_user(&o, &o.customer_email, Duration::zero(), &AuditActor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidDuration(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_end_is_rejected_without_writes() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", Some(2), None, &admin())
            .await
            .unwrap();
        // Roughly 270 000 years: representable as a duration, not as an end date.
        let huge = Duration::days(100_000_000);

        let o = order(1);
        let err = h
            .allocator
            .assign_to_user(&o, &o.customer_email, huge, &AuditActor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidDuration(_)));
        assert!(h.store.all_leases().await.is_empty());

        let assignment = assigned(&h, 2).await;
        let err = h
            .allocator
            .extend_assignment(assignment.lease.id, huge, &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidDuration(_)));

        let stored = h.store.find_lease(assignment.lease.id).await.unwrap().unwrap();
        assert_eq!(stored.end_at, assignment.lease.end_at);
        let account = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.seats_used, 1);
    }

    #[tokio::test]
    async fn test_second_lease_for_same_order_conflicts() {
        let h = harness();
        h.allocator
            .create_account("family@example.com", Some(3), None, &admin())
            .await
            .unwrap();
        let o = order(1);
        h.allocator
            .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
            .await
            .unwrap();
        let err = h
            .allocator
            .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_concurrent_assign_on_single_seat_never_double_books() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let allocator = h.allocator.clone();
            handles.push(tokio::spawn(async move {
                let o = order(n);
                allocator
                    .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
                    .await
            }));
        }

        let mut assigned = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                AssignOutcome::Assigned(_) => assigned += 1,
                AssignOutcome::NoCapacity => exhausted += 1,
            }
        }
        assert_eq!(assigned, 1);
        assert_eq!(exhausted, 7);
        assert_eq!(h.store.all_leases().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_frees_seat_and_is_idempotent() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;

        let release = h
            .allocator
            .release_assignment(assignment.lease.id, "payment_refunded", &AuditActor::system())
            .await
            .unwrap();
        assert!(!release.already_closed);
        assert_eq!(release.lease.status, LeaseStatus::Ended);
        assert_eq!(release.lease.reason.as_deref(), Some("payment_refunded"));

        let account_after = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(account_after.seats_used, 0);
        assert_eq!(account_after.status, AccountStatus::Available);

        let again = h
            .allocator
            .release_assignment(assignment.lease.id, "payment_refunded", &AuditActor::system())
            .await
            .unwrap();
        assert!(again.already_closed);
        let account_again = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(account_again.seats_used, 0);

        let releases = h
            .store
            .audit_entries()
            .await
            .into_iter()
            .filter(|e| e.action == AuditAction::LeaseRelease)
            .count();
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn test_release_of_unknown_lease_is_not_found() {
        let h = harness();
        let err = h
            .allocator
            .release_assignment(Uuid::new_v4(), "x", &AuditActor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_keeps_suspension() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;
        h.allocator.suspend_account(account.id, &admin()).await.unwrap();

        h.allocator
            .release_assignment(assignment.lease.id, "admin_released", &admin())
            .await
            .unwrap();
        let after = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(after.seats_used, 0);
        assert_eq!(after.status, AccountStatus::Suspended);
    }

    #[tokio::test]
    async fn test_revoke_marks_lease_revoked() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;

        let release = h
            .allocator
            .revoke_assignment(assignment.lease.id, ADMIN_REVOKED_REASON, &admin())
            .await
            .unwrap();
        assert_eq!(release.lease.status, LeaseStatus::Revoked);
        let entries = h.store.audit_entries().await;
        assert!(entries.iter().any(|e| e.action == AuditAction::LeaseRevoke));
    }

    #[tokio::test]
    async fn test_extend_is_exact() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;
        let original_end = assignment.lease.end_at;

        let extension = h
            .allocator
            .extend_assignment(assignment.lease.id, Duration::days(7), &admin())
            .await
            .unwrap();
        assert_eq!(extension.previous_end_at, original_end);
        assert_eq!(extension.lease.end_at, original_end + Duration::days(7));

        let stored = h.store.find_lease(assignment.lease.id).await.unwrap().unwrap();
        assert_eq!(stored.end_at, original_end + Duration::days(7));
    }

    #[tokio::test]
    async fn test_extend_rejects_non_positive_and_leaves_lease_untouched() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;

        for days in [0, -3] {
            let err = h
                .allocator
                .extend_assignment(assignment.lease.id, Duration::days(days), &admin())
                .await
                .unwrap_err();
            assert!(matches!(err, AllocationError::InvalidDuration(_)));
        }
        let stored = h.store.find_lease(assignment.lease.id).await.unwrap().unwrap();
        assert_eq!(stored.end_at, assignment.lease.end_at);
    }

    #[tokio::test]
    async fn test_extend_closed_lease_conflicts() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;
        h.allocator
            .release_assignment(assignment.lease.id, "done", &admin())
            .await
            .unwrap();
        let err = h
            .allocator
            .extend_assignment(assignment.lease.id, Duration::days(7), &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cleanup_releases_only_overdue_leases() {
        let h = harness();
        let account = h
            .allocator
            .create_account("family@example.com", Some(3), None, &admin())
            .await
            .unwrap();

        let short = {
            let o = order(1);
            h.allocator
                .assign_to_user(&o, &o.customer_email, Duration::days(1), &AuditActor::system())
                .await
                .unwrap()
        };
        let long = assigned(&h, 2).await;

        h.clock.advance(Duration::days(1));
        let expired = h.allocator.get_expired_assignments().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, short.assignment().unwrap().lease.id);

        let report = h.allocator.cleanup_expired_assignments().await.unwrap();
        assert_eq!(report, CleanupReport { found: 1, released: 1, failed: 0 });

        let lease = h.store.find_lease(expired[0].id).await.unwrap().unwrap();
        assert_eq!(lease.status, LeaseStatus::Ended);
        assert_eq!(lease.reason.as_deref(), Some(EXPIRED_REASON));
        let still_active = h.store.find_lease(long.lease.id).await.unwrap().unwrap();
        assert!(still_active.is_active());

        let account = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.seats_used, 1);

        let second = h.allocator.cleanup_expired_assignments().await.unwrap();
        assert_eq!(second.found, 0);
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_inclusive() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        assigned(&h, 1).await;
        h.clock.advance(Duration::days(30) - Duration::seconds(1));
        assert!(h.allocator.get_expired_assignments().await.unwrap().is_empty());
        h.clock.advance(Duration::seconds(1));
        assert_eq!(h.allocator.get_expired_assignments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_assignment_for_user_returns_latest_active() {
        let h = harness();
        h.allocator
            .create_account("family@example.com", Some(5), None, &admin())
            .await
            .unwrap();

        let first = order(1);
        let mut second = order(2);
        second.customer_email = first.customer_email.clone();

        h.allocator
            .assign_to_user(&first, &first.customer_email, Duration::days(30), &AuditActor::system())
            .await
            .unwrap();
        h.clock.advance(Duration::hours(1));
        let latest = h
            .allocator
            .assign_to_user(&second, "  BUYER1@example.com ", Duration::days(30), &AuditActor::system())
            .await
            .unwrap();

        let found = h
            .allocator
            .get_assignment_for_user("buyer1@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, latest.assignment().unwrap().lease.id);
        assert!(h
            .allocator
            .get_assignment_for_user("nobody@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_audit_append_leaves_no_partial_state() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();

        h.store.set_audit_failure(true);
        let o = order(1);
        let result = h
            .allocator
            .assign_to_user(&o, &o.customer_email, Duration::days(30), &AuditActor::system())
            .await;
        assert!(matches!(result, Err(AllocationError::Store(_))));
        h.store.set_audit_failure(false);

        assert!(h.store.all_leases().await.is_empty());
        let account = h.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.seats_used, 0);
        assert_eq!(account.status, AccountStatus::Available);
    }

    #[tokio::test]
    async fn test_create_account_rejects_duplicates_and_bad_capacity() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();

        let dup = h
            .allocator
            .create_account("Pool-1@Example.com", None, None, &admin())
            .await
            .unwrap_err();
        assert!(matches!(dup, AllocationError::Conflict(_)));

        let bad = h
            .allocator
            .create_account("pool-2@example.com", Some(0), None, &admin())
            .await
            .unwrap_err();
        assert!(matches!(bad, AllocationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_capacity_recomputes_status() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        assigned(&h, 1).await;

        let updated = h
            .allocator
            .update_account(
                account.id,
                UpdatePoolAccountRequest {
                    capacity: Some(2),
                    note: Some("upgraded to family plan".to_string()),
                    ..Default::default()
                },
                &admin(),
            )
            .await
            .unwrap();
        assert_eq!(updated.capacity, Some(2));
        assert_eq!(updated.status, AccountStatus::Available);
        assert_eq!(updated.note.as_deref(), Some("upgraded to family plan"));
    }

    #[tokio::test]
    async fn test_update_capacity_below_seats_used_is_rejected() {
        let h = harness();
        let account = h
            .allocator
            .create_account("family@example.com", Some(3), None, &admin())
            .await
            .unwrap();
        assigned(&h, 1).await;
        assigned(&h, 2).await;

        let err = h
            .allocator
            .update_account(
                account.id,
                UpdatePoolAccountRequest {
                    capacity: Some(1),
                    ..Default::default()
                },
                &admin(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_enable_recomputes_from_occupancy() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        assigned(&h, 1).await;

        let suspended = h.allocator.suspend_account(account.id, &admin()).await.unwrap();
        assert_eq!(suspended.status, AccountStatus::Suspended);

        let enabled = h.allocator.enable_account(account.id, &admin()).await.unwrap();
        assert_eq!(enabled.status, AccountStatus::Assigned);
    }

    #[tokio::test]
    async fn test_delete_account_with_active_lease_conflicts() {
        let h = harness();
        let account = h
            .allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;

        let err = h.allocator.delete_account(account.id, &admin()).await.unwrap_err();
        assert!(matches!(err, AllocationError::Conflict(_)));

        h.allocator
            .release_assignment(assignment.lease.id, "done", &admin())
            .await
            .unwrap();
        h.allocator.delete_account(account.id, &admin()).await.unwrap();
        assert!(h.store.find_account(account.id).await.unwrap().is_none());
        assert!(h.store.find_lease(assignment.lease.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_every_mutation_is_audited() {
        let h = harness();
        h.allocator
            .create_account("pool-1@example.com", None, None, &admin())
            .await
            .unwrap();
        let assignment = assigned(&h, 1).await;
        h.allocator
            .extend_assignment(assignment.lease.id, Duration::days(7), &admin())
            .await
            .unwrap();
        h.allocator
            .release_assignment(assignment.lease.id, "done", &admin())
            .await
            .unwrap();

        let actions: Vec<AuditAction> = h.store.audit_entries().await.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::AccountCreate,
                AuditAction::LeaseAssign,
                AuditAction::LeaseExtend,
                AuditAction::LeaseRelease,
            ]
        );
        let entries = h.store.audit_entries().await;
        assert_eq!(entries[1].entity_id, Some(assignment.lease.id.to_string()));
        assert_eq!(entries[3].payload["account_identity"], "pool-1@example.com");
    }
}
