//! PostgreSQL implementation of the allocation store.
//!
//! A unit of work is one database transaction. Row locks are taken with
//! `SELECT ... FOR UPDATE`. The free-seat pick tries `SKIP LOCKED` first and
//! falls back to waiting on locked candidates before reporting no capacity.
//! Callers lock a lease before its account, which keeps lock order
//! consistent across flows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::models::{
    AccountStatus, AuditEntry, AuditFilter, InvitationAttempt, InvitationStatus, Lease, LeaseFilter,
    NewAuditEntry, NewInvitationAttempt, NewLease, NewOrder, NewPoolAccount, Order, OrderFilter,
    PoolAccount,
};
use domain::store::{AllocationStore, StoreError, UnitOfWork};
use shared::pagination::PageRequest;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::metrics::record_pool_metrics;
use crate::repositories::audit_log::AuditQuery;
use crate::repositories::lease::LeaseQuery;
use crate::repositories::order::OrderQuery;
use crate::repositories::{audit_log, invitation_attempt, lease, order, pool_account};

/// Maps a sqlx error onto the store taxonomy.
///
/// Unique violations become conflicts and foreign key violations become
/// not-found, so callers can tell "somebody else got there first" apart
/// from infrastructure failures.
pub fn map_db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StoreError::Conflict(
                db.constraint()
                    .map(|c| format!("duplicate value violates {}", c))
                    .unwrap_or_else(|| db.message().to_string()),
            ),
            Some("23503") => StoreError::NotFound(db.message().to_string()),
            Some("23514") => StoreError::Conflict(db.message().to_string()),
            _ => StoreError::Database(err.to_string()),
        },
        _ => StoreError::Database(err.to_string()),
    }
}

fn convert<E, T>(entity: E) -> Result<T, StoreError>
where
    T: TryFrom<E, Error = StoreError>,
{
    T::try_from(entity)
}

fn convert_all<E, T>(entities: Vec<E>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<E, Error = StoreError>,
{
    entities.into_iter().map(T::try_from).collect()
}

fn convert_opt<E, T>(entity: Option<E>) -> Result<Option<T>, StoreError>
where
    T: TryFrom<E, Error = StoreError>,
{
    entity.map(T::try_from).transpose()
}

fn expect_one(rows: u64, what: &str, id: Uuid) -> Result<(), StoreError> {
    if rows == 0 {
        return Err(StoreError::NotFound(format!("{} {} not found", what, id)));
    }
    Ok(())
}

fn lease_query(filter: &LeaseFilter) -> LeaseQuery<'_> {
    LeaseQuery {
        status: filter.status.map(|s| s.as_str()),
        holder_id: filter.holder_id.as_deref(),
        account_id: filter.account_id,
        expiring_before: filter.expiring_before,
    }
}

fn order_query(filter: &OrderFilter) -> OrderQuery<'static> {
    OrderQuery {
        payment_status: filter.payment_status.map(|s| s.as_str()),
        invitation_status: filter.invitation_status.map(|s| s.as_str()),
    }
}

fn audit_query(filter: &AuditFilter) -> AuditQuery {
    AuditQuery {
        action: filter.action.map(|a| a.to_string()),
        entity_type: filter.entity_type.clone(),
        entity_id: filter.entity_id.clone(),
        actor_type: filter.actor_type.map(|t| t.to_string()),
    }
}

/// Allocation store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgAllocationStore {
    pool: PgPool,
}

impl PgAllocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AllocationStore for PgAllocationStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        record_pool_metrics(&self.pool);
        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<PoolAccount>, StoreError> {
        convert_opt(pool_account::find_by_id(&self.pool, id).await.map_err(map_db_error)?)
    }

    async fn list_accounts(
        &self,
        status: Option<AccountStatus>,
        page: PageRequest,
    ) -> Result<(Vec<PoolAccount>, i64), StoreError> {
        let status = status.map(|s| s.as_str());
        let rows = pool_account::list(&self.pool, status, page.limit(), page.offset())
            .await
            .map_err(map_db_error)?;
        let total = pool_account::count(&self.pool, status)
            .await
            .map_err(map_db_error)?;
        Ok((convert_all(rows)?, total))
    }

    async fn find_lease(&self, id: Uuid) -> Result<Option<Lease>, StoreError> {
        convert_opt(lease::find_by_id(&self.pool, id).await.map_err(map_db_error)?)
    }

    async fn list_leases(
        &self,
        filter: &LeaseFilter,
        page: PageRequest,
    ) -> Result<(Vec<Lease>, i64), StoreError> {
        let query = lease_query(filter);
        let rows = lease::list(&self.pool, query, page.limit(), page.offset())
            .await
            .map_err(map_db_error)?;
        let total = lease::count(&self.pool, query).await.map_err(map_db_error)?;
        Ok((convert_all(rows)?, total))
    }

    async fn find_active_lease_for_holder(&self, holder_id: &str) -> Result<Option<Lease>, StoreError> {
        convert_opt(
            lease::find_active_for_holder(&self.pool, holder_id)
                .await
                .map_err(map_db_error)?,
        )
    }

    async fn find_active_leases_for_order(&self, order_id: Uuid) -> Result<Vec<Lease>, StoreError> {
        convert_all(
            lease::find_active_for_order(&self.pool, order_id)
                .await
                .map_err(map_db_error)?,
        )
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError> {
        convert_all(lease::find_expired(&self.pool, now).await.map_err(map_db_error)?)
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        convert_opt(order::find_by_id(&self.pool, id).await.map_err(map_db_error)?)
    }

    async fn find_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>, StoreError> {
        convert_opt(order::find_by_ref(&self.pool, order_ref).await.map_err(map_db_error)?)
    }

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>, StoreError> {
        convert_opt(
            order::find_by_reference(&self.pool, reference)
                .await
                .map_err(map_db_error)?,
        )
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
        page: PageRequest,
    ) -> Result<(Vec<Order>, i64), StoreError> {
        let query = order_query(filter);
        let rows = order::list(&self.pool, query, page.limit(), page.offset())
            .await
            .map_err(map_db_error)?;
        let total = order::count(&self.pool, query).await.map_err(map_db_error)?;
        Ok((convert_all(rows)?, total))
    }

    async fn list_orders_by_invitation_status(
        &self,
        status: InvitationStatus,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        convert_all(
            order::list_by_invitation_status(&self.pool, status.as_str(), limit)
                .await
                .map_err(map_db_error)?,
        )
    }

    async fn find_stale_pending_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        convert_all(
            order::find_stale_pending(&self.pool, cutoff)
                .await
                .map_err(map_db_error)?,
        )
    }

    async fn list_audit_entries(
        &self,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<(Vec<AuditEntry>, i64), StoreError> {
        let query = audit_query(filter);
        let rows = audit_log::list(&self.pool, &query, page.limit(), page.offset())
            .await
            .map_err(map_db_error)?;
        let total = audit_log::count(&self.pool, &query)
            .await
            .map_err(map_db_error)?;
        Ok((convert_all(rows)?, total))
    }

    async fn list_invitation_attempts(&self, order_id: Uuid) -> Result<Vec<InvitationAttempt>, StoreError> {
        convert_all(
            invitation_attempt::list_for_order(&self.pool, order_id)
                .await
                .map_err(map_db_error)?,
        )
    }
}

/// One open transaction. Dropping it without commit rolls back.
/// Upper bound on accounts waited on before the pick reports no capacity.
const BLOCKING_PICK_CANDIDATES: i64 = 16;

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_next_available_account(&mut self) -> Result<Option<PoolAccount>, StoreError> {
        if let Some(entity) = pool_account::lock_next_available(&mut *self.tx)
            .await
            .map_err(map_db_error)?
        {
            return convert(entity).map(Some);
        }

        // Every free row is held by another transaction. Wait on each in turn
        // and re-check it once the holder commits.
        let candidates = pool_account::available_ids(&mut *self.tx, BLOCKING_PICK_CANDIDATES)
            .await
            .map_err(map_db_error)?;
        for id in candidates {
            let locked: Option<PoolAccount> =
                convert_opt(pool_account::lock_by_id(&mut *self.tx, id).await.map_err(map_db_error)?)?;
            if let Some(account) = locked.filter(PoolAccount::has_free_seat) {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    async fn lock_account(&mut self, id: Uuid) -> Result<Option<PoolAccount>, StoreError> {
        convert_opt(pool_account::lock_by_id(&mut *self.tx, id).await.map_err(map_db_error)?)
    }

    async fn lock_lease(&mut self, id: Uuid) -> Result<Option<Lease>, StoreError> {
        convert_opt(lease::lock_by_id(&mut *self.tx, id).await.map_err(map_db_error)?)
    }

    async fn lock_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        convert_opt(order::lock_by_id(&mut *self.tx, id).await.map_err(map_db_error)?)
    }

    async fn active_leases_for_order(&mut self, order_id: Uuid) -> Result<Vec<Lease>, StoreError> {
        convert_all(
            lease::lock_active_for_order(&mut *self.tx, order_id)
                .await
                .map_err(map_db_error)?,
        )
    }

    async fn count_active_leases(&mut self, account_id: Uuid) -> Result<i64, StoreError> {
        lease::count_active_for_account(&mut *self.tx, account_id)
            .await
            .map_err(map_db_error)
    }

    async fn insert_account(&mut self, account: NewPoolAccount) -> Result<PoolAccount, StoreError> {
        let entity = pool_account::insert(&mut *self.tx, &account)
            .await
            .map_err(|e| match map_db_error(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!(
                    "Pool account {} already exists",
                    account.identity
                )),
                other => other,
            })?;
        convert(entity)
    }

    async fn update_account(&mut self, account: &PoolAccount) -> Result<(), StoreError> {
        let rows = pool_account::update(&mut *self.tx, account)
            .await
            .map_err(map_db_error)?;
        expect_one(rows, "Pool account", account.id)
    }

    async fn delete_account(&mut self, id: Uuid) -> Result<(), StoreError> {
        let rows = pool_account::delete(&mut *self.tx, id)
            .await
            .map_err(map_db_error)?;
        expect_one(rows, "Pool account", id)
    }

    async fn insert_lease(&mut self, new_lease: NewLease) -> Result<Lease, StoreError> {
        let entity = lease::insert(&mut *self.tx, &new_lease)
            .await
            .map_err(|e| match map_db_error(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!(
                    "Order {} already has an active lease",
                    new_lease.order_id
                )),
                other => other,
            })?;
        convert(entity)
    }

    async fn update_lease(&mut self, lease: &Lease) -> Result<(), StoreError> {
        let rows = lease::update(&mut *self.tx, lease).await.map_err(map_db_error)?;
        expect_one(rows, "Lease", lease.id)
    }

    async fn insert_order(&mut self, new_order: NewOrder) -> Result<Order, StoreError> {
        let entity = order::insert(&mut *self.tx, &new_order)
            .await
            .map_err(map_db_error)?;
        convert(entity)
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let rows = order::update(&mut *self.tx, order).await.map_err(map_db_error)?;
        expect_one(rows, "Order", order.id)
    }

    async fn insert_invitation_attempt(
        &mut self,
        attempt: NewInvitationAttempt,
    ) -> Result<InvitationAttempt, StoreError> {
        let entity = invitation_attempt::insert(&mut *self.tx, &attempt)
            .await
            .map_err(map_db_error)?;
        convert(entity)
    }

    async fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let entity = audit_log::insert(&mut *self.tx, &entry)
            .await
            .map_err(map_db_error)?;
        convert(entity)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "Transaction rollback failed");
            return Err(map_db_error(e));
        }
        Ok(())
    }
}
