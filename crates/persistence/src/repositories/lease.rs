//! Lease queries.

use chrono::{DateTime, Utc};
use domain::models::{Lease, NewLease};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::entities::LeaseEntity;
use crate::metrics::QueryTimer;

/// Filter values bound into the lease listing queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaseQuery<'a> {
    pub status: Option<&'a str>,
    pub holder_id: Option<&'a str>,
    pub account_id: Option<Uuid>,
    pub expiring_before: Option<DateTime<Utc>>,
}

/// Find a lease by id.
pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_lease_by_id");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await;
    timer.record();
    result
}

/// Find a lease by id and lock it.
pub async fn lock_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("lock_lease");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await;
    timer.record();
    result
}

/// List leases newest first.
pub async fn list<'e, E>(
    executor: E,
    query: LeaseQuery<'_>,
    limit: i64,
    offset: i64,
) -> Result<Vec<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_leases");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::text IS NULL OR holder_id = $2)
          AND ($3::uuid IS NULL OR account_id = $3)
          AND ($4::timestamptz IS NULL OR end_at < $4)
        ORDER BY start_at DESC, id DESC
        LIMIT $5 OFFSET $6
        "#,
    )
    .bind(query.status)
    .bind(query.holder_id)
    .bind(query.account_id)
    .bind(query.expiring_before)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}

/// Count leases matching the listing filter.
pub async fn count<'e, E>(executor: E, query: LeaseQuery<'_>) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("count_leases");
    let result = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT COUNT(*)
        FROM leases
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::text IS NULL OR holder_id = $2)
          AND ($3::uuid IS NULL OR account_id = $3)
          AND ($4::timestamptz IS NULL OR end_at < $4)
        "#,
    )
    .bind(query.status)
    .bind(query.holder_id)
    .bind(query.account_id)
    .bind(query.expiring_before)
    .fetch_one(executor)
    .await;
    timer.record();
    result.map(|row| row.0)
}

/// Most recently started active lease of a holder.
pub async fn find_active_for_holder<'e, E>(
    executor: E,
    holder_id: &str,
) -> Result<Option<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_active_lease_for_holder");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE holder_id = $1 AND status = 'ACTIVE'
        ORDER BY start_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(holder_id)
    .fetch_optional(executor)
    .await;
    timer.record();
    result
}

/// Active leases of an order.
pub async fn find_active_for_order<'e, E>(executor: E, order_id: Uuid) -> Result<Vec<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_active_leases_for_order");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE order_id = $1 AND status = 'ACTIVE'
        ORDER BY start_at
        "#,
    )
    .bind(order_id)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}

/// Active leases of an order, locked.
pub async fn lock_active_for_order<'e, E>(executor: E, order_id: Uuid) -> Result<Vec<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("lock_active_leases_for_order");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE order_id = $1 AND status = 'ACTIVE'
        ORDER BY start_at
        FOR UPDATE
        "#,
    )
    .bind(order_id)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}

/// Active leases whose window ended at or before `now`, oldest end first.
pub async fn find_expired<'e, E>(executor: E, now: DateTime<Utc>) -> Result<Vec<LeaseEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_expired_leases");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        SELECT id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        FROM leases
        WHERE status = 'ACTIVE' AND end_at <= $1
        ORDER BY end_at, id
        "#,
    )
    .bind(now)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}

/// Count active leases on an account.
pub async fn count_active_for_account<'e, E>(executor: E, account_id: Uuid) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("count_active_leases_for_account");
    let result = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT COUNT(*)
        FROM leases
        WHERE account_id = $1 AND status = 'ACTIVE'
        "#,
    )
    .bind(account_id)
    .fetch_one(executor)
    .await;
    timer.record();
    result.map(|row| row.0)
}

/// Insert an active lease.
pub async fn insert<'e, E>(executor: E, lease: &NewLease) -> Result<LeaseEntity, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("insert_lease");
    let result = sqlx::query_as::<_, LeaseEntity>(
        r#"
        INSERT INTO leases (id, order_id, account_id, holder_id, start_at, end_at, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, 'ACTIVE', $5, $5)
        RETURNING id, order_id, account_id, holder_id, start_at, end_at, status, reason, created_at, updated_at
        "#,
    )
    .bind(lease.id)
    .bind(lease.order_id)
    .bind(lease.account_id)
    .bind(&lease.holder_id)
    .bind(lease.start_at)
    .bind(lease.end_at)
    .fetch_one(executor)
    .await;
    timer.record();
    result
}

/// Write the mutable columns of a lease. Returns rows affected.
pub async fn update<'e, E>(executor: E, lease: &Lease) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("update_lease");
    let result = sqlx::query(
        r#"
        UPDATE leases
        SET end_at = $2, status = $3, reason = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(lease.id)
    .bind(lease.end_at)
    .bind(lease.status.as_str())
    .bind(&lease.reason)
    .bind(lease.updated_at)
    .execute(executor)
    .await;
    timer.record();
    result.map(|r| r.rows_affected())
}
