//! Pool account queries.

use domain::models::{NewPoolAccount, PoolAccount};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::entities::PoolAccountEntity;
use crate::metrics::QueryTimer;

/// Find an account by id.
pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<PoolAccountEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_pool_account_by_id");
    let result = sqlx::query_as::<_, PoolAccountEntity>(
        r#"
        SELECT id, identity, capacity, seats_used, status, note, created_at, updated_at
        FROM pool_accounts
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await;
    timer.record();
    result
}

/// Find an account by id and lock the row for the rest of the transaction.
pub async fn lock_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<PoolAccountEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("lock_pool_account");
    let result = sqlx::query_as::<_, PoolAccountEntity>(
        r#"
        SELECT id, identity, capacity, seats_used, status, note, created_at, updated_at
        FROM pool_accounts
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

/// Lock the oldest account with a free seat that no other transaction holds.
///
/// Rows locked by concurrent transactions are skipped, so parallel
/// allocations pick different accounts instead of queueing on one. A `None`
/// here does not mean the pool is full; see [`available_ids`].
pub async fn lock_next_available<'e, E>(executor: E) -> Result<Option<PoolAccountEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("lock_next_available_pool_account");
    let result = sqlx::query_as::<_, PoolAccountEntity>(
        r#"
        SELECT id, identity, capacity, seats_used, status, note, created_at, updated_at
        FROM pool_accounts
        WHERE status = 'AVAILABLE'
          AND seats_used < COALESCE(capacity, 1)
        ORDER BY created_at, id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(executor)
    .await;
    timer.record();
    result
}

/// Ids of accounts that had a free seat at statement time, oldest first.
///
/// Takes no locks. Callers lock each candidate with [`lock_by_id`] and
/// re-check it, waiting on rows that concurrent transactions hold.
pub async fn available_ids<'e, E>(executor: E, limit: i64) -> Result<Vec<Uuid>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_available_pool_account_ids");
    let result = sqlx::query_as::<_, (Uuid,)>(
        r#"
        SELECT id
        FROM pool_accounts
        WHERE status = 'AVAILABLE'
          AND seats_used < COALESCE(capacity, 1)
        ORDER BY created_at, id
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(executor)
    .await;
    timer.record();
    result.map(|rows| rows.into_iter().map(|row| row.0).collect())
}

/// List accounts oldest first, optionally filtered by status.
pub async fn list<'e, E>(
    executor: E,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<PoolAccountEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_pool_accounts");
    let result = sqlx::query_as::<_, PoolAccountEntity>(
        r#"
        SELECT id, identity, capacity, seats_used, status, note, created_at, updated_at
        FROM pool_accounts
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY created_at, id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}

/// Count accounts, optionally filtered by status.
pub async fn count<'e, E>(executor: E, status: Option<&str>) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("count_pool_accounts");
    let result = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT COUNT(*)
        FROM pool_accounts
        WHERE ($1::text IS NULL OR status = $1)
        "#,
    )
    .bind(status)
    .fetch_one(executor)
    .await;
    timer.record();
    result.map(|row| row.0)
}

/// Insert a new account with no seats in use.
pub async fn insert<'e, E>(executor: E, account: &NewPoolAccount) -> Result<PoolAccountEntity, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("insert_pool_account");
    let result = sqlx::query_as::<_, PoolAccountEntity>(
        r#"
        INSERT INTO pool_accounts (id, identity, capacity, seats_used, status, note, created_at, updated_at)
        VALUES ($1, $2, $3, 0, 'AVAILABLE', $4, $5, $5)
        RETURNING id, identity, capacity, seats_used, status, note, created_at, updated_at
        "#,
    )
    .bind(account.id)
    .bind(&account.identity)
    .bind(account.capacity)
    .bind(&account.note)
    .bind(account.created_at)
    .fetch_one(executor)
    .await;
    timer.record();
    result
}

/// Write the mutable columns of an account. Returns rows affected.
pub async fn update<'e, E>(executor: E, account: &PoolAccount) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("update_pool_account");
    let result = sqlx::query(
        r#"
        UPDATE pool_accounts
        SET identity = $2, capacity = $3, seats_used = $4, status = $5, note = $6, updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(account.id)
    .bind(&account.identity)
    .bind(account.capacity)
    .bind(account.seats_used)
    .bind(account.status.as_str())
    .bind(&account.note)
    .bind(account.updated_at)
    .execute(executor)
    .await;
    timer.record();
    result.map(|r| r.rows_affected())
}

/// Delete an account. Its leases go with it through the foreign key.
pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("delete_pool_account");
    let result = sqlx::query("DELETE FROM pool_accounts WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await;
    timer.record();
    result.map(|r| r.rows_affected())
}
