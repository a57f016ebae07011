//! Order queries.

use chrono::{DateTime, Utc};
use domain::models::{NewOrder, Order};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::entities::OrderEntity;
use crate::metrics::QueryTimer;

const SELECT_ORDER: &str = r#"
    SELECT id, order_ref, reference, customer_email, full_name, package_id, amount,
           payment_status, invitation_status, paid_at, raw_callback, created_at, updated_at
    FROM orders
"#;

/// Find an order by id.
pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_order_by_id");
    let sql = format!("{} WHERE id = $1", SELECT_ORDER);
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await;
    timer.record();
    result
}

/// Find an order by id and lock it.
pub async fn lock_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("lock_order");
    let sql = format!("{} WHERE id = $1 FOR UPDATE", SELECT_ORDER);
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await;
    timer.record();
    result
}

/// Find an order by merchant reference.
pub async fn find_by_ref<'e, E>(executor: E, order_ref: &str) -> Result<Option<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_order_by_ref");
    let sql = format!("{} WHERE order_ref = $1", SELECT_ORDER);
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(order_ref)
        .fetch_optional(executor)
        .await;
    timer.record();
    result
}

/// Find an order by the payment provider's transaction reference.
pub async fn find_by_reference<'e, E>(
    executor: E,
    reference: &str,
) -> Result<Option<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_order_by_reference");
    let sql = format!("{} WHERE reference = $1 ORDER BY created_at DESC LIMIT 1", SELECT_ORDER);
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(reference)
        .fetch_optional(executor)
        .await;
    timer.record();
    result
}

/// Filter values bound into the order listing queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderQuery<'a> {
    pub payment_status: Option<&'a str>,
    pub invitation_status: Option<&'a str>,
}

/// Orders matching the listing filter, newest first.
pub async fn list<'e, E>(
    executor: E,
    query: OrderQuery<'_>,
    limit: i64,
    offset: i64,
) -> Result<Vec<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_orders");
    let sql = format!(
        r#"{}
        WHERE ($1::text IS NULL OR payment_status = $1)
          AND ($2::text IS NULL OR invitation_status = $2)
        ORDER BY created_at DESC, id DESC
        LIMIT $3 OFFSET $4"#,
        SELECT_ORDER
    );
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(query.payment_status)
        .bind(query.invitation_status)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await;
    timer.record();
    result
}

/// Count orders matching the listing filter.
pub async fn count<'e, E>(executor: E, query: OrderQuery<'_>) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("count_orders");
    let result = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT COUNT(*)
        FROM orders
        WHERE ($1::text IS NULL OR payment_status = $1)
          AND ($2::text IS NULL OR invitation_status = $2)
        "#,
    )
    .bind(query.payment_status)
    .bind(query.invitation_status)
    .fetch_one(executor)
    .await;
    timer.record();
    result.map(|row| row.0)
}

/// Orders with the given invitation status, oldest first.
pub async fn list_by_invitation_status<'e, E>(
    executor: E,
    status: &str,
    limit: i64,
) -> Result<Vec<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_orders_by_invitation_status");
    let sql = format!(
        "{} WHERE invitation_status = $1 ORDER BY created_at, id LIMIT $2",
        SELECT_ORDER
    );
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(status)
        .bind(limit)
        .fetch_all(executor)
        .await;
    timer.record();
    result
}

/// Orders still pending payment created before `cutoff`.
pub async fn find_stale_pending<'e, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<Vec<OrderEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("find_stale_pending_orders");
    let sql = format!(
        "{} WHERE payment_status = 'pending' AND created_at < $1 ORDER BY created_at, id",
        SELECT_ORDER
    );
    let result = sqlx::query_as::<_, OrderEntity>(&sql)
        .bind(cutoff)
        .fetch_all(executor)
        .await;
    timer.record();
    result
}

/// Insert a pending order.
pub async fn insert<'e, E>(executor: E, order: &NewOrder) -> Result<OrderEntity, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("insert_order");
    let result = sqlx::query_as::<_, OrderEntity>(
        r#"
        INSERT INTO orders (id, order_ref, customer_email, full_name, package_id, amount,
                            payment_status, invitation_status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', 'pending', $7, $7)
        RETURNING id, order_ref, reference, customer_email, full_name, package_id, amount,
                  payment_status, invitation_status, paid_at, raw_callback, created_at, updated_at
        "#,
    )
    .bind(order.id)
    .bind(&order.order_ref)
    .bind(&order.customer_email)
    .bind(&order.full_name)
    .bind(&order.package_id)
    .bind(order.amount)
    .bind(order.created_at)
    .fetch_one(executor)
    .await;
    timer.record();
    result
}

/// Write the mutable columns of an order. Returns rows affected.
pub async fn update<'e, E>(executor: E, order: &Order) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("update_order");
    let result = sqlx::query(
        r#"
        UPDATE orders
        SET reference = $2, payment_status = $3, invitation_status = $4,
            paid_at = $5, raw_callback = $6, updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(order.id)
    .bind(&order.reference)
    .bind(order.payment_status.as_str())
    .bind(order.invitation_status.as_str())
    .bind(order.paid_at)
    .bind(&order.raw_callback)
    .bind(order.updated_at)
    .execute(executor)
    .await;
    timer.record();
    result.map(|r| r.rows_affected())
}
