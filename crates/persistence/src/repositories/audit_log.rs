//! Audit log queries.

use domain::models::NewAuditEntry;
use sqlx::PgExecutor;

use crate::entities::AuditLogEntity;
use crate::metrics::QueryTimer;

/// Filter values bound into the audit listing queries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_type: Option<String>,
}

/// Append an entry.
pub async fn insert<'e, E>(executor: E, entry: &NewAuditEntry) -> Result<AuditLogEntity, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("insert_audit_log");
    let result = sqlx::query_as::<_, AuditLogEntity>(
        r#"
        INSERT INTO audit_log (id, actor_type, actor, action, entity_type, entity_id, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, actor_type, actor, action, entity_type, entity_id, payload, created_at
        "#,
    )
    .bind(entry.id)
    .bind(entry.actor_type.to_string())
    .bind(&entry.actor)
    .bind(entry.action.to_string())
    .bind(&entry.entity_type)
    .bind(&entry.entity_id)
    .bind(&entry.payload)
    .bind(entry.created_at)
    .fetch_one(executor)
    .await;
    timer.record();
    result
}

/// List entries newest first.
pub async fn list<'e, E>(
    executor: E,
    query: &AuditQuery,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditLogEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_audit_log");
    let result = sqlx::query_as::<_, AuditLogEntity>(
        r#"
        SELECT id, actor_type, actor, action, entity_type, entity_id, payload, created_at
        FROM audit_log
        WHERE ($1::text IS NULL OR action = $1)
          AND ($2::text IS NULL OR entity_type = $2)
          AND ($3::text IS NULL OR entity_id = $3)
          AND ($4::text IS NULL OR actor_type = $4)
        ORDER BY created_at DESC, id DESC
        LIMIT $5 OFFSET $6
        "#,
    )
    .bind(&query.action)
    .bind(&query.entity_type)
    .bind(&query.entity_id)
    .bind(&query.actor_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}

/// Count entries matching the listing filter.
pub async fn count<'e, E>(executor: E, query: &AuditQuery) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("count_audit_log");
    let result = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT COUNT(*)
        FROM audit_log
        WHERE ($1::text IS NULL OR action = $1)
          AND ($2::text IS NULL OR entity_type = $2)
          AND ($3::text IS NULL OR entity_id = $3)
          AND ($4::text IS NULL OR actor_type = $4)
        "#,
    )
    .bind(&query.action)
    .bind(&query.entity_type)
    .bind(&query.entity_id)
    .bind(&query.actor_type)
    .fetch_one(executor)
    .await;
    timer.record();
    result.map(|row| row.0)
}
