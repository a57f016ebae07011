//! Invitation attempt queries.

use domain::models::NewInvitationAttempt;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::entities::InvitationAttemptEntity;
use crate::metrics::QueryTimer;

/// Record one invite call.
pub async fn insert<'e, E>(
    executor: E,
    attempt: &NewInvitationAttempt,
) -> Result<InvitationAttemptEntity, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("insert_invitation_attempt");
    let result = sqlx::query_as::<_, InvitationAttemptEntity>(
        r#"
        INSERT INTO invitation_attempts (id, order_id, lease_id, attempt_number, outcome, error_message, attempted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, order_id, lease_id, attempt_number, outcome, error_message, attempted_at
        "#,
    )
    .bind(attempt.id)
    .bind(attempt.order_id)
    .bind(attempt.lease_id)
    .bind(attempt.attempt_number)
    .bind(attempt.outcome.as_str())
    .bind(&attempt.error_message)
    .bind(attempt.attempted_at)
    .fetch_one(executor)
    .await;
    timer.record();
    result
}

/// Attempts for an order in the order they were made.
pub async fn list_for_order<'e, E>(
    executor: E,
    order_id: Uuid,
) -> Result<Vec<InvitationAttemptEntity>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let timer = QueryTimer::new("list_invitation_attempts");
    let result = sqlx::query_as::<_, InvitationAttemptEntity>(
        r#"
        SELECT id, order_id, lease_id, attempt_number, outcome, error_message, attempted_at
        FROM invitation_attempts
        WHERE order_id = $1
        ORDER BY attempted_at, attempt_number
        "#,
    )
    .bind(order_id)
    .fetch_all(executor)
    .await;
    timer.record();
    result
}
