//! Invitation pipeline.
//!
//! After a seat is assigned the holder still has to be invited into the
//! third-party account. That call is slow and flaky, so it runs in the
//! background with bounded retries and every attempt is recorded.

use serde::Serialize;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    AttemptOutcome, Assignment, AuditActor, InvitationAttempt, InvitationStatus, NewInvitationAttempt, Order,
    PaymentStatus,
};
use crate::services::notification::{notify_operator, OperatorNotification, OperatorNotifier};
use crate::services::orders::transition_invitation;
use crate::store::{AllocationStore, StoreError};

/// What the executor needs to invite a holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRequest {
    pub order_ref: String,
    pub target_email: String,
    pub account_identity: String,
    pub lease_id: Uuid,
}

impl InviteRequest {
    pub fn new(order_ref: &str, assignment: &Assignment) -> Self {
        Self {
            order_ref: order_ref.to_string(),
            target_email: assignment.lease.holder_id.clone(),
            account_identity: assignment.account_identity.clone(),
            lease_id: assignment.lease.id,
        }
    }
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("Invite rejected: {0}")]
    Rejected(String),

    #[error("Invite executor unavailable: {0}")]
    Unavailable(String),
}

/// Boundary to whatever actually sends the invitation.
#[async_trait::async_trait]
pub trait InviteExecutor: Send + Sync {
    async fn invite(&self, request: &InviteRequest) -> Result<(), InviteError>;
}

/// Executor that accepts every request without doing anything.
#[derive(Debug, Clone, Default)]
pub struct NoopInviteExecutor;

#[async_trait::async_trait]
impl InviteExecutor for NoopInviteExecutor {
    async fn invite(&self, request: &InviteRequest) -> Result<(), InviteError> {
        info!(
            order_ref = %request.order_ref,
            account = %request.account_identity,
            "Noop: Would invite holder"
        );
        Ok(())
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Succeed,
    Fail(String),
    /// Never answers; exercises the attempt timeout.
    Hang,
}

/// Executor that replays a script, then succeeds.
///
/// Used in tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInviteExecutor {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    calls: Arc<Mutex<Vec<InviteRequest>>>,
}

impl ScriptedInviteExecutor {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            calls: Arc::default(),
        }
    }

    /// An executor that fails the first `times` calls.
    pub fn failing_times(times: usize) -> Self {
        Self::new(std::iter::repeat(ScriptStep::Fail("invite rejected".to_string())).take(times))
    }

    pub fn calls(&self) -> Vec<InviteRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl InviteExecutor for ScriptedInviteExecutor {
    async fn invite(&self, request: &InviteRequest) -> Result<(), InviteError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(ScriptStep::Succeed);
        match step {
            ScriptStep::Succeed => Ok(()),
            ScriptStep::Fail(reason) => Err(InviteError::Rejected(reason)),
            ScriptStep::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Retry schedule for invitation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(300),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base, 2x base, 4x base...
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Longer than any quiet period of a live pipeline: the largest backoff
    /// plus one attempt.
    pub fn stall_after(&self) -> Duration {
        self.backoff(self.max_retries)
            .saturating_add(self.attempt_timeout)
    }
}

#[derive(Debug, Error)]
pub enum ResendError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Invitation cannot be resent: {0}")]
    NotResendable(String),

    #[error("Invitation pipeline is disabled")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of one stalled invitation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub candidates: usize,
    pub resumed: usize,
    /// Orders whose attempt budget was already spent.
    pub exhausted: usize,
    /// Orders whose successful attempt was never reflected in their status.
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct ResumedInvitations {
    pub report: ResumeReport,
    pub handles: Vec<JoinHandle<InvitationStatus>>,
}

#[derive(Debug)]
pub struct ResentInvitation {
    pub order: Order,
    pub first_attempt: u32,
    pub handle: JoinHandle<InvitationStatus>,
}

enum Resumption {
    Skipped,
    Completed,
    Exhausted,
    Resumed(JoinHandle<InvitationStatus>),
}

/// Highest recorded attempt number.
fn attempts_made(attempts: &[InvitationAttempt]) -> u32 {
    attempts
        .iter()
        .map(|a| u32::try_from(a.attempt_number).unwrap_or(0))
        .max()
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct InvitationPipeline {
    store: Arc<dyn AllocationStore>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn InviteExecutor>,
    notifier: Arc<dyn OperatorNotifier>,
    policy: RetryPolicy,
    enabled: bool,
}

impl InvitationPipeline {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn InviteExecutor>,
        notifier: Arc<dyn OperatorNotifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            executor,
            notifier,
            policy,
            enabled: true,
        }
    }

    /// A disabled pipeline leaves orders at `account_assigned`.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Runs the pipeline in a background task.
    pub fn dispatch(&self, order_id: Uuid, order_ref: &str, assignment: &Assignment) -> Option<JoinHandle<InvitationStatus>> {
        if !self.enabled {
            return None;
        }
        let request = InviteRequest::new(order_ref, assignment);
        Some(self.spawn(order_id, request, 1..=self.policy.total_attempts()))
    }

    fn spawn(&self, order_id: Uuid, request: InviteRequest, attempts: RangeInclusive<u32>) -> JoinHandle<InvitationStatus> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run_attempts(order_id, request, attempts).await })
    }

    /// Attempts the invitation up to `max_retries + 1` times and returns the
    /// final invitation status of the order.
    pub async fn run(&self, order_id: Uuid, request: InviteRequest) -> InvitationStatus {
        self.run_attempts(order_id, request, 1..=self.policy.total_attempts())
            .await
    }

    /// Runs the attempts numbered `attempts`. A closed lease ends the run as
    /// `cancelled`; an exhausted range ends it as `manual_review_required`.
    async fn run_attempts(
        &self,
        order_id: Uuid,
        request: InviteRequest,
        attempts: RangeInclusive<u32>,
    ) -> InvitationStatus {
        let (first, last) = (*attempts.start(), *attempts.end());
        if !self.lease_still_active(request.lease_id).await {
            return self.cancel(order_id, &request, "before invitation started").await;
        }
        if let Err(e) = self.set_status(order_id, InvitationStatus::Processing).await {
            warn!(order_ref = %request.order_ref, error = %e, "Failed to mark invitation processing");
        }

        let mut last_error = String::new();

        for attempt in attempts {
            if attempt > first && !self.lease_still_active(request.lease_id).await {
                return self.cancel(order_id, &request, "between attempts").await;
            }

            let (outcome, error_message) =
                match tokio::time::timeout(self.policy.attempt_timeout, self.executor.invite(&request)).await {
                    Ok(Ok(())) => (AttemptOutcome::Success, None),
                    Ok(Err(e)) => (AttemptOutcome::Failure, Some(e.to_string())),
                    Err(_) => (
                        AttemptOutcome::Timeout,
                        Some(format!(
                            "Invite timed out after {}s",
                            self.policy.attempt_timeout.as_secs_f64()
                        )),
                    ),
                };

            if let Err(e) = self
                .record_attempt(order_id, &request, attempt, outcome, error_message.clone())
                .await
            {
                warn!(order_ref = %request.order_ref, error = %e, "Failed to record invitation attempt");
            }

            if outcome == AttemptOutcome::Success {
                info!(order_ref = %request.order_ref, attempt, "Invitation sent");
                return self.finish(order_id, &request, InvitationStatus::Sent).await;
            }

            last_error = error_message.unwrap_or_default();
            warn!(
                order_ref = %request.order_ref,
                attempt,
                last,
                outcome = %outcome,
                error = %last_error,
                "Invitation attempt failed"
            );

            if attempt < last {
                tokio::time::sleep(self.policy.backoff(attempt - first)).await;
            }
        }

        if !self.lease_still_active(request.lease_id).await {
            return self.cancel(order_id, &request, "after the last attempt").await;
        }
        self.require_manual_review(order_id, &request, last, &last_error)
            .await
    }

    async fn cancel(&self, order_id: Uuid, request: &InviteRequest, stage: &'static str) -> InvitationStatus {
        info!(
            order_ref = %request.order_ref,
            lease_id = %request.lease_id,
            stage,
            "Lease closed; invitation cancelled"
        );
        self.finish(order_id, request, InvitationStatus::Cancelled).await
    }

    async fn require_manual_review(
        &self,
        order_id: Uuid,
        request: &InviteRequest,
        attempts: u32,
        last_error: &str,
    ) -> InvitationStatus {
        error!(order_ref = %request.order_ref, attempts, "Invitation retries exhausted");
        let status = self
            .finish(order_id, request, InvitationStatus::ManualReviewRequired)
            .await;
        notify_operator(
            self.notifier.as_ref(),
            OperatorNotification::manual_review(&request.order_ref, attempts, last_error),
        )
        .await;
        status
    }

    /// Picks up invitations whose background task is gone, e.g. after a
    /// restart. An order qualifies when it is paid, holds an active lease,
    /// sits at `processing` or `account_assigned`, and has seen no activity
    /// for longer than any gap the retry schedule produces.
    pub async fn resume_stalled(&self, limit: i64) -> Result<ResumedInvitations, StoreError> {
        let mut resumed = ResumedInvitations::default();
        if !self.enabled {
            return Ok(resumed);
        }
        let Ok(grace) = chrono::Duration::from_std(self.policy.stall_after()) else {
            return Ok(resumed);
        };

        let mut candidates = self
            .store
            .list_orders_by_invitation_status(InvitationStatus::Processing, limit)
            .await?;
        candidates.extend(
            self.store
                .list_orders_by_invitation_status(InvitationStatus::AccountAssigned, limit)
                .await?,
        );
        resumed.report.candidates = candidates.len();

        for order in candidates {
            match self.resume_order(&order, grace).await {
                Ok(Resumption::Skipped) => {}
                Ok(Resumption::Completed) => resumed.report.completed += 1,
                Ok(Resumption::Exhausted) => resumed.report.exhausted += 1,
                Ok(Resumption::Resumed(handle)) => {
                    resumed.report.resumed += 1;
                    resumed.handles.push(handle);
                }
                Err(e) => {
                    resumed.report.failed += 1;
                    warn!(order_ref = %order.order_ref, error = %e, "Failed to resume invitation");
                }
            }
        }

        if resumed.report.resumed + resumed.report.exhausted + resumed.report.completed > 0 {
            info!(
                candidates = resumed.report.candidates,
                resumed = resumed.report.resumed,
                exhausted = resumed.report.exhausted,
                completed = resumed.report.completed,
                "Stalled invitations picked up"
            );
        }
        Ok(resumed)
    }

    async fn resume_order(&self, order: &Order, grace: chrono::Duration) -> Result<Resumption, StoreError> {
        if order.payment_status != PaymentStatus::Paid {
            return Ok(Resumption::Skipped);
        }
        let Some(request) = self.active_request(order).await? else {
            return Ok(Resumption::Skipped);
        };
        let attempts = self.store.list_invitation_attempts(order.id).await?;
        let last_activity = attempts
            .iter()
            .map(|a| a.attempted_at)
            .chain(std::iter::once(order.updated_at))
            .max()
            .unwrap_or(order.updated_at);
        if self.clock.now() - last_activity < grace {
            return Ok(Resumption::Skipped);
        }

        if attempts.iter().any(|a| a.outcome == AttemptOutcome::Success) {
            self.finish(order.id, &request, InvitationStatus::Sent).await;
            return Ok(Resumption::Completed);
        }

        let made = attempts_made(&attempts);
        let total = self.policy.total_attempts();
        if made >= total {
            let last_error = attempts
                .iter()
                .rev()
                .find_map(|a| a.error_message.clone())
                .unwrap_or_default();
            self.require_manual_review(order.id, &request, made, &last_error)
                .await;
            return Ok(Resumption::Exhausted);
        }

        info!(
            order_ref = %order.order_ref,
            attempts_made = made,
            "Resuming stalled invitation"
        );
        Ok(Resumption::Resumed(self.spawn(order.id, request, made + 1..=total)))
    }

    /// Starts a fresh attempt budget for a paid order that holds a seat.
    /// Attempt numbers continue after the ones already recorded.
    pub async fn resend(&self, order_ref: &str, actor: &AuditActor) -> Result<ResentInvitation, ResendError> {
        if !self.enabled {
            return Err(ResendError::Disabled);
        }
        let order = self
            .store
            .find_order_by_ref(order_ref)
            .await?
            .ok_or_else(|| ResendError::OrderNotFound(order_ref.to_string()))?;

        let mut uow = self.store.begin().await?;
        let result: Result<Order, ResendError> = async {
            let mut order = uow
                .lock_order(order.id)
                .await?
                .ok_or_else(|| ResendError::OrderNotFound(order_ref.to_string()))?;
            if order.payment_status != PaymentStatus::Paid {
                return Err(ResendError::NotResendable(format!("order {} is not paid", order.order_ref)));
            }
            if order.invitation_status == InvitationStatus::Processing {
                return Err(ResendError::NotResendable(format!(
                    "invitation for order {} is already in progress",
                    order.order_ref
                )));
            }
            if uow.active_leases_for_order(order.id).await?.is_empty() {
                return Err(ResendError::NotResendable(format!(
                    "order {} holds no active seat",
                    order.order_ref
                )));
            }
            transition_invitation(
                uow.as_mut(),
                &mut order,
                InvitationStatus::Processing,
                actor,
                self.clock.as_ref(),
            )
            .await?;
            Ok(order)
        }
        .await;
        let order = match result {
            Ok(order) => {
                uow.commit().await?;
                order
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(err);
            }
        };

        let request = self
            .active_request(&order)
            .await?
            .ok_or_else(|| ResendError::NotResendable(format!("order {} holds no active seat", order.order_ref)))?;
        let made = attempts_made(&self.store.list_invitation_attempts(order.id).await?);
        let first_attempt = made + 1;
        info!(order_ref = %order.order_ref, actor = %actor.name, first_attempt, "Invitation resent");
        let handle = self.spawn(
            order.id,
            request,
            first_attempt..=made + self.policy.total_attempts(),
        );
        Ok(ResentInvitation {
            order,
            first_attempt,
            handle,
        })
    }

    /// Invite request for the order's active lease, if it still has one.
    async fn active_request(&self, order: &Order) -> Result<Option<InviteRequest>, StoreError> {
        let Some(lease) = self
            .store
            .find_active_leases_for_order(order.id)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let account = self
            .store
            .find_account(lease.account_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", lease.account_id)))?;
        Ok(Some(InviteRequest {
            order_ref: order.order_ref.clone(),
            target_email: lease.holder_id,
            account_identity: account.identity,
            lease_id: lease.id,
        }))
    }

    async fn finish(&self, order_id: Uuid, request: &InviteRequest, status: InvitationStatus) -> InvitationStatus {
        if let Err(e) = self.set_status(order_id, status).await {
            error!(
                order_ref = %request.order_ref,
                status = %status,
                error = %e,
                "Failed to store invitation status"
            );
        }
        status
    }

    async fn lease_still_active(&self, lease_id: Uuid) -> bool {
        match self.store.find_lease(lease_id).await {
            Ok(Some(lease)) => lease.is_active(),
            Ok(None) => false,
            // Keep trying; the attempt itself will surface a broken store.
            Err(_) => true,
        }
    }

    async fn set_status(&self, order_id: Uuid, status: InvitationStatus) -> Result<(), StoreError> {
        let mut uow = self.store.begin().await?;
        let Some(mut order) = uow.lock_order(order_id).await? else {
            uow.rollback().await?;
            return Err(StoreError::NotFound(format!("order {}", order_id)));
        };
        transition_invitation(
            uow.as_mut(),
            &mut order,
            status,
            &AuditActor::system(),
            self.clock.as_ref(),
        )
        .await?;
        uow.commit().await
    }

    async fn record_attempt(
        &self,
        order_id: Uuid,
        request: &InviteRequest,
        attempt: u32,
        outcome: AttemptOutcome,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut uow = self.store.begin().await?;
        uow.insert_invitation_attempt(NewInvitationAttempt {
            id: Uuid::new_v4(),
            order_id,
            lease_id: Some(request.lease_id),
            attempt_number: attempt as i32,
            outcome,
            error_message,
            attempted_at: self.clock.now(),
        })
        .await?;
        uow.commit().await
    }
}
