//! Payment reconciler.
//!
//! Turns payment provider callbacks into lease lifecycle transitions. The
//! order row is locked for the whole transition so that a given order moves
//! to `paid` at most once no matter how often the provider redelivers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{
    AssignOutcome, Assignment, AuditActor, InvitationStatus, Order, PaymentStatus,
};
use crate::services::allocator::{finish, AllocationError, Allocator};
use crate::services::audit::audit_helpers;
use crate::services::invitation::InvitationPipeline;
use crate::services::notification::{notify_operator, OperatorNotification, OperatorNotifier};
use crate::services::orders::{transition_invitation, PackageCatalog};
use crate::store::{StoreError, UnitOfWork};
use shared::crypto::verify_hmac_sha256_hex;

/// Callback event this reconciler acts on.
pub const PAYMENT_STATUS_EVENT: &str = "payment_status";

/// Orders examined per stock retry pass.
pub const STOCK_RETRY_BATCH: i64 = 100;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid callback signature")]
    InvalidSignature,

    #[error("Malformed callback payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown payment status: {0}")]
    UnknownStatus(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order {0} is not paid")]
    NotPaid(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        ReconcileError::Allocation(AllocationError::from(err))
    }
}

/// Body the payment provider posts to the callback endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentCallback {
    /// Provider transaction reference.
    pub reference: Option<String>,
    /// Our order reference.
    pub merchant_ref: Option<String>,
    pub status: String,
    /// Unix seconds.
    pub paid_at: Option<i64>,
}

/// Seat-level effect of an applied payment status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEffect {
    /// The order got a seat.
    Assigned,
    /// Paid, but the pool had no free seat.
    NoCapacity,
    /// Paid, but allocation errored and was rolled back.
    AllocationFailed,
    /// A failed, expired or refunded payment closed `count` active leases.
    Released { count: usize, reason: String },
}

/// What a callback did.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Applied {
        order_ref: String,
        from: PaymentStatus,
        to: PaymentStatus,
        invitation_status: InvitationStatus,
        effect: PaymentEffect,
    },
    /// Duplicate or out-of-order delivery; nothing changed.
    Noop { order_ref: String, status: PaymentStatus },
    /// Not an event we handle.
    Ignored(String),
}

/// How a payment status change affects the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Noop,
    MarkPaid,
    /// Close the order without a seat (or take the seat back).
    Close,
}

fn transition(from: PaymentStatus, to: PaymentStatus) -> Transition {
    match (from, to) {
        (PaymentStatus::Pending, PaymentStatus::Paid) => Transition::MarkPaid,
        (PaymentStatus::Pending, to) if to.revokes_access() => Transition::Close,
        (PaymentStatus::Paid, to) if to.revokes_access() => Transition::Close,
        _ => Transition::Noop,
    }
}

/// Summary of one pending stock retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StockRetryReport {
    pub candidates: usize,
    pub assigned: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    allocator: Allocator,
    catalog: Arc<PackageCatalog>,
    invitations: InvitationPipeline,
    notifier: Arc<dyn OperatorNotifier>,
    private_key: String,
    provider: String,
    default_lease: Duration,
}

impl PaymentReconciler {
    pub fn new(
        allocator: Allocator,
        catalog: Arc<PackageCatalog>,
        invitations: InvitationPipeline,
        notifier: Arc<dyn OperatorNotifier>,
        private_key: impl Into<String>,
        default_lease: Duration,
    ) -> Self {
        Self {
            allocator,
            catalog,
            invitations,
            notifier,
            private_key: private_key.into(),
            provider: "payment_gateway".to_string(),
            default_lease,
        }
    }

    /// Name recorded as the actor of callback-driven changes.
    pub fn with_provider_name(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    fn actor(&self) -> AuditActor {
        AuditActor::payment_provider(self.provider.clone())
    }

    fn lease_duration(&self, order: &Order) -> Duration {
        self.catalog
            .lease_duration(&order.package_id)
            .unwrap_or(self.default_lease)
    }

    /// Verifies and applies a raw provider callback.
    ///
    /// Nothing is parsed before the signature checks out.
    pub async fn handle_callback(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        event: Option<&str>,
    ) -> Result<CallbackOutcome, ReconcileError> {
        let signature = signature.ok_or(ReconcileError::InvalidSignature)?;
        if !verify_hmac_sha256_hex(&self.private_key, raw_body, signature) {
            warn!("Rejected payment callback with invalid signature");
            return Err(ReconcileError::InvalidSignature);
        }

        match event {
            Some(PAYMENT_STATUS_EVENT) => {}
            other => {
                let event = other.unwrap_or("<none>").to_string();
                info!(event = %event, "Ignoring payment callback event");
                return Ok(CallbackOutcome::Ignored(event));
            }
        }

        let raw: JsonValue = serde_json::from_slice(raw_body)
            .map_err(|e| ReconcileError::MalformedPayload(e.to_string()))?;
        let callback: PaymentCallback = serde_json::from_value(raw.clone())
            .map_err(|e| ReconcileError::MalformedPayload(e.to_string()))?;

        let status = PaymentStatus::from_provider(&callback.status)
            .ok_or_else(|| ReconcileError::UnknownStatus(callback.status.clone()))?;
        let paid_at = callback
            .paid_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        let order = self.locate_order(&callback).await?;
        self.apply_payment_status(order.id, status, callback.reference, paid_at, Some(raw))
            .await
    }

    async fn locate_order(&self, callback: &PaymentCallback) -> Result<Order, ReconcileError> {
        let store = self.allocator.store();
        if let Some(merchant_ref) = callback.merchant_ref.as_deref() {
            if let Some(order) = store.find_order_by_ref(merchant_ref).await? {
                return Ok(order);
            }
        }
        if let Some(reference) = callback.reference.as_deref() {
            if let Some(order) = store.find_order_by_reference(reference).await? {
                return Ok(order);
            }
            if let Some(order) = store.find_order_by_ref(reference).await? {
                return Ok(order);
            }
        }
        Err(ReconcileError::OrderNotFound(
            callback
                .merchant_ref
                .clone()
                .or_else(|| callback.reference.clone())
                .unwrap_or_default(),
        ))
    }

    /// Applies a verified payment status to an order.
    pub async fn apply_payment_status(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        reference: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        raw_callback: Option<JsonValue>,
    ) -> Result<CallbackOutcome, ReconcileError> {
        let actor = self.actor();
        let store = self.allocator.store().clone();
        let mut uow = store.begin().await?;

        let mut order = match uow.lock_order(order_id).await? {
            Some(order) => order,
            None => {
                uow.rollback().await?;
                return Err(ReconcileError::OrderNotFound(order_id.to_string()));
            }
        };
        let from = order.payment_status;

        match transition(from, status) {
            Transition::Noop => {
                uow.rollback().await?;
                info!(
                    order_ref = %order.order_ref,
                    current = %from,
                    received = %status,
                    "Payment status unchanged"
                );
                Ok(CallbackOutcome::Noop {
                    order_ref: order.order_ref,
                    status: from,
                })
            }
            Transition::Close => {
                let result = self
                    .close_order(uow.as_mut(), &mut order, status, reference, raw_callback, &actor)
                    .await;
                let effect = finish(uow, result).await?;
                info!(order_ref = %order.order_ref, from = %from, to = %status, "Order closed by payment status");
                Ok(CallbackOutcome::Applied {
                    order_ref: order.order_ref,
                    from,
                    to: status,
                    invitation_status: order.invitation_status,
                    effect,
                })
            }
            Transition::MarkPaid => {
                let snapshot = order.clone();
                let result = self
                    .mark_paid(uow.as_mut(), &mut order, reference.clone(), paid_at, raw_callback.clone(), &actor)
                    .await;
                let effect = match finish(uow, result).await {
                    Ok(outcome) => {
                        let effect = match outcome {
                            AssignOutcome::Assigned(_) => PaymentEffect::Assigned,
                            AssignOutcome::NoCapacity => PaymentEffect::NoCapacity,
                        };
                        self.after_assignment(&order, outcome).await;
                        effect
                    }
                    Err(e) => {
                        error!(order_ref = %snapshot.order_ref, error = %e, "Seat allocation failed");
                        order = self
                            .mark_paid_without_seat(snapshot.id, reference, paid_at, raw_callback, &actor)
                            .await?;
                        notify_operator(
                            self.notifier.as_ref(),
                            OperatorNotification::allocation_failed(&order.order_ref, &e.to_string()),
                        )
                        .await;
                        PaymentEffect::AllocationFailed
                    }
                };
                Ok(CallbackOutcome::Applied {
                    order_ref: order.order_ref,
                    from,
                    to: PaymentStatus::Paid,
                    invitation_status: order.invitation_status,
                    effect,
                })
            }
        }
    }

    fn record_payment(
        order: &mut Order,
        status: PaymentStatus,
        reference: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        raw_callback: Option<JsonValue>,
        now: DateTime<Utc>,
    ) {
        order.payment_status = status;
        if reference.is_some() {
            order.reference = reference;
        }
        if status == PaymentStatus::Paid {
            order.paid_at = Some(paid_at.unwrap_or(now));
        }
        if raw_callback.is_some() {
            order.raw_callback = raw_callback;
        }
        order.updated_at = now;
    }

    async fn close_order(
        &self,
        uow: &mut dyn UnitOfWork,
        order: &mut Order,
        status: PaymentStatus,
        reference: Option<String>,
        raw_callback: Option<JsonValue>,
        actor: &AuditActor,
    ) -> Result<PaymentEffect, AllocationError> {
        let now = self.allocator.clock().now();
        let previous = order.payment_status;
        Self::record_payment(order, status, reference, None, raw_callback, now);
        uow.update_order(order).await?;
        uow.append_audit(audit_helpers::order_payment_status(actor, order, previous, now))
            .await?;

        let reason = format!("payment_{}", status);
        let mut count = 0;
        for lease in uow.active_leases_for_order(order.id).await? {
            if !self.allocator.release_in(uow, lease.id, &reason, actor).await?.already_closed {
                count += 1;
            }
        }
        Ok(PaymentEffect::Released { count, reason })
    }

    async fn mark_paid(
        &self,
        uow: &mut dyn UnitOfWork,
        order: &mut Order,
        reference: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        raw_callback: Option<JsonValue>,
        actor: &AuditActor,
    ) -> Result<AssignOutcome, AllocationError> {
        let clock = self.allocator.clock().clone();
        let now = clock.now();
        let previous = order.payment_status;
        Self::record_payment(order, PaymentStatus::Paid, reference, paid_at, raw_callback, now);
        uow.update_order(order).await?;
        uow.append_audit(audit_helpers::order_payment_status(actor, order, previous, now))
            .await?;

        let holder = order.customer_email.clone();
        let duration = self.lease_duration(order);
        let outcome = self
            .allocator
            .assign_in(uow, order, &holder, duration, actor)
            .await?;
        let next = match outcome {
            AssignOutcome::Assigned(_) => InvitationStatus::AccountAssigned,
            AssignOutcome::NoCapacity => InvitationStatus::PendingStock,
        };
        transition_invitation(uow, order, next, actor, clock.as_ref()).await?;
        Ok(outcome)
    }

    /// Records the payment after an allocation failure rolled everything
    /// back, so the order still reflects that the customer paid.
    async fn mark_paid_without_seat(
        &self,
        order_id: Uuid,
        reference: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        raw_callback: Option<JsonValue>,
        actor: &AuditActor,
    ) -> Result<Order, ReconcileError> {
        let clock = self.allocator.clock().clone();
        let mut uow = self.allocator.store().begin().await?;
        let result: Result<Order, AllocationError> = async {
            let mut order = uow
                .lock_order(order_id)
                .await?
                .ok_or_else(|| AllocationError::NotFound(format!("Order {} not found", order_id)))?;
            if order.payment_status != PaymentStatus::Pending {
                return Ok(order);
            }
            let now = clock.now();
            let previous = order.payment_status;
            Self::record_payment(&mut order, PaymentStatus::Paid, reference, paid_at, raw_callback, now);
            uow.update_order(&order).await?;
            uow.append_audit(audit_helpers::order_payment_status(actor, &order, previous, now))
                .await?;
            transition_invitation(
                uow.as_mut(),
                &mut order,
                InvitationStatus::AllocationFailed,
                actor,
                clock.as_ref(),
            )
            .await?;
            Ok(order)
        }
        .await;
        Ok(finish(uow, result).await?)
    }

    /// Follow-up after a committed assignment attempt: start the invitation
    /// or tell an operator the pool ran dry.
    async fn after_assignment(&self, order: &Order, outcome: AssignOutcome) {
        match outcome {
            AssignOutcome::Assigned(assignment) => {
                self.start_invitation(order, &assignment);
            }
            AssignOutcome::NoCapacity => {
                warn!(order_ref = %order.order_ref, "Paid order waiting for stock");
                notify_operator(
                    self.notifier.as_ref(),
                    OperatorNotification::pending_stock(&order.order_ref, &order.customer_email),
                )
                .await;
            }
        }
    }

    fn start_invitation(&self, order: &Order, assignment: &Assignment) {
        if self
            .invitations
            .dispatch(order.id, &order.order_ref, assignment)
            .is_none()
        {
            info!(order_ref = %order.order_ref, "Invitation pipeline disabled; seat assigned");
        }
    }

    /// Re-runs assignment for paid orders waiting on stock. Stops at the
    /// first order that still finds no free seat.
    pub async fn retry_pending_stock(&self) -> Result<StockRetryReport, ReconcileError> {
        let candidates = self
            .allocator
            .store()
            .list_orders_by_invitation_status(InvitationStatus::PendingStock, STOCK_RETRY_BATCH)
            .await?;
        let mut report = StockRetryReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        let actor = AuditActor::system();

        for candidate in candidates {
            match self.assign_waiting_order(candidate.id, &actor).await {
                Ok(Some((order, AssignOutcome::Assigned(assignment)))) => {
                    report.assigned += 1;
                    self.start_invitation(&order, &assignment);
                }
                Ok(Some((_, AssignOutcome::NoCapacity))) => break,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(order_ref = %candidate.order_ref, error = %e, "Stock retry failed");
                }
            }
        }

        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                assigned = report.assigned,
                failed = report.failed,
                "Pending stock retry finished"
            );
        }
        Ok(report)
    }

    /// `None` when the order no longer waits for stock.
    async fn assign_waiting_order(
        &self,
        order_id: Uuid,
        actor: &AuditActor,
    ) -> Result<Option<(Order, AssignOutcome)>, AllocationError> {
        let clock = self.allocator.clock().clone();
        let mut uow = self.allocator.store().begin().await?;
        let result: Result<Option<(Order, AssignOutcome)>, AllocationError> = async {
            let Some(mut order) = uow.lock_order(order_id).await? else {
                return Ok(None);
            };
            if order.payment_status != PaymentStatus::Paid
                || order.invitation_status != InvitationStatus::PendingStock
            {
                return Ok(None);
            }
            let holder = order.customer_email.clone();
            let outcome = self
                .allocator
                .assign_in(uow.as_mut(), &order, &holder, self.lease_duration(&order), actor)
                .await?;
            if outcome.assignment().is_some() {
                transition_invitation(
                    uow.as_mut(),
                    &mut order,
                    InvitationStatus::AccountAssigned,
                    actor,
                    clock.as_ref(),
                )
                .await?;
            }
            Ok(Some((order, outcome)))
        }
        .await;
        finish(uow, result).await
    }

    /// Operator-initiated assignment for a paid order without a seat.
    pub async fn assign_paid_order(
        &self,
        order_ref: &str,
        holder_id: Option<&str>,
        duration: Option<Duration>,
        actor: &AuditActor,
    ) -> Result<Assignment, ReconcileError> {
        let order = self
            .allocator
            .store()
            .find_order_by_ref(order_ref)
            .await?
            .ok_or_else(|| ReconcileError::OrderNotFound(order_ref.to_string()))?;

        let clock = self.allocator.clock().clone();
        let mut uow = self.allocator.store().begin().await?;
        let result: Result<(Order, AssignOutcome), ReconcileError> = async {
            let mut order = uow
                .lock_order(order.id)
                .await?
                .ok_or_else(|| ReconcileError::OrderNotFound(order_ref.to_string()))?;
            if order.payment_status != PaymentStatus::Paid {
                return Err(ReconcileError::NotPaid(order.order_ref.clone()));
            }
            let holder = holder_id
                .map(str::to_string)
                .unwrap_or_else(|| order.customer_email.clone());
            let duration = duration.unwrap_or_else(|| self.lease_duration(&order));
            let outcome = self
                .allocator
                .assign_in(uow.as_mut(), &order, &holder, duration, actor)
                .await?;
            if outcome.assignment().is_some() {
                transition_invitation(
                    uow.as_mut(),
                    &mut order,
                    InvitationStatus::AccountAssigned,
                    actor,
                    clock.as_ref(),
                )
                .await?;
            }
            Ok((order, outcome))
        }
        .await;

        let (order, outcome) = match result {
            Ok(value) => {
                uow.commit().await?;
                value
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        };

        match outcome {
            AssignOutcome::Assigned(assignment) => {
                self.start_invitation(&order, &assignment);
                Ok(assignment)
            }
            AssignOutcome::NoCapacity => Err(ReconcileError::Allocation(AllocationError::Conflict(
                "No pool account has a free seat".to_string(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::order::CreateOrderRequest;
    use crate::models::{AccountStatus, AuditAction, LeaseStatus, Package};
    use crate::services::invitation::{RetryPolicy, ScriptedInviteExecutor};
    use crate::services::notification::{NotificationKind, RecordingNotifier};
    use crate::services::orders::OrderService;
    use crate::store::{AllocationStore, InMemoryStore};
    use serde_json::json;
    use shared::crypto::hmac_sha256_hex;

    const KEY: &str = "callback-private-key";

    struct Harness {
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        allocator: Allocator,
        orders: OrderService,
        notifier: RecordingNotifier,
        reconciler: PaymentReconciler,
    }

    fn harness_with(invitations_enabled: bool) -> Harness {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let shared_store: Arc<dyn AllocationStore> = Arc::new(store.clone());
        let allocator = Allocator::new(shared_store.clone(), clock.clone());
        let catalog = Arc::new(PackageCatalog::new(vec![Package {
            id: "1_month".to_string(),
            name: "1 Month".to_string(),
            price: 50_000,
            duration_days: 30,
        }]));
        let notifier = RecordingNotifier::new();
        let pipeline = InvitationPipeline::new(
            shared_store.clone(),
            clock.clone(),
            Arc::new(ScriptedInviteExecutor::default()),
            Arc::new(notifier.clone()),
            RetryPolicy {
                max_retries: 0,
                base_backoff: std::time::Duration::ZERO,
                attempt_timeout: std::time::Duration::from_millis(50),
            },
        )
        .with_enabled(invitations_enabled);
        let reconciler = PaymentReconciler::new(
            allocator.clone(),
            catalog.clone(),
            pipeline,
            Arc::new(notifier.clone()),
            KEY,
            Duration::days(30),
        );
        let orders = OrderService::new(shared_store, clock.clone(), catalog);
        Harness {
            store,
            clock,
            allocator,
            orders,
            notifier,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    async fn new_order(h: &Harness) -> Order {
        h.orders
            .create_order(CreateOrderRequest {
                customer_email: "buyer@example.com".to_string(),
                full_name: None,
                package_id: "1_month".to_string(),
            })
            .await
            .unwrap()
    }

    async fn stock(h: &Harness, identity: &str, capacity: Option<i32>) {
        h.allocator
            .create_account(identity, capacity, None, &AuditActor::admin("ops"))
            .await
            .unwrap();
    }

    fn body(order: &Order, status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "reference": format!("T-{}", order.order_ref),
            "merchant_ref": order.order_ref,
            "status": status,
            "paid_at": 1_767_225_600,
        }))
        .unwrap()
    }

    async fn deliver(h: &Harness, order: &Order, status: &str) -> Result<CallbackOutcome, ReconcileError> {
        let body = body(order, status);
        let signature = hmac_sha256_hex(KEY, &body);
        h.reconciler
            .handle_callback(&body, Some(&signature), Some(PAYMENT_STATUS_EVENT))
            .await
    }

    async fn reload(h: &Harness, order: &Order) -> Order {
        h.store.find_order(order.id).await.unwrap().unwrap()
    }

    #[test]
    fn test_transition_table() {
        use PaymentStatus::*;
        assert_eq!(transition(Pending, Paid), Transition::MarkPaid);
        assert_eq!(transition(Pending, Failed), Transition::Close);
        assert_eq!(transition(Pending, Expired), Transition::Close);
        assert_eq!(transition(Paid, Refunded), Transition::Close);
        assert_eq!(transition(Paid, Paid), Transition::Noop);
        assert_eq!(transition(Paid, Pending), Transition::Noop);
        assert_eq!(transition(Pending, Pending), Transition::Noop);
        assert_eq!(transition(Expired, Paid), Transition::Noop);
        assert_eq!(transition(Refunded, Failed), Transition::Noop);
    }

    #[tokio::test]
    async fn test_paid_callback_assigns_seat() {
        let h = harness();
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;

        let outcome = deliver(&h, &order, "PAID").await.unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Applied {
                order_ref: order.order_ref.clone(),
                from: PaymentStatus::Pending,
                to: PaymentStatus::Paid,
                invitation_status: InvitationStatus::AccountAssigned,
                effect: PaymentEffect::Assigned,
            }
        );

        let stored = reload(&h, &order).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.reference.as_deref(), Some(format!("T-{}", order.order_ref).as_str()));
        assert_eq!(stored.paid_at, DateTime::<Utc>::from_timestamp(1_767_225_600, 0));
        assert!(stored.raw_callback.is_some());

        let leases = h.store.find_active_leases_for_order(order.id).await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].holder_id, "buyer@example.com");
        assert_eq!(leases[0].end_at, h.clock.now() + Duration::days(30));
    }

    #[tokio::test]
    async fn test_duplicate_paid_callback_is_noop() {
        let h = harness();
        stock(&h, "pool@example.com", Some(5)).await;
        let order = new_order(&h).await;

        deliver(&h, &order, "PAID").await.unwrap();
        let second = deliver(&h, &order, "PAID").await.unwrap();
        assert_eq!(
            second,
            CallbackOutcome::Noop {
                order_ref: order.order_ref.clone(),
                status: PaymentStatus::Paid,
            }
        );

        assert_eq!(h.store.all_leases().await.len(), 1);
        let paid_transitions = h
            .store
            .audit_entries()
            .await
            .into_iter()
            .filter(|e| e.action == AuditAction::OrderPaymentStatus)
            .count();
        assert_eq!(paid_transitions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_paid_callbacks_assign_once() {
        let h = Arc::new(harness());
        stock(&h, "pool@example.com", Some(5)).await;
        let order = new_order(&h).await;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let h = h.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move { deliver(&h, &order, "PAID").await }));
        }
        let mut applied = 0;
        for handle in handles {
            if let CallbackOutcome::Applied { .. } = handle.await.unwrap().unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(h.store.all_leases().await.len(), 1);
    }

    #[tokio::test]
    async fn test_paid_with_empty_pool_waits_for_stock() {
        let h = harness();
        let order = new_order(&h).await;

        let outcome = deliver(&h, &order, "PAID").await.unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied {
                invitation_status: InvitationStatus::PendingStock,
                effect: PaymentEffect::NoCapacity,
                ..
            }
        ));
        let stored = reload(&h, &order).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.invitation_status, InvitationStatus::PendingStock);
        assert_eq!(h.notifier.count(NotificationKind::PendingStock), 1);
    }

    #[tokio::test]
    async fn test_stock_retry_assigns_after_restock() {
        let h = harness();
        let first = new_order(&h).await;
        let second = new_order(&h).await;
        deliver(&h, &first, "PAID").await.unwrap();
        deliver(&h, &second, "PAID").await.unwrap();

        stock(&h, "pool@example.com", None).await;
        let report = h.reconciler.retry_pending_stock().await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.assigned, 1);

        let statuses = [
            reload(&h, &first).await.invitation_status,
            reload(&h, &second).await.invitation_status,
        ];
        assert!(statuses.contains(&InvitationStatus::AccountAssigned));
        assert!(statuses.contains(&InvitationStatus::PendingStock));
    }

    #[tokio::test]
    async fn test_audit_failure_leaves_order_pending() {
        let h = harness();
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;

        h.store.set_audit_failure(true);
        let err = deliver(&h, &order, "PAID").await;
        h.store.set_audit_failure(false);
        // The recovery write also needs the audit log, so it fails too and
        // the order stays pending for the provider to redeliver.
        assert!(err.is_err());
        assert_eq!(reload(&h, &order).await.payment_status, PaymentStatus::Pending);
        assert!(h.store.all_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_payment_closes_order_without_lease() {
        let h = harness();
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;

        let outcome = deliver(&h, &order, "FAILED").await.unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Applied {
                to: PaymentStatus::Failed,
                effect: PaymentEffect::Released { count: 0, .. },
                ..
            }
        ));
        assert!(h.store.all_leases().await.is_empty());

        // Late PAID after a terminal failure changes nothing.
        let late = deliver(&h, &order, "PAID").await.unwrap();
        assert!(matches!(late, CallbackOutcome::Noop { .. }));
        assert!(h.store.all_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_refund_after_paid_releases_seat() {
        let h = harness();
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;
        deliver(&h, &order, "PAID").await.unwrap();

        let outcome = deliver(&h, &order, "REFUND").await.unwrap();
        let CallbackOutcome::Applied {
            invitation_status,
            effect,
            ..
        } = outcome
        else {
            panic!("expected an applied refund, got {:?}", outcome);
        };
        // The invitation status still reads as assigned; the effect says what
        // happened to the seat.
        assert_eq!(invitation_status, InvitationStatus::AccountAssigned);
        assert_eq!(
            effect,
            PaymentEffect::Released {
                count: 1,
                reason: "payment_refunded".to_string(),
            }
        );
        let stored = reload(&h, &order).await;
        assert_eq!(stored.payment_status, PaymentStatus::Refunded);

        let leases = h.store.all_leases().await;
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].status, LeaseStatus::Ended);
        assert_eq!(leases[0].reason.as_deref(), Some("payment_refunded"));

        let (accounts, _) = h.store.list_accounts(None, Default::default()).await.unwrap();
        assert_eq!(accounts[0].seats_used, 0);
        assert_eq!(accounts[0].status, AccountStatus::Available);
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected_without_mutation() {
        let h = harness();
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;
        let body = body(&order, "PAID");

        let forged = hmac_sha256_hex("wrong-key", &body);
        let err = h
            .reconciler
            .handle_callback(&body, Some(&forged), Some(PAYMENT_STATUS_EVENT))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidSignature));

        let missing = h
            .reconciler
            .handle_callback(&body, None, Some(PAYMENT_STATUS_EVENT))
            .await
            .unwrap_err();
        assert!(matches!(missing, ReconcileError::InvalidSignature));

        assert_eq!(reload(&h, &order).await.payment_status, PaymentStatus::Pending);
        assert!(h.store.all_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let h = harness();
        let order = new_order(&h).await;
        let body = body(&order, "PAID");
        let signature = hmac_sha256_hex(KEY, &body);

        let outcome = h
            .reconciler
            .handle_callback(&body, Some(&signature), Some("payout_status"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Ignored("payout_status".to_string()));
        assert_eq!(reload(&h, &order).await.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_status_and_unknown_order() {
        let h = harness();
        let order = new_order(&h).await;

        let err = deliver(&h, &order, "CHARGEBACK").await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownStatus(_)));

        let mut ghost = order.clone();
        ghost.order_ref = "ORD-GHOST".to_string();
        let err = deliver(&h, &ghost, "PAID").await.unwrap_err();
        assert!(matches!(err, ReconcileError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let h = harness();
        let body = b"not json".to_vec();
        let signature = hmac_sha256_hex(KEY, &body);
        let err = h
            .reconciler
            .handle_callback(&body, Some(&signature), Some(PAYMENT_STATUS_EVENT))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn test_paid_callback_dispatches_invitation() {
        let h = harness_with(true);
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;
        deliver(&h, &order, "PAID").await.unwrap();

        let mut status = InvitationStatus::AccountAssigned;
        for _ in 0..50 {
            status = reload(&h, &order).await.invitation_status;
            if status == InvitationStatus::Sent {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, InvitationStatus::Sent);
    }

    #[tokio::test]
    async fn test_manual_assign_requires_paid_order() {
        let h = harness();
        stock(&h, "pool@example.com", None).await;
        let order = new_order(&h).await;

        let err = h
            .reconciler
            .assign_paid_order(&order.order_ref, None, None, &AuditActor::admin("ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotPaid(_)));
    }

    #[tokio::test]
    async fn test_manual_assign_for_waiting_order() {
        let h = harness();
        let order = new_order(&h).await;
        deliver(&h, &order, "PAID").await.unwrap();
        stock(&h, "pool@example.com", None).await;

        let assignment = h
            .reconciler
            .assign_paid_order(
                &order.order_ref,
                Some("other@example.com"),
                Some(Duration::days(7)),
                &AuditActor::admin("ops"),
            )
            .await
            .unwrap();
        assert_eq!(assignment.lease.holder_id, "other@example.com");
        assert_eq!(assignment.lease.end_at, h.clock.now() + Duration::days(7));
        assert_eq!(
            reload(&h, &order).await.invitation_status,
            InvitationStatus::AccountAssigned
        );
    }
}
