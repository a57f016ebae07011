//! Operator notifications.
//!
//! Notifications are fire-and-forget: a failed delivery is logged by the
//! caller and never fails the flow that raised it.

use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Reason an operator is being alerted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PendingStock,
    AllocationFailed,
    ManualReviewRequired,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::PendingStock => write!(f, "pending_stock"),
            NotificationKind::AllocationFailed => write!(f, "allocation_failed"),
            NotificationKind::ManualReviewRequired => write!(f, "manual_review_required"),
        }
    }
}

/// Message delivered to the operator channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorNotification {
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
    pub order_ref: Option<String>,
}

impl OperatorNotification {
    pub fn pending_stock(order_ref: &str, customer_email: &str) -> Self {
        Self {
            kind: NotificationKind::PendingStock,
            subject: "Pool exhausted: paid order waiting for a seat".to_string(),
            body: format!(
                "Order {} for {} is paid but no pool account has a free seat. \
                 Add accounts; the order will be retried automatically.",
                order_ref, customer_email
            ),
            order_ref: Some(order_ref.to_string()),
        }
    }

    pub fn allocation_failed(order_ref: &str, error: &str) -> Self {
        Self {
            kind: NotificationKind::AllocationFailed,
            subject: "Seat allocation failed".to_string(),
            body: format!("Allocation for paid order {} failed: {}", order_ref, error),
            order_ref: Some(order_ref.to_string()),
        }
    }

    pub fn manual_review(order_ref: &str, attempts: u32, last_error: &str) -> Self {
        Self {
            kind: NotificationKind::ManualReviewRequired,
            subject: "Invitation needs manual review".to_string(),
            body: format!(
                "Invitation for order {} failed after {} attempts. Last error: {}",
                order_ref, attempts, last_error
            ),
            order_ref: Some(order_ref.to_string()),
        }
    }
}

/// Result of a notification delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationResult {
    Sent,
    Failed(String),
    /// No channel configured.
    Skipped,
}

/// Delivery channel for operator alerts.
#[async_trait::async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, notification: OperatorNotification) -> NotificationResult;
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify(&self, notification: OperatorNotification) -> NotificationResult {
        tracing::warn!(
            kind = %notification.kind,
            order_ref = ?notification.order_ref,
            subject = %notification.subject,
            "Operator notification: {}",
            notification.body
        );
        NotificationResult::Skipped
    }
}

/// Notifier that records what it was asked to send.
///
/// Used in tests to assert alerts were raised.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<OperatorNotification>>>,
    /// Whether to simulate failures for testing.
    pub simulate_failure: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            simulate_failure: true,
        }
    }

    pub fn sent(&self) -> Vec<OperatorNotification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|n| n.kind == kind).count()
    }
}

#[async_trait::async_trait]
impl OperatorNotifier for RecordingNotifier {
    async fn notify(&self, notification: OperatorNotification) -> NotificationResult {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        if self.simulate_failure {
            NotificationResult::Failed("Simulated failure".to_string())
        } else {
            NotificationResult::Sent
        }
    }
}

/// Sends a notification and logs the outcome.
pub async fn notify_operator(notifier: &dyn OperatorNotifier, notification: OperatorNotification) {
    let kind = notification.kind;
    let order_ref = notification.order_ref.clone();
    match notifier.notify(notification).await {
        NotificationResult::Sent => {
            tracing::info!(kind = %kind, order_ref = ?order_ref, "Operator notified");
        }
        NotificationResult::Skipped => {}
        NotificationResult::Failed(reason) => {
            tracing::warn!(
                kind = %kind,
                order_ref = ?order_ref,
                error = %reason,
                "Operator notification failed"
            );
        }
    }
}
