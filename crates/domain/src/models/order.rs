//! Order domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Payment status of an order as reported by the payment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Expired,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Maps a provider status word (`PAID`, `UNPAID`, `REFUND`, ...) to a
    /// payment status.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status.trim().to_uppercase().as_str() {
            "PAID" => Some(PaymentStatus::Paid),
            "UNPAID" => Some(PaymentStatus::Pending),
            "FAILED" => Some(PaymentStatus::Failed),
            "EXPIRED" => Some(PaymentStatus::Expired),
            "REFUND" | "REFUNDED" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    /// Statuses that close an order for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Statuses that take a seat away from the customer.
    pub fn revokes_access(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Expired | PaymentStatus::Refunded
        )
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "expired" => Ok(PaymentStatus::Expired),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(format!("Unknown payment status: {}", s)),
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of account delivery for a paid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Processing,
    AccountAssigned,
    Sent,
    PendingStock,
    AllocationFailed,
    ManualReviewRequired,
    /// The lease closed while the invitation was in flight.
    Cancelled,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Processing => "processing",
            InvitationStatus::AccountAssigned => "account_assigned",
            InvitationStatus::Sent => "sent",
            InvitationStatus::PendingStock => "pending_stock",
            InvitationStatus::AllocationFailed => "allocation_failed",
            InvitationStatus::ManualReviewRequired => "manual_review_required",
            InvitationStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for InvitationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(InvitationStatus::Pending),
            "processing" => Ok(InvitationStatus::Processing),
            "account_assigned" => Ok(InvitationStatus::AccountAssigned),
            "sent" => Ok(InvitationStatus::Sent),
            "pending_stock" => Ok(InvitationStatus::PendingStock),
            "allocation_failed" => Ok(InvitationStatus::AllocationFailed),
            "manual_review_required" => Ok(InvitationStatus::ManualReviewRequired),
            "cancelled" => Ok(InvitationStatus::Cancelled),
            _ => Err(format!("Unknown invitation status: {}", s)),
        }
    }
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order domain model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Merchant reference shared with the payment provider.
    pub order_ref: String,
    /// Provider transaction reference, known once the provider calls back.
    pub reference: Option<String>,
    pub customer_email: String,
    pub full_name: Option<String>,
    pub package_id: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub payment_status: PaymentStatus,
    pub invitation_status: InvitationStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub raw_callback: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Generates a merchant reference of the form `ORD-XXXXXXXXXXXX`.
    pub fn generate_ref() -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("ORD-{}", id[..12].to_uppercase())
    }
}

/// Filters for the admin order listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderFilter {
    pub payment_status: Option<PaymentStatus>,
    pub invitation_status: Option<InvitationStatus>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.payment_status.map_or(true, |s| order.payment_status == s)
            && self.invitation_status.map_or(true, |s| order.invitation_status == s)
    }
}

/// Data needed to insert an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_ref: String,
    pub customer_email: String,
    pub full_name: Option<String>,
    pub package_id: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A purchasable package: how much it costs and how long the seat lasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub duration_days: i64,
}

/// Request payload for creating an order.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(email(message = "A valid email address is required"))]
    pub customer_email: String,

    #[validate(length(max = 255, message = "Name must be at most 255 characters"))]
    pub full_name: Option<String>,

    #[validate(length(min = 1, max = 64, message = "Package is required"))]
    pub package_id: String,
}

/// Customer-facing order status.
#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusResponse {
    pub order_ref: String,
    pub package_id: String,
    pub amount: i64,
    pub payment_status: PaymentStatus,
    pub invitation_status: InvitationStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub lease_end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OrderStatusResponse {
    pub fn new(order: Order, lease_end_at: Option<DateTime<Utc>>) -> Self {
        Self {
            order_ref: order.order_ref,
            package_id: order.package_id,
            amount: order.amount,
            payment_status: order.payment_status,
            invitation_status: order.invitation_status,
            paid_at: order.paid_at,
            lease_end_at,
            created_at: order.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(PaymentStatus::from_provider("PAID"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentStatus::from_provider("UNPAID"), Some(PaymentStatus::Pending));
        assert_eq!(PaymentStatus::from_provider("FAILED"), Some(PaymentStatus::Failed));
        assert_eq!(PaymentStatus::from_provider("EXPIRED"), Some(PaymentStatus::Expired));
        assert_eq!(PaymentStatus::from_provider("REFUND"), Some(PaymentStatus::Refunded));
        assert_eq!(PaymentStatus::from_provider("paid"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentStatus::from_provider("CHARGEBACK"), None);
    }

    #[test]
    fn test_terminal_and_revoking_statuses() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Paid.is_terminal());
        assert!(!PaymentStatus::Paid.revokes_access());
        assert!(PaymentStatus::Refunded.revokes_access());
        assert!(PaymentStatus::Expired.revokes_access());
    }

    #[test]
    fn test_invitation_status_strings() {
        for status in [
            InvitationStatus::Pending,
            InvitationStatus::Processing,
            InvitationStatus::AccountAssigned,
            InvitationStatus::Sent,
            InvitationStatus::PendingStock,
            InvitationStatus::AllocationFailed,
            InvitationStatus::ManualReviewRequired,
            InvitationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<InvitationStatus>().unwrap(), status);
        }
        let json = serde_json::to_string(&InvitationStatus::ManualReviewRequired).unwrap();
        assert_eq!(json, "\"manual_review_required\"");
    }

    #[test]
    fn test_generate_ref_format() {
        let order_ref = Order::generate_ref();
        assert!(order_ref.starts_with("ORD-"));
        assert_eq!(order_ref.len(), 16);
        assert_ne!(order_ref, Order::generate_ref());
    }

    #[test]
    fn test_create_order_request_validation() {
        let ok = CreateOrderRequest {
            customer_email: "buyer@example.com".to_string(),
            full_name: Some("Buyer".to_string()),
            package_id: "1_month".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad = CreateOrderRequest {
            customer_email: "nope".to_string(),
            full_name: None,
            package_id: String::new(),
        };
        let errors = bad.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("customer_email"));
        assert!(errors.field_errors().contains_key("package_id"));
    }
}
