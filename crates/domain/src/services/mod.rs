//! Domain services for the seat lease backend.
//!
//! Services contain business logic that operates on domain models through
//! the [`crate::store`] seam.

pub mod allocator;
pub mod audit;
pub mod invitation;
pub mod notification;
pub mod orders;
pub mod reconciler;
pub mod sweeper;

pub use allocator::{AllocationError, Allocator, ADMIN_RELEASED_REASON, ADMIN_REVOKED_REASON, EXPIRED_REASON};
pub use audit::{audit_helpers, AuditEntryBuilder};
pub use invitation::{
    InvitationPipeline, InviteError, InviteExecutor, InviteRequest, NoopInviteExecutor, ResendError,
    ResentInvitation, ResumeReport, ResumedInvitations, RetryPolicy,
};
pub use notification::{
    notify_operator, LogNotifier, NotificationKind, NotificationResult, OperatorNotification,
    OperatorNotifier, RecordingNotifier,
};
pub use orders::{OrderError, OrderService, PackageCatalog};
pub use reconciler::{
    CallbackOutcome, PaymentCallback, PaymentEffect, PaymentReconciler, ReconcileError, StockRetryReport,
    PAYMENT_STATUS_EVENT,
};
pub use sweeper::{ExpirySweeper, SweepError, SweepReport};
