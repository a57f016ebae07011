//! Outbound integrations: the invite automation service and the operator
//! webhook.

pub mod invite_executor;
pub mod operator_webhook;

pub use invite_executor::HttpInviteExecutor;
pub use operator_webhook::WebhookNotifier;
