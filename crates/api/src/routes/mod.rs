//! HTTP route handlers.

pub mod admin_accounts;
pub mod admin_leases;
pub mod admin_orders;
pub mod admin_operations;
pub mod audit_logs;
pub mod health;
pub mod orders;
pub mod packages;
pub mod payments;
