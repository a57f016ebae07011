//! Domain layer for the seat lease backend.
//!
//! This crate contains:
//! - Domain models (pool accounts, leases, orders, audit entries)
//! - The store abstraction (unit of work) and an in-memory implementation
//! - Business logic services (allocator, payment reconciler, invitation
//!   pipeline, expiry sweeper)

pub mod clock;
pub mod models;
pub mod services;
pub mod store;
