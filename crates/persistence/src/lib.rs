//! Persistence layer for the seat lease backend.
//!
//! This crate contains:
//! - Database connection management and schema migrations
//! - Entity definitions (database row mappings)
//! - Query functions per table
//! - [`store::PgAllocationStore`], the PostgreSQL implementation of the
//!   domain storage traits

pub mod db;
pub mod entities;
pub mod metrics;
pub mod repositories;
pub mod store;

pub use store::PgAllocationStore;
