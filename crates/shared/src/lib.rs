//! Shared utilities and common types for the seat lease backend.
//!
//! This crate provides common functionality used across all other crates:
//! - Cryptographic utilities (hashing, callback signatures)
//! - Offset pagination helpers
//! - Common validation logic

pub mod crypto;
pub mod pagination;
pub mod validation;
