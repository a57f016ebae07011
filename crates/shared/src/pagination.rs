//! Offset pagination utilities for admin listings.

use serde::Serialize;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PER_PAGE: u32 = 20;

/// Upper bound on page size.
pub const MAX_PER_PAGE: u32 = 100;

/// A normalized page request (1-based page number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    /// Normalizes optional query values: page defaults to 1, per_page is
    /// clamped to `1..=MAX_PER_PAGE`.
    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.per_page as i64
    }

    /// Row limit.
    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Pagination info returned alongside list responses.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageInfo {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub total_pages: u32,
}

impl PageInfo {
    pub fn new(request: PageRequest, total: i64) -> Self {
        let per_page = request.per_page as i64;
        let total_pages = if total <= 0 {
            0
        } else {
            ((total + per_page - 1) / per_page) as u32
        };
        Self {
            page: request.page,
            per_page: request.per_page,
            total,
            total_pages,
        }
    }
}
