//! Periodic cleanup of overdue leases and abandoned orders.

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;

use crate::models::CleanupReport;
use crate::services::allocator::{AllocationError, Allocator};
use crate::services::orders::{OrderError, OrderService};

/// Pending orders older than this are expired.
pub const DEFAULT_PENDING_ORDER_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Orders(#[from] OrderError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub leases: CleanupReport,
    pub orders_expired: usize,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    allocator: Allocator,
    orders: OrderService,
    pending_order_ttl: Duration,
}

impl ExpirySweeper {
    pub fn new(allocator: Allocator, orders: OrderService, pending_order_ttl: Duration) -> Self {
        Self {
            allocator,
            orders,
            pending_order_ttl,
        }
    }

    /// Releases expired leases, then expires stale pending orders.
    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        let leases = self.allocator.cleanup_expired_assignments().await?;
        let orders_expired = self.orders.expire_stale_orders(self.pending_order_ttl).await?;
        Ok(SweepReport {
            leases,
            orders_expired,
        })
    }
}
