//! Retries seat assignment for paid orders waiting on stock.

use domain::services::PaymentReconciler;
use tracing::info;

use super::scheduler::{Job, JobFrequency};
use crate::middleware::metrics::record_lease_assigned;

pub struct PendingStockRetryJob {
    reconciler: PaymentReconciler,
    interval_minutes: u64,
}

impl PendingStockRetryJob {
    pub fn new(reconciler: PaymentReconciler, interval_minutes: u64) -> Self {
        Self {
            reconciler,
            interval_minutes,
        }
    }
}

#[async_trait::async_trait]
impl Job for PendingStockRetryJob {
    fn name(&self) -> &'static str {
        "pending_stock_retry"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_minutes)
    }

    async fn execute(&self) -> Result<(), String> {
        let report = self
            .reconciler
            .retry_pending_stock()
            .await
            .map_err(|e| e.to_string())?;

        for _ in 0..report.assigned {
            record_lease_assigned();
        }
        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                assigned = report.assigned,
                failed = report.failed,
                "Pending stock retry finished"
            );
        }
        Ok(())
    }
}
