//! Lease expiry background job.

use domain::services::{ExpirySweeper, EXPIRED_REASON};
use tracing::info;

use super::scheduler::{Job, JobFrequency};
use crate::middleware::metrics::record_leases_released;

/// Releases overdue leases and expires abandoned orders.
pub struct LeaseExpiryJob {
    sweeper: ExpirySweeper,
    interval_minutes: u64,
}

impl LeaseExpiryJob {
    pub fn new(sweeper: ExpirySweeper, interval_minutes: u64) -> Self {
        Self {
            sweeper,
            interval_minutes,
        }
    }
}

#[async_trait::async_trait]
impl Job for LeaseExpiryJob {
    fn name(&self) -> &'static str {
        "lease_expiry"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_minutes)
    }

    async fn execute(&self) -> Result<(), String> {
        let report = self.sweeper.run_once().await.map_err(|e| e.to_string())?;
        record_leases_released(EXPIRED_REASON, report.leases.released);

        if report.leases.found > 0 || report.orders_expired > 0 {
            info!(
                leases_found = report.leases.found,
                leases_released = report.leases.released,
                leases_failed = report.leases.failed,
                orders_expired = report.orders_expired,
                "Expiry sweep finished"
            );
        }

        if report.leases.failed > 0 {
            return Err(format!(
                "{} of {} expired leases could not be released",
                report.leases.failed, report.leases.found
            ));
        }
        Ok(())
    }
}
