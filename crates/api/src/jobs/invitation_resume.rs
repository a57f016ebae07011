//! Re-dispatches invitations whose background task did not survive.

use domain::services::InvitationPipeline;
use tracing::warn;

use super::scheduler::{Job, JobFrequency};

const RESUME_BATCH: i64 = 100;

pub struct StalledInvitationJob {
    invitations: InvitationPipeline,
    interval_minutes: u64,
}

impl StalledInvitationJob {
    pub fn new(invitations: InvitationPipeline, interval_minutes: u64) -> Self {
        Self {
            invitations,
            interval_minutes,
        }
    }
}

#[async_trait::async_trait]
impl Job for StalledInvitationJob {
    fn name(&self) -> &'static str {
        "stalled_invitation_resume"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_minutes)
    }

    async fn execute(&self) -> Result<(), String> {
        let resumed = self
            .invitations
            .resume_stalled(RESUME_BATCH)
            .await
            .map_err(|e| e.to_string())?;

        if resumed.report.failed > 0 {
            warn!(
                failed = resumed.report.failed,
                "Some stalled invitations could not be resumed"
            );
        }
        Ok(())
    }
}
