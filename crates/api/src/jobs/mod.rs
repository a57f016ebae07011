//! Background job scheduler and job implementations.

mod invitation_resume;
mod lease_expiry;
mod scheduler;
mod stock_retry;

pub use invitation_resume::StalledInvitationJob;
pub use lease_expiry::LeaseExpiryJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};
pub use stock_retry::PendingStockRetryJob;
