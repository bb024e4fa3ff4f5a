//! Background refresh jobs.

mod manager;
mod queue;

pub use manager::{FailedJob, JobError, JobManager, JobOutcome, JobSettings, JobStats};
pub use queue::{Rejection, SyncJob};
