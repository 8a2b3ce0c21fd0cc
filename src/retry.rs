//! Retry lineage accounting.
//!
//! A retry is a fresh job whose `parent_id` names the first job of the
//! lineage. Every attempt points at that root, which keeps failure counting
//! to a single indexed lookup.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use tracing::{info, instrument};

use crate::error::QueueError;
use crate::job::{Job, JobId};
use crate::scheduler::{EnqueueRequest, Scheduler};
use crate::store::{JobFilter, JobStore};

/// Upper bound on the backoff exponent base, keeping delays representable.
const MAX_BACKOFF_FAILURES: u64 = 100;

/// Delay before the next attempt after `times_failed` failures: `n^4` seconds.
pub fn backoff(times_failed: u64) -> Duration {
    let n = times_failed.min(MAX_BACKOFF_FAILURES) as i64;
    Duration::seconds(n.pow(4))
}

/// Counts failures across a lineage and enqueues retries.
#[derive(Clone)]
pub struct RetryTracker {
    store: Arc<dyn JobStore>,
    scheduler: Scheduler,
}

impl RetryTracker {
    pub fn new(store: Arc<dyn JobStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    /// Number of failed jobs in `job`'s lineage, the root included.
    pub async fn times_failed(&self, job: &Job) -> Result<u64, QueueError> {
        let filter = JobFilter::all().lineage(job.lineage_root()).failed(true);
        Ok(self.store.count(&filter).await?)
    }

    /// Enqueue another attempt of a failed job.
    ///
    /// The new job reuses the target, action, arguments and priority, points
    /// at the lineage root, and waits [`backoff`] before becoming eligible.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn retry(&self, job: &Job) -> Result<JobId, QueueError> {
        if !job.is_failed() {
            return Err(QueueError::NotFailed(job.id));
        }

        let failures = self.times_failed(job).await?;
        let root = job.lineage_root();
        let delay = backoff(failures);

        let request = EnqueueRequest::new(job.target.clone(), job.action.clone())
            .args(job.arguments.clone())
            .priority(job.priority)
            .run_at(Utc::now() + delay)
            .parent(root);
        let id = self.scheduler.enqueue(request).await?;

        counter!("stevedore_jobs_retried_total").increment(1);
        info!(
            retry_id = %id,
            root_id = %root,
            times_failed = failures,
            delay_seconds = delay.num_seconds(),
            "Scheduled retry"
        );
        Ok(id)
    }
}
