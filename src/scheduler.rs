//! # Scheduler
//!
//! Producer-facing side of the queue: persists new jobs and selects the next
//! batch of eligible jobs in queue order. Selection is a plain read; a job is
//! only taken out of the pending set when the executor claims it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, info, instrument};

use crate::error::QueueError;
use crate::job::{Job, JobId};
use crate::settings::{self, QueueSettings};
use crate::store::{JobFilter, JobOrder, JobStore};
use crate::value::Argument;

/// Parameters for a new job.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub target: String,
    pub action: String,
    pub arguments: Vec<Argument>,
    pub priority: i32,
    pub run_at: Option<DateTime<Utc>>,
    pub(crate) parent_id: Option<JobId>,
}

impl EnqueueRequest {
    pub fn new(target: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            action: action.into(),
            arguments: Vec::new(),
            priority: 0,
            run_at: None,
            parent_id: None,
        }
    }

    /// Append one positional argument.
    pub fn arg(mut self, argument: impl Into<Argument>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Replace the argument list.
    pub fn args(mut self, arguments: Vec<Argument>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Do not run before `at`.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Do not run before `delay` has elapsed from now.
    ///
    /// Delays past the end of representable time saturate to it.
    pub fn delay(mut self, delay: Duration) -> Self {
        let now = Utc::now();
        self.run_at = Some(now.checked_add_signed(delay).unwrap_or(if delay < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        }));
        self
    }

    pub(crate) fn parent(mut self, root: JobId) -> Self {
        self.parent_id = Some(root);
        self
    }

    fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            priority: self.priority,
            parent_id: self.parent_id,
            created_at: now,
            run_at: self.run_at.unwrap_or(now),
            ..Job::new(self.target, self.action, self.arguments)
        }
    }
}

/// Enqueues jobs and selects eligible batches.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    settings: Option<QueueSettings>,
}

impl Scheduler {
    /// Scheduler reading the process-wide settings on every call.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            settings: None,
        }
    }

    /// Scheduler pinned to explicit settings.
    pub fn with_settings(store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self {
            store,
            settings: Some(settings),
        }
    }

    fn settings(&self) -> QueueSettings {
        self.settings.clone().unwrap_or_else(settings::current)
    }

    /// Batch size used by [`Scheduler::next_default`].
    pub fn configured_limit(&self) -> u64 {
        self.settings().job_limit
    }

    /// Persist a new pending job.
    ///
    /// The target and action are not checked here; an unknown pair surfaces
    /// as a failed job when it is run.
    #[instrument(skip(self, request), fields(target = %request.target, action = %request.action))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let job = request.into_job(Utc::now());
        let run_at = job.run_at;
        let priority = job.priority;
        let parent_id = job.parent_id;

        let id = self.store.insert(job).await?;

        counter!("stevedore_jobs_enqueued_total").increment(1);
        info!(
            job_id = %id,
            priority,
            run_at = %run_at,
            parent_id = ?parent_id.map(|p| p.to_string()),
            "Job enqueued"
        );
        Ok(id)
    }

    /// Up to `limit` eligible jobs, highest priority first, oldest first within
    /// a priority.
    pub async fn next(&self, limit: u64) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let filter = JobFilter::eligible(now, self.settings().stale_before(now));
        let jobs = self
            .store
            .find_many(&filter, JobOrder::Queue, Some(limit))
            .await?;

        debug!(limit, selected = jobs.len(), "Selected eligible jobs");
        Ok(jobs)
    }

    /// [`Scheduler::next`] with the configured limit.
    pub async fn next_default(&self) -> Result<Vec<Job>, QueueError> {
        self.next(self.configured_limit()).await
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}
