//! Storage port for jobs.
//!
//! The engine talks to persistence only through [`JobStore`]. Two adapters ship
//! with the crate: [`InMemoryJobStore`] for tests and single-process use, and
//! [`crate::repositories::JobRepository`] backed by SeaORM.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobId};

pub mod memory;

pub use memory::InMemoryJobStore;

/// Storage error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("failed to encode job record: {0}")]
    Encoding(String),
}

/// How `started_at` must look for a claimable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimWindow {
    /// Only jobs that have never been claimed
    Unclaimed,
    /// Unclaimed jobs, plus running jobs claimed before the cutoff
    StaleBefore(DateTime<Utc>),
}

/// Conjunction of optional predicates over job records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// `id == root OR parent_id == root`
    pub lineage: Option<JobId>,
    pub completed: Option<bool>,
    pub failed: Option<bool>,
    /// Claimed at some point, regardless of outcome
    pub started: Option<bool>,
    pub run_at_or_before: Option<DateTime<Utc>>,
    /// `completed_at < t`
    pub completed_before: Option<DateTime<Utc>>,
    pub claimable: Option<ClaimWindow>,
}

impl JobFilter {
    /// Matches every job.
    pub fn all() -> Self {
        Self::default()
    }

    /// Jobs that may be selected for execution at `now`.
    pub fn eligible(now: DateTime<Utc>, stale_before: Option<DateTime<Utc>>) -> Self {
        Self::default()
            .completed(false)
            .failed(false)
            .run_at_or_before(now)
            .claimable(match stale_before {
                Some(cutoff) => ClaimWindow::StaleBefore(cutoff),
                None => ClaimWindow::Unclaimed,
            })
    }

    pub fn lineage(mut self, root: JobId) -> Self {
        self.lineage = Some(root);
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn failed(mut self, failed: bool) -> Self {
        self.failed = Some(failed);
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.started = Some(started);
        self
    }

    pub fn run_at_or_before(mut self, at: DateTime<Utc>) -> Self {
        self.run_at_or_before = Some(at);
        self
    }

    pub fn completed_before(mut self, at: DateTime<Utc>) -> Self {
        self.completed_before = Some(at);
        self
    }

    pub fn claimable(mut self, window: ClaimWindow) -> Self {
        self.claimable = Some(window);
        self
    }

    /// Evaluate the filter against a single record.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(root) = self.lineage
            && job.id != root
            && job.parent_id != Some(root)
        {
            return false;
        }
        if let Some(completed) = self.completed
            && job.is_completed() != completed
        {
            return false;
        }
        if let Some(failed) = self.failed
            && job.is_failed() != failed
        {
            return false;
        }
        if let Some(started) = self.started
            && job.started_at.is_some() != started
        {
            return false;
        }
        if let Some(at) = self.run_at_or_before
            && job.run_at > at
        {
            return false;
        }
        if let Some(at) = self.completed_before {
            match job.completed_at {
                Some(completed_at) if completed_at < at => {}
                _ => return false,
            }
        }
        match (self.claimable, job.started_at) {
            (None, _) | (Some(_), None) => true,
            (Some(ClaimWindow::Unclaimed), Some(_)) => false,
            (Some(ClaimWindow::StaleBefore(cutoff)), Some(started)) => started < cutoff,
        }
    }
}

/// Result ordering for [`JobStore::find_many`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobOrder {
    /// Priority descending, then created_at ascending
    #[default]
    Queue,
    /// created_at ascending
    Oldest,
}

/// Fields written by an update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobChanges {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub return_value: Option<String>,
    pub exception_message: Option<String>,
}

impl JobChanges {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn completed(at: DateTime<Utc>, return_value: Option<String>) -> Self {
        Self {
            completed_at: Some(at),
            return_value,
            ..Default::default()
        }
    }

    pub fn failed(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            failed_at: Some(at),
            exception_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Apply the changes to an in-memory record.
    pub fn apply(&self, job: &mut Job) {
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            job.failed_at = Some(at);
        }
        if let Some(value) = &self.return_value {
            job.return_value = Some(value.clone());
        }
        if let Some(message) = &self.exception_message {
            job.exception_message = Some(message.clone());
        }
    }
}

/// Expected current state for a conditional update.
///
/// The update applies only when the job is unfinished and its `started_at`
/// holds exactly `started_at` (`None` meaning never claimed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub started_at: Option<DateTime<Utc>>,
}

impl Expected {
    pub fn unclaimed() -> Self {
        Self { started_at: None }
    }

    pub fn claimed_at(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
        }
    }

    pub fn holds_for(&self, job: &Job) -> bool {
        !job.has_ran() && job.started_at == self.started_at
    }
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: Job) -> Result<JobId, StoreError>;

    /// Get a job by ID.
    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// List jobs matching `filter` in `order`, at most `limit` of them.
    async fn find_many(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: Option<u64>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Write fields unconditionally.
    async fn update_fields(&self, id: JobId, changes: &JobChanges) -> Result<(), StoreError>;

    /// Atomically write fields if the job still matches `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn conditional_update_fields(
        &self,
        id: JobId,
        expected: &Expected,
        changes: &JobChanges,
    ) -> Result<bool, StoreError>;

    /// Delete a single job.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Atomically delete a job if it still matches `expected`.
    ///
    /// Returns `false` when the job changed hands or no longer exists.
    async fn conditional_delete(&self, id: JobId, expected: &Expected) -> Result<bool, StoreError>;

    /// Delete every job matching `filter`, returning how many were removed.
    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError>;

    /// Count jobs matching `filter`.
    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError>;
}

/// Job counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub async fn collect(store: &dyn JobStore) -> Result<Self, StoreError> {
        let unfinished = JobFilter::all().completed(false).failed(false);
        Ok(Self {
            pending: store.count(&unfinished.clone().started(false)).await?,
            running: store.count(&unfinished.started(true)).await?,
            completed: store.count(&JobFilter::all().completed(true)).await?,
            failed: store.count(&JobFilter::all().failed(true)).await?,
        })
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for std::sync::Arc<S> {
    async fn insert(&self, job: Job) -> Result<JobId, StoreError> {
        (**self).insert(job).await
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).find(id).await
    }

    async fn find_many(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: Option<u64>,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).find_many(filter, order, limit).await
    }

    async fn update_fields(&self, id: JobId, changes: &JobChanges) -> Result<(), StoreError> {
        (**self).update_fields(id, changes).await
    }

    async fn conditional_update_fields(
        &self,
        id: JobId,
        expected: &Expected,
        changes: &JobChanges,
    ) -> Result<bool, StoreError> {
        (**self).conditional_update_fields(id, expected, changes).await
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete(id).await
    }

    async fn conditional_delete(&self, id: JobId, expected: &Expected) -> Result<bool, StoreError> {
        (**self).conditional_delete(id, expected).await
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        (**self).delete_many(filter).await
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        (**self).count(filter).await
    }
}
