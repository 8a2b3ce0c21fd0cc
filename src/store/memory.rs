//! Process-local job store.
//!
//! Keeps records in insertion order behind a single lock, so every conditional
//! update is atomic with respect to other callers in the same process.
//! Arguments are checked with the same encoder the durable adapter uses.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Expected, JobChanges, JobFilter, JobOrder, JobStore, StoreError};
use crate::job::{Job, JobId};
use crate::value::encode_arguments;

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<Vec<Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, regardless of state.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, StoreError> {
        encode_arguments(&job.arguments)
            .map_err(|e| StoreError::Encoding(format!("job {}: {e}", job.id)))?;

        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|existing| existing.id == job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.push(job);
        Ok(id)
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn find_many(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: Option<u64>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs.iter().filter(|job| filter.matches(job)).cloned().collect();

        // Stable sorts keep insertion order for ties.
        match order {
            JobOrder::Queue => matched.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            }),
            JobOrder::Oldest => matched.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }

        if let Some(limit) = limit {
            matched.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(matched)
    }

    async fn update_fields(&self, id: JobId, changes: &JobChanges) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::NotFound(id))?;
        changes.apply(job);
        Ok(())
    }

    async fn conditional_update_fields(
        &self,
        id: JobId,
        expected: &Expected,
        changes: &JobChanges,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.iter_mut().find(|job| job.id == id) {
            Some(job) if expected.holds_for(job) => {
                changes.apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        if jobs.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn conditional_delete(&self, id: JobId, expected: &Expected) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.iter().position(|job| job.id == id && expected.holds_for(job)) {
            Some(index) => {
                jobs.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().filter(|job| filter.matches(job)).count() as u64)
    }
}
