//! # Job Executor
//!
//! Drives a single job through `pending -> running -> completed | failed`.
//! The claim is a conditional update on `started_at`, so when several workers
//! race on the same job exactly one of them runs it. A running snapshot is
//! only taken over once its claim is stale.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use crate::error::QueueError;
use crate::job::Job;
use crate::registry::{InvocationError, Registry, RegistryError};
use crate::settings::{self, QueueSettings};
use crate::store::{Expected, JobChanges, JobStore};

/// Result of [`Executor::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The handler returned a value
    Completed(JsonValue),
    /// Resolution or invocation failed; the message is stored on the job
    Failed(String),
    /// Another worker claimed the job first
    Skipped,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum JobFailure {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler was cancelled")]
    Cancelled,
}

/// Runs claimed jobs against a handler registry.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    settings: Option<QueueSettings>,
}

impl Executor {
    /// Executor reading the process-wide settings on every call.
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            settings: None,
        }
    }

    /// Executor pinned to explicit settings.
    pub fn with_settings(
        store: Arc<dyn JobStore>,
        registry: Arc<Registry>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings: Some(settings),
        }
    }

    fn settings(&self) -> QueueSettings {
        self.settings.clone().unwrap_or_else(settings::current)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Claim and perform `job`, recording the outcome.
    ///
    /// Handler failures are stored on the job and reported as
    /// [`RunOutcome::Failed`]; only storage errors are returned as `Err`.
    #[instrument(skip(self, job), fields(job_id = %job.id, target = %job.target, action = %job.action))]
    pub async fn run(&self, job: &Job) -> Result<RunOutcome, QueueError> {
        let claimed_at = Utc::now();

        // A running snapshot may only be taken over once its claim is stale.
        if let Some(previous) = job.started_at {
            let stale = self
                .settings()
                .stale_before(claimed_at)
                .is_some_and(|cutoff| previous < cutoff);
            if !stale {
                debug!(previous_claim = %previous, "Job is held by a live claim");
                counter!("stevedore_jobs_skipped_total").increment(1);
                return Ok(RunOutcome::Skipped);
            }
        }

        let claimed = self
            .store
            .conditional_update_fields(
                job.id,
                &Expected {
                    started_at: job.started_at,
                },
                &JobChanges::started(claimed_at),
            )
            .await?;

        if !claimed {
            debug!("Job already claimed by another worker");
            counter!("stevedore_jobs_skipped_total").increment(1);
            return Ok(RunOutcome::Skipped);
        }
        if job.started_at.is_some() {
            warn!(previous_claim = ?job.started_at, "Reclaimed stale job");
        }

        let timer = Instant::now();
        let result = self.invoke(job).await;
        let labels = vec![("target", job.target.clone()), ("action", job.action.clone())];
        histogram!("stevedore_job_duration_seconds", &labels).record(timer.elapsed().as_secs_f64());

        let finished_at = Utc::now();
        let mine = Expected::claimed_at(claimed_at);

        match result {
            Ok(value) => {
                if self.settings().keep.keep() {
                    let encoded = serde_json::to_string(&value)?;
                    let written = self
                        .store
                        .conditional_update_fields(
                            job.id,
                            &mine,
                            &JobChanges::completed(finished_at, Some(encoded)),
                        )
                        .await?;
                    if !written {
                        warn!("Claim was taken over before completion could be recorded");
                    }
                } else if !self.store.conditional_delete(job.id, &mine).await? {
                    warn!("Claim was taken over before the finished job could be removed");
                }

                counter!("stevedore_jobs_completed_total", &labels).increment(1);
                info!(elapsed_ms = timer.elapsed().as_millis() as u64, "Job completed");
                Ok(RunOutcome::Completed(value))
            }
            Err(failure) => {
                let message = failure.to_string();
                let written = self
                    .store
                    .conditional_update_fields(
                        job.id,
                        &mine,
                        &JobChanges::failed(finished_at, message.clone()),
                    )
                    .await?;
                if !written {
                    warn!("Claim was taken over before failure could be recorded");
                }

                counter!("stevedore_jobs_failed_total", &labels).increment(1);
                warn!(error = %message, "Job failed");
                Ok(RunOutcome::Failed(message))
            }
        }
    }

    async fn invoke(&self, job: &Job) -> Result<JsonValue, JobFailure> {
        let handler = self.registry.resolve(&job.target, &job.action)?;
        let arguments = job.arguments.clone();

        // Run on its own task so a panicking handler fails the job instead of
        // the worker.
        let task = tokio::spawn(async move { handler.invoke(&arguments).await });
        match task.await {
            Ok(result) => Ok(result?),
            Err(err) if err.is_panic() => Err(JobFailure::Panicked(panic_message(err.into_panic()))),
            Err(_) => Err(JobFailure::Cancelled),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
