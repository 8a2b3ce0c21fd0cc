//! # Worker
//!
//! Polling loop that pulls eligible jobs from the scheduler and runs them with
//! bounded concurrency. Failed jobs are optionally retried up to a lineage-wide
//! attempt limit, and the retention policy is applied on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use metrics::{gauge, histogram};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::QueueError;
use crate::executor::{Executor, RunOutcome};
use crate::job::Job;
use crate::registry::Registry;
use crate::retention::Retention;
use crate::retry::RetryTracker;
use crate::scheduler::Scheduler;
use crate::settings::QueueSettings;
use crate::store::JobStore;

/// Configuration for the worker loop
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is idle
    pub poll_interval: Duration,
    /// Maximum number of jobs running at once
    pub concurrency: usize,
    /// Jobs selected per poll; `None` uses the configured job limit
    pub batch_size: Option<u64>,
    /// Total attempts per lineage before a failure is left alone; `None` disables retries
    pub max_attempts: Option<u32>,
    /// How often completed jobs are purged; `None` disables cleanup
    pub cleanup_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            concurrency: 4,
            batch_size: None,
            max_attempts: None,
            cleanup_interval: Some(Duration::from_secs(300)),
        }
    }
}

/// Counts from a single poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    /// Jobs returned by the scheduler
    pub selected: u64,
    /// Jobs this worker won the claim for
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Jobs another worker claimed first
    pub skipped: u64,
    /// Retries enqueued for failed jobs
    pub retried: u64,
    /// Jobs whose run hit a storage error
    pub errors: u64,
}

impl TickReport {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed(_) => {
                self.claimed += 1;
                self.completed += 1;
            }
            RunOutcome::Failed(_) => {
                self.claimed += 1;
                self.failed += 1;
            }
            RunOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Background worker executing queued jobs
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    scheduler: Scheduler,
    executor: Executor,
    retries: RetryTracker,
    retention: Retention,
    config: WorkerConfig,
}

impl Worker {
    /// Worker reading the process-wide queue settings.
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<Registry>, config: WorkerConfig) -> Self {
        let scheduler = Scheduler::new(store.clone());
        Self {
            executor: Executor::new(store.clone(), registry),
            retries: RetryTracker::new(store.clone(), scheduler.clone()),
            retention: Retention::new(store.clone()),
            scheduler,
            store,
            config,
        }
    }

    /// Worker pinned to explicit queue settings.
    pub fn with_settings(
        store: Arc<dyn JobStore>,
        registry: Arc<Registry>,
        config: WorkerConfig,
        settings: QueueSettings,
    ) -> Self {
        let scheduler = Scheduler::with_settings(store.clone(), settings.clone());
        Self {
            executor: Executor::with_settings(store.clone(), registry, settings.clone()),
            retries: RetryTracker::new(store.clone(), scheduler.clone()),
            retention: Retention::with_settings(store.clone(), settings),
            scheduler,
            store,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` fires. Jobs already in flight are allowed to finish.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), QueueError> {
        info!(config = ?self.config, "Starting worker");
        let mut last_cleanup = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Some(interval) = self.config.cleanup_interval
                && last_cleanup.elapsed() >= interval
            {
                last_cleanup = Instant::now();
                if let Err(err) = self.retention.cleanup().await {
                    error!(error = ?err, code = err.code(), "Retention cleanup failed");
                }
            }

            let tick_started = Instant::now();
            let idle = match self.tick().await {
                Ok(report) => {
                    histogram!("stevedore_worker_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                    report.selected == 0
                }
                Err(err) => {
                    error!(error = ?err, code = err.code(), "Worker tick failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(self.idle_delay()) => {}
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Poll interval plus up to 10% jitter so idle workers drift apart.
    fn idle_delay(&self) -> Duration {
        let base = self.config.poll_interval;
        let max_jitter = (base.as_millis() as u64) / 10;
        if max_jitter == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }

    /// Select one batch and run it to completion.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        let jobs = match self.config.batch_size {
            Some(limit) => self.scheduler.next(limit).await?,
            None => self.scheduler.next_default().await?,
        };

        let mut report = TickReport {
            selected: jobs.len() as u64,
            ..TickReport::default()
        };
        if jobs.is_empty() {
            debug!("No eligible jobs");
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        gauge!("stevedore_worker_batch_size").set(jobs.len() as f64);

        for job in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.run_one(job).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((outcome, retried))) => {
                    report.record(&outcome);
                    if retried {
                        report.retried += 1;
                    }
                }
                Ok(Err(err)) => {
                    report.errors += 1;
                    error!(error = ?err, code = err.code(), "Job run failed");
                }
                Err(err) => {
                    report.errors += 1;
                    error!(error = ?err, "Job task aborted");
                }
            }
        }

        info!(
            selected = report.selected,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            retried = report.retried,
            errors = report.errors,
            "Worker tick finished"
        );
        Ok(report)
    }

    async fn run_one(&self, job: Job) -> Result<(RunOutcome, bool), QueueError> {
        let outcome = self.executor.run(&job).await?;
        debug!(job_id = %job.id, outcome = outcome.label(), "Job run finished");

        let retried = match (&outcome, self.config.max_attempts) {
            (RunOutcome::Failed(_), Some(max_attempts)) => self.maybe_retry(&job, max_attempts).await?,
            _ => false,
        };
        Ok((outcome, retried))
    }

    async fn maybe_retry(&self, job: &Job, max_attempts: u32) -> Result<bool, QueueError> {
        let Some(failed) = self.store.find(job.id).await? else {
            warn!(job_id = %job.id, "Failed job disappeared before it could be retried");
            return Ok(false);
        };
        if !failed.is_failed() {
            return Ok(false);
        }

        let times_failed = self.retries.times_failed(&failed).await?;
        if times_failed >= u64::from(max_attempts) {
            info!(
                job_id = %job.id,
                times_failed,
                max_attempts,
                "Retry limit reached; leaving job failed"
            );
            return Ok(false);
        }

        self.retries.retry(&failed).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InvocationError, handler_fn};
    use crate::retention::Keep;
    use crate::scheduler::EnqueueRequest;
    use crate::store::{InMemoryJobStore, JobFilter};
    use crate::value::Argument;
    use serde_json::Value as JsonValue;

    fn registry() -> Arc<Registry> {
        let registry = Registry::new()
            .with(
                "Box",
                "ok",
                handler_fn(|_args: Vec<Argument>| async move { Ok::<_, InvocationError>(JsonValue::Null) }),
            )
            .unwrap()
            .with(
                "Box",
                "fail",
                handler_fn(|_args: Vec<Argument>| async move {
                    Err::<JsonValue, _>(InvocationError::new("lid stuck"))
                }),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn settings(keep: Keep) -> QueueSettings {
        QueueSettings {
            keep,
            ..QueueSettings::default()
        }
    }

    #[tokio::test]
    async fn tick_runs_batch_and_reports() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = Worker::with_settings(
            store.clone(),
            registry(),
            WorkerConfig::default(),
            settings(Keep::Always),
        );
        let scheduler = Scheduler::with_settings(store.clone(), settings(Keep::Always));
        scheduler.enqueue(EnqueueRequest::new("Box", "ok")).await.unwrap();
        scheduler.enqueue(EnqueueRequest::new("Box", "ok")).await.unwrap();
        scheduler.enqueue(EnqueueRequest::new("Box", "fail")).await.unwrap();

        let report = worker.tick().await.unwrap();
        assert_eq!(report.selected, 3);
        assert_eq!(report.claimed, 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);

        let again = worker.tick().await.unwrap();
        assert_eq!(again, TickReport::default());
    }

    #[tokio::test]
    async fn failures_are_retried_until_attempt_limit() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = Worker::with_settings(
            store.clone(),
            registry(),
            WorkerConfig {
                max_attempts: Some(2),
                ..WorkerConfig::default()
            },
            settings(Keep::Never),
        );
        let root = Scheduler::with_settings(store.clone(), settings(Keep::Never))
            .enqueue(EnqueueRequest::new("Box", "fail"))
            .await
            .unwrap();

        let report = worker.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 1);

        // First retry waits one second of backoff.
        let retry = store
            .find_many(&JobFilter::all().failed(false), Default::default(), None)
            .await
            .unwrap()
            .pop()
            .expect("retry enqueued");
        assert_eq!(retry.parent_id, Some(root));
        assert!(retry.run_at > retry.created_at);

        let mut due = retry.clone();
        due.run_at = chrono::Utc::now();
        let outcome = worker.run_one(due).await.unwrap();
        assert!(matches!(outcome.0, RunOutcome::Failed(_)));
        assert!(!outcome.1, "second failure reaches the limit of two attempts");

        let lineage_failures = store
            .count(&JobFilter::all().lineage(root).failed(true))
            .await
            .unwrap();
        assert_eq!(lineage_failures, 2);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = Worker::with_settings(
            store,
            registry(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
            settings(Keep::Never),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop promptly")
            .expect("worker task should not panic");
        assert!(result.is_ok());
    }
}
