//! Competing workers and executors must never run a job twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value as JsonValue;
use stevedore::store::{Expected, JobChanges, JobFilter};
use stevedore::{
    Argument, EnqueueRequest, Executor, InMemoryJobStore, InvocationError, JobId, JobStore, Keep,
    QueueSettings, Registry, RunOutcome, Scheduler, Worker, WorkerConfig, handler_fn,
};
use tokio::sync::Notify;
use tokio::task::JoinSet;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{pending_job, settings_with_keep, setup_repository, test_registry};

async fn adapters() -> Result<Vec<(&'static str, Arc<dyn JobStore>)>> {
    Ok(vec![
        ("memory", Arc::new(InMemoryJobStore::new()) as Arc<dyn JobStore>),
        ("sea-orm", setup_repository().await? as Arc<dyn JobStore>),
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_of_one_job_claim_it_once() -> Result<()> {
    for (name, store) in adapters().await? {
        let settings = settings_with_keep(Keep::Always);
        let (registry, calls) = test_registry();
        let executor = Executor::with_settings(store.clone(), registry, settings.clone());

        let id = Scheduler::with_settings(store.clone(), settings)
            .enqueue(EnqueueRequest::new("Crate", "ok"))
            .await?;
        let job = store.find(id).await?.expect("enqueued");

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let executor = executor.clone();
            let job = job.clone();
            tasks.spawn(async move { executor.run(&job).await });
        }

        let mut completed = 0;
        let mut skipped = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined?? {
                RunOutcome::Completed(_) => completed += 1,
                RunOutcome::Skipped => skipped += 1,
                other => panic!("{name}: unexpected outcome {other:?}"),
            }
        }

        assert_eq!(completed, 1, "{name}");
        assert_eq!(skipped, 7, "{name}");
        assert_eq!(calls.ok(), 1, "{name}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_claim_is_reclaimed_by_exactly_one_worker() -> Result<()> {
    for (name, store) in adapters().await? {
        let settings = settings_with_keep(Keep::Always);
        let (registry, calls) = test_registry();

        // Claimed two hours ago by a worker that never reported back.
        let mut abandoned = pending_job("ok", 0, Utc::now() - Duration::hours(3));
        abandoned.started_at = Some(Utc::now() - Duration::hours(2));
        let id = store.insert(abandoned).await?;

        let first = Scheduler::with_settings(store.clone(), settings.clone()).next(10).await?;
        let second = Scheduler::with_settings(store.clone(), settings.clone()).next(10).await?;
        assert_eq!(first.len(), 1, "{name}");
        assert_eq!(second.len(), 1, "{name}");

        let executor = Executor::with_settings(store.clone(), registry, settings.clone());
        let (a, b) = tokio::join!(executor.run(&first[0]), executor.run(&second[0]));
        let outcomes = [a?, b?];

        let completed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, RunOutcome::Completed(_)))
            .count();
        assert_eq!(completed, 1, "{name}");
        assert!(outcomes.contains(&RunOutcome::Skipped), "{name}");
        assert_eq!(calls.ok(), 1, "{name}");

        let stored = store.find(id).await?.expect("kept");
        assert!(stored.is_completed(), "{name}");
        assert!(
            Scheduler::with_settings(store.clone(), settings).next(10).await?.is_empty(),
            "{name}"
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_workers_share_a_batch_without_double_runs() -> Result<()> {
    for (name, store) in adapters().await? {
        let settings = settings_with_keep(Keep::Always);
        let (registry, calls) = test_registry();
        let scheduler = Scheduler::with_settings(store.clone(), settings.clone());

        for priority in 0..20 {
            scheduler
                .enqueue(EnqueueRequest::new("Crate", "ok").priority(priority % 3))
                .await?;
        }

        let config = WorkerConfig {
            poll_interval: StdDuration::from_millis(10),
            concurrency: 4,
            ..WorkerConfig::default()
        };
        let left = Worker::with_settings(store.clone(), registry.clone(), config.clone(), settings.clone());
        let right = Worker::with_settings(store.clone(), registry, config, settings);

        let (left_report, right_report) = tokio::join!(left.tick(), right.tick());
        let (left_report, right_report) = (left_report?, right_report?);

        assert_eq!(left_report.completed + right_report.completed, 20, "{name}");
        assert_eq!(
            left_report.skipped + right_report.skipped,
            left_report.selected + right_report.selected - 20,
            "{name}"
        );
        assert_eq!(left_report.errors + right_report.errors, 0, "{name}");
        assert_eq!(calls.ok(), 20, "{name}");
        assert_eq!(
            store.count(&JobFilter::all().completed(true)).await?,
            20,
            "{name}"
        );
    }
    Ok(())
}

/// `Crate.slow`: the first call parks until released; later calls finish at
/// once, failing when `later_fails` is set.
struct Gate {
    calls: AtomicUsize,
    release: Notify,
}

fn gated_registry(later_fails: bool) -> (Arc<Registry>, Arc<Gate>) {
    let gate = Arc::new(Gate {
        calls: AtomicUsize::new(0),
        release: Notify::new(),
    });
    let handler_gate = gate.clone();
    let registry = Registry::new()
        .with(
            "Crate",
            "slow",
            handler_fn(move |_args: Vec<Argument>| {
                let gate = handler_gate.clone();
                async move {
                    if gate.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        gate.release.notified().await;
                        return Ok(JsonValue::from("first"));
                    }
                    if later_fails {
                        Err(InvocationError::new("lid stuck"))
                    } else {
                        Ok::<_, InvocationError>(JsonValue::from("second"))
                    }
                }
            }),
        )
        .expect("register Crate.slow");
    (Arc::new(registry), gate)
}

/// Starts a slow run, then lets a second executor reclaim the job once the
/// first claim counts as stale. Returns both outcomes once the slow run is
/// released, plus the job id.
async fn race_takeover(
    store: Arc<dyn JobStore>,
    later_fails: bool,
) -> Result<(RunOutcome, RunOutcome, JobId)> {
    let (registry, gate) = gated_registry(later_fails);
    let patient = Executor::with_settings(store.clone(), registry.clone(), settings_with_keep(Keep::Never));
    let impatient = Executor::with_settings(
        store.clone(),
        registry,
        QueueSettings {
            keep: Keep::Never,
            stale_after: Some(Duration::milliseconds(50)),
            ..QueueSettings::default()
        },
    );

    let mut job = pending_job("slow", 0, Utc::now());
    job.target = "Crate".to_string();
    let id = store.insert(job.clone()).await?;

    let first = tokio::spawn(async move { patient.run(&job).await });

    let snapshot = loop {
        let current = store.find(id).await?.expect("job exists");
        if current.started_at.is_some() && gate.calls.load(Ordering::SeqCst) == 1 {
            break current;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    };
    tokio::time::sleep(StdDuration::from_millis(120)).await;

    let second = impatient.run(&snapshot).await?;
    gate.release.notify_one();
    let first = first.await??;
    Ok((first, second, id))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_takeover_is_kept_when_the_original_run_finishes() -> Result<()> {
    for (name, store) in adapters().await? {
        let (first, second, id) = race_takeover(store.clone(), true).await?;

        assert_eq!(second, RunOutcome::Failed("lid stuck".to_string()), "{name}");
        assert_eq!(first, RunOutcome::Completed(JsonValue::from("first")), "{name}");

        let stored = store.find(id).await?.expect("failed jobs are retained");
        assert!(stored.is_failed(), "{name}");
        assert_eq!(stored.exception_message.as_deref(), Some("lid stuck"), "{name}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_takeover_removes_the_job_once() -> Result<()> {
    for (name, store) in adapters().await? {
        let (first, second, id) = race_takeover(store.clone(), false).await?;

        assert_eq!(second, RunOutcome::Completed(JsonValue::from("second")), "{name}");
        assert_eq!(first, RunOutcome::Completed(JsonValue::from("first")), "{name}");
        assert!(store.find(id).await?.is_none(), "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn live_running_snapshot_is_skipped() -> Result<()> {
    for (name, store) in adapters().await? {
        let settings = settings_with_keep(Keep::Never);
        let (registry, calls) = test_registry();
        let executor = Executor::with_settings(store.clone(), registry, settings);

        let id = store.insert(pending_job("ok", 0, Utc::now())).await?;
        assert!(
            store
                .conditional_update_fields(id, &Expected::unclaimed(), &JobChanges::started(Utc::now()))
                .await?,
            "{name}"
        );
        let running = store.find(id).await?.expect("claimed job");

        assert_eq!(executor.run(&running).await?, RunOutcome::Skipped, "{name}");
        assert_eq!(calls.ok(), 0, "{name}");

        let stored = store.find(id).await?.expect("still running");
        assert_eq!(stored.started_at, running.started_at, "{name}");
        assert!(!stored.has_ran(), "{name}");
    }
    Ok(())
}
