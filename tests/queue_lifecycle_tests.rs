//! End-to-end job lifecycle against the SeaORM repository.

use anyhow::Result;
use chrono::{Duration, Utc};
use stevedore::store::JobFilter;
use stevedore::{
    EnqueueRequest, Executor, JobId, JobStore, Keep, QueueError, Retention, RetryTracker,
    RunOutcome, Scheduler,
};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{completed_job, failed_job, settings_with_keep, setup_repository, test_registry};

#[tokio::test]
async fn next_never_returns_lower_priority_before_higher() -> Result<()> {
    let store = setup_repository().await?;
    let scheduler = Scheduler::with_settings(store.clone(), settings_with_keep(Keep::Never));

    for priority in [1, -3, 7, 0, 7, 2] {
        scheduler
            .enqueue(EnqueueRequest::new("Crate", "ok").priority(priority))
            .await?;
    }

    let batch = scheduler.next(10).await?;
    let priorities: Vec<i32> = batch.iter().map(|job| job.priority).collect();
    assert_eq!(priorities, vec![7, 7, 2, 1, 0, -3]);
    for pair in batch.windows(2) {
        if pair[0].priority == pair[1].priority {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }
    Ok(())
}

#[tokio::test]
async fn delayed_and_failed_jobs_are_not_selected() -> Result<()> {
    let store = setup_repository().await?;
    let scheduler = Scheduler::with_settings(store.clone(), settings_with_keep(Keep::Never));

    scheduler
        .enqueue(EnqueueRequest::new("Crate", "ok").delay(Duration::hours(1)))
        .await?;
    store.insert(failed_job()).await?;
    let due = scheduler
        .enqueue(EnqueueRequest::new("Crate", "ok").run_at(Utc::now() - Duration::seconds(1)))
        .await?;

    let ids: Vec<JobId> = scheduler.next(10).await?.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![due]);
    Ok(())
}

#[tokio::test]
async fn successful_run_without_keep_deletes_the_job() -> Result<()> {
    let store = setup_repository().await?;
    let settings = settings_with_keep(Keep::Never);
    let (registry, calls) = test_registry();
    let scheduler = Scheduler::with_settings(store.clone(), settings.clone());
    let executor = Executor::with_settings(store.clone(), registry, settings);

    let id = scheduler
        .enqueue(EnqueueRequest::new("Crate", "ok").arg("pallet"))
        .await?;
    let job = store.find(id).await?.expect("enqueued");

    let outcome = executor.run(&job).await?;
    assert_eq!(outcome, RunOutcome::Completed(serde_json::json!("pallet")));
    assert_eq!(calls.ok(), 1);
    assert!(store.find(id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn successful_run_with_keep_records_completion() -> Result<()> {
    let store = setup_repository().await?;
    let settings = settings_with_keep(Keep::Always);
    let (registry, _calls) = test_registry();
    let scheduler = Scheduler::with_settings(store.clone(), settings.clone());
    let executor = Executor::with_settings(store.clone(), registry, settings);

    let id = scheduler
        .enqueue(EnqueueRequest::new("Crate", "ok").arg(12_i64))
        .await?;
    let job = store.find(id).await?.expect("enqueued");
    executor.run(&job).await?;

    let stored = store.find(id).await?.expect("kept");
    assert!(stored.is_completed());
    assert!(!stored.is_failed());
    assert_eq!(stored.return_value.as_deref(), Some("12"));
    assert!(stored.duration() >= Duration::zero());
    assert!(scheduler.next(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_run_keeps_the_job_as_failed() -> Result<()> {
    let store = setup_repository().await?;
    let settings = settings_with_keep(Keep::Never);
    let (registry, calls) = test_registry();
    let scheduler = Scheduler::with_settings(store.clone(), settings.clone());
    let executor = Executor::with_settings(store.clone(), registry, settings);

    let id = scheduler.enqueue(EnqueueRequest::new("Crate", "fail")).await?;
    let job = store.find(id).await?.expect("enqueued");

    let outcome = executor.run(&job).await?;
    assert_eq!(outcome, RunOutcome::Failed("crate dropped".to_string()));
    assert_eq!(calls.fail(), 1);

    let stored = store.find(id).await?.expect("failed jobs are retained");
    assert!(stored.is_failed());
    assert!(stored.completed_at.is_none());
    assert!(stored.started_at.is_some());
    assert_eq!(stored.exception_message.as_deref(), Some("crate dropped"));
    Ok(())
}

#[tokio::test]
async fn unregistered_target_fails_the_job() -> Result<()> {
    let store = setup_repository().await?;
    let settings = settings_with_keep(Keep::Never);
    let (registry, _calls) = test_registry();
    let scheduler = Scheduler::with_settings(store.clone(), settings.clone());
    let executor = Executor::with_settings(store.clone(), registry, settings);

    let id = scheduler
        .enqueue(EnqueueRequest::new("Forklift", "lift"))
        .await?;
    let job = store.find(id).await?.expect("enqueued");

    let outcome = executor.run(&job).await?;
    assert_eq!(
        outcome,
        RunOutcome::Failed("target 'Forklift' is not registered".to_string())
    );
    assert!(store.find(id).await?.expect("kept").is_failed());
    Ok(())
}

#[tokio::test]
async fn cleanup_without_keep_removes_only_completed_jobs() -> Result<()> {
    let store = setup_repository().await?;
    store.insert(completed_job(Duration::days(2))).await?;
    store.insert(completed_job(Duration::seconds(1))).await?;
    let failed = store.insert(failed_job()).await?;
    let pending = Scheduler::with_settings(store.clone(), settings_with_keep(Keep::Never))
        .enqueue(EnqueueRequest::new("Crate", "ok"))
        .await?;

    let retention = Retention::with_settings(store.clone(), settings_with_keep(Keep::Never));
    assert!(!retention.keep());
    assert_eq!(retention.cleanup().await?, 2);
    assert_eq!(retention.cleanup().await?, 0);

    assert!(store.find(failed).await?.is_some());
    assert!(store.find(pending).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn cleanup_with_window_removes_only_old_completions() -> Result<()> {
    let store = setup_repository().await?;
    store.insert(completed_job(Duration::hours(30))).await?;
    store.insert(completed_job(Duration::hours(25))).await?;
    let recent = store.insert(completed_job(Duration::hours(1))).await?;
    store.insert(failed_job()).await?;

    let retention =
        Retention::with_settings(store.clone(), settings_with_keep(Keep::For(Duration::days(1))));
    assert_eq!(retention.cleanup().await?, 2);
    assert_eq!(retention.cleanup().await?, 0);

    assert!(store.find(recent).await?.is_some());
    assert_eq!(store.count(&JobFilter::all().failed(true)).await?, 1);
    Ok(())
}

#[tokio::test]
async fn times_failed_counts_the_whole_lineage() -> Result<()> {
    let store = setup_repository().await?;
    let settings = settings_with_keep(Keep::Never);
    let scheduler = Scheduler::with_settings(store.clone(), settings);
    let tracker = RetryTracker::new(store.clone(), scheduler);

    // Original failed, first retry failed, second retry still pending.
    let original = failed_job();
    let original_id = store.insert(original.clone()).await?;

    let first_id = tracker.retry(&original).await?;
    let mut first = store.find(first_id).await?.expect("first retry");
    first.started_at = Some(Utc::now());
    first.failed_at = Some(Utc::now());
    store.delete(first_id).await?;
    store.insert(first.clone()).await?;

    let second_id = tracker.retry(&first).await?;
    let second = store.find(second_id).await?.expect("second retry");

    assert_eq!(second.parent_id, Some(original_id));
    assert_eq!(first.parent_id, Some(original_id));
    assert_eq!(tracker.times_failed(&original).await?, 2);
    assert_eq!(tracker.times_failed(&second).await?, 2);
    Ok(())
}

#[tokio::test]
async fn retry_backs_off_and_rejects_unfailed_jobs() -> Result<()> {
    let store = setup_repository().await?;
    let scheduler = Scheduler::with_settings(store.clone(), settings_with_keep(Keep::Never));
    let tracker = RetryTracker::new(store.clone(), scheduler.clone());

    let pending_id = scheduler.enqueue(EnqueueRequest::new("Crate", "ok")).await?;
    let pending = store.find(pending_id).await?.expect("pending");
    assert!(matches!(
        tracker.retry(&pending).await,
        Err(QueueError::NotFailed(id)) if id == pending_id
    ));

    let mut original = failed_job();
    original.priority = 4;
    store.insert(original.clone()).await?;

    let before = Utc::now();
    let retry_id = tracker.retry(&original).await?;
    let retry = store.find(retry_id).await?.expect("retry");

    // One failure in the lineage: 1^4 = 1 second of backoff.
    assert!(retry.run_at >= before + Duration::milliseconds(900));
    assert_eq!(retry.priority, 4);
    assert!(scheduler.next(10).await?.iter().all(|job| job.id != retry_id));
    Ok(())
}
