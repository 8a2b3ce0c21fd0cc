//! Test utilities for database-backed queue tests.
//!
//! Provides in-memory SQLite databases with migrations applied, a handler
//! registry with predictable behavior, and helpers for fabricating jobs in a
//! given lifecycle state.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value as JsonValue;

use stevedore::{
    Argument, InvocationError, Job, JobRepository, Keep, QueueSettings, Registry, handler_fn,
};

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is pinned to one connection; every SQLite in-memory connection
/// is its own database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

/// Repository over a fresh in-memory database.
pub async fn setup_repository() -> Result<Arc<JobRepository>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(JobRepository::new(db)))
}

pub fn settings_with_keep(keep: Keep) -> QueueSettings {
    QueueSettings {
        keep,
        ..QueueSettings::default()
    }
}

/// Counts invocations per registered handler.
#[derive(Debug, Default)]
pub struct Calls {
    pub ok: AtomicUsize,
    pub fail: AtomicUsize,
}

impl Calls {
    pub fn ok(&self) -> usize {
        self.ok.load(Ordering::SeqCst)
    }

    pub fn fail(&self) -> usize {
        self.fail.load(Ordering::SeqCst)
    }
}

/// Registry with `Crate.ok` (returns its first argument, or null) and
/// `Crate.fail` (always fails with "crate dropped").
pub fn test_registry() -> (Arc<Registry>, Arc<Calls>) {
    let calls = Arc::new(Calls::default());

    let ok_calls = calls.clone();
    let fail_calls = calls.clone();
    let registry = Registry::new()
        .with(
            "Crate",
            "ok",
            handler_fn(move |args: Vec<Argument>| {
                let calls = ok_calls.clone();
                async move {
                    calls.ok.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, InvocationError>(
                        args.first().map(Argument::to_json).unwrap_or(JsonValue::Null),
                    )
                }
            }),
        )
        .expect("register Crate.ok")
        .with(
            "Crate",
            "fail",
            handler_fn(move |_args: Vec<Argument>| {
                let calls = fail_calls.clone();
                async move {
                    calls.fail.fetch_add(1, Ordering::SeqCst);
                    Err::<JsonValue, _>(InvocationError::new("crate dropped"))
                }
            }),
        )
        .expect("register Crate.fail");

    (Arc::new(registry), calls)
}

/// A pending job created at `created_at`.
pub fn pending_job(action: &str, priority: i32, created_at: DateTime<Utc>) -> Job {
    let mut job = Job::new("Crate", action, Vec::new());
    job.priority = priority;
    job.created_at = created_at;
    job.run_at = created_at;
    job
}

/// A job that completed `ago` before now.
pub fn completed_job(ago: Duration) -> Job {
    let finished = Utc::now() - ago;
    let mut job = pending_job("ok", 0, finished - Duration::seconds(10));
    job.started_at = Some(finished - Duration::seconds(1));
    job.completed_at = Some(finished);
    job.return_value = Some("null".to_string());
    job
}

/// A job that failed just now.
pub fn failed_job() -> Job {
    let now = Utc::now();
    let mut job = pending_job("fail", 0, now - Duration::seconds(10));
    job.started_at = Some(now - Duration::seconds(1));
    job.failed_at = Some(now);
    job.exception_message = Some("crate dropped".to_string());
    job
}
