//! Process-wide queue settings.
//!
//! Engine components read these on every call unless they were built with an
//! explicit [`QueueSettings`] value.

use std::sync::{OnceLock, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::config::QueueConfig;
use crate::retention::Keep;

pub const DEFAULT_JOB_LIMIT: u64 = 100;
pub const DEFAULT_STALE_AFTER_SECONDS: i64 = 3600;
/// Upper bound for retention and staleness windows: one hundred years.
pub const MAX_WINDOW_SECONDS: u64 = 100 * 365 * 24 * 3600;

static SETTINGS: OnceLock<RwLock<QueueSettings>> = OnceLock::new();

/// Tunables shared by the scheduler, executor and retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Batch size used by `Scheduler::next_default`
    pub job_limit: u64,
    /// Retention of completed jobs
    pub keep: Keep,
    /// Age after which a running job may be reclaimed; `None` never reclaims
    pub stale_after: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            job_limit: DEFAULT_JOB_LIMIT,
            keep: Keep::Never,
            stale_after: Some(Duration::seconds(DEFAULT_STALE_AFTER_SECONDS)),
        }
    }
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            job_limit: config.job_limit,
            keep: config.keep_jobs,
            stale_after: config
                .stale_after_seconds
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(Duration::try_seconds),
        }
    }

    /// Claims older than this are considered abandoned.
    ///
    /// `None` when reclaim is disabled or the window reaches past the earliest
    /// representable time.
    pub fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.stale_after
            .and_then(|window| now.checked_sub_signed(window))
    }
}

fn cell() -> &'static RwLock<QueueSettings> {
    SETTINGS.get_or_init(|| RwLock::new(QueueSettings::default()))
}

/// Snapshot of the current process-wide settings.
pub fn current() -> QueueSettings {
    cell()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replace the process-wide settings.
pub fn install(settings: QueueSettings) {
    *cell().write().unwrap_or_else(PoisonError::into_inner) = settings;
}

pub fn default_limit() -> u64 {
    current().job_limit
}

pub fn set_default_limit(limit: u64) {
    cell()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .job_limit = limit;
}

pub fn keep() -> Keep {
    current().keep
}

pub fn set_keep(keep: Keep) {
    cell().write().unwrap_or_else(PoisonError::into_inner).keep = keep;
}
