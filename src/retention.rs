//! Retention policy for completed jobs.
//!
//! Failed jobs are never touched here; they stay until an operator removes
//! them or retries them.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use tracing::{debug, info, instrument};

use crate::error::QueueError;
use crate::settings::{self, QueueSettings};
use crate::store::{JobFilter, JobStore};

/// How long completed jobs are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Keep {
    /// Never delete completed jobs
    Always,
    /// Delete completed jobs as soon as they finish
    #[default]
    Never,
    /// Keep completed jobs for a window after completion
    For(Duration),
}

impl Keep {
    /// Whether a job completing right now should be retained.
    pub fn keep(&self) -> bool {
        match self {
            Keep::Always => true,
            Keep::Never => false,
            Keep::For(window) => *window >= Duration::zero(),
        }
    }

    /// Parse the textual form used in configuration: `true`, `false`, or a
    /// number of seconds.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "always" => Ok(Keep::Always),
            "false" | "never" => Ok(Keep::Never),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(Duration::try_seconds)
                .map(Keep::For)
                .ok_or_else(|| format!("expected true, false or a number of seconds, got '{value}'")),
        }
    }
}

impl std::fmt::Display for Keep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Keep::Always => f.write_str("true"),
            Keep::Never => f.write_str("false"),
            Keep::For(window) => write!(f, "{}", window.num_seconds()),
        }
    }
}

impl serde::Serialize for Keep {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Keep {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Keep::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Applies the [`Keep`] policy to stored jobs.
#[derive(Clone)]
pub struct Retention {
    store: Arc<dyn JobStore>,
    settings: Option<QueueSettings>,
}

impl Retention {
    /// Retention reading the process-wide settings on every call.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            settings: None,
        }
    }

    /// Retention pinned to explicit settings.
    pub fn with_settings(store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self {
            store,
            settings: Some(settings),
        }
    }

    fn policy(&self) -> Keep {
        self.settings
            .as_ref()
            .map(|s| s.keep)
            .unwrap_or_else(|| settings::current().keep)
    }

    /// Whether completed jobs are currently retained.
    pub fn keep(&self) -> bool {
        self.policy().keep()
    }

    /// Delete completed jobs that are past the retention window.
    ///
    /// Returns the number of deleted records.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<u64, QueueError> {
        let filter = match self.policy() {
            Keep::Always => {
                debug!("Retention keeps completed jobs forever; nothing to clean up");
                return Ok(0);
            }
            Keep::Never => JobFilter::all().completed(true),
            Keep::For(window) => match Utc::now().checked_sub_signed(window) {
                Some(cutoff) => JobFilter::all().completed(true).completed_before(cutoff),
                None => {
                    debug!(window_seconds = window.num_seconds(), "Retention window reaches past the earliest time");
                    return Ok(0);
                }
            },
        };

        let deleted = self.store.delete_many(&filter).await?;
        if deleted > 0 {
            counter!("stevedore_jobs_cleaned_total").increment(deleted);
            info!(deleted, "Removed completed jobs past retention");
        }
        Ok(deleted)
    }
}
