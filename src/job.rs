//! Core job record and its derived lifecycle state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Argument;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state derived from a job's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker, not yet finished
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Receiver of the action, resolved through the registry at run time
    pub target: String,
    /// Operation invoked on the resolved target
    pub action: String,
    /// Positional arguments for the action
    pub arguments: Vec<Argument>,
    /// Higher values are served first
    pub priority: i32,
    /// Root of the retry lineage when this job is a retry
    pub parent_id: Option<JobId>,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
    /// When a worker claimed the job
    pub started_at: Option<DateTime<Utc>>,
    /// When the job finished successfully
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job failed
    pub failed_at: Option<DateTime<Utc>>,
    /// Serialized success value
    pub return_value: Option<String>,
    /// Failure text
    pub exception_message: Option<String>,
}

impl Job {
    /// Create a new pending job that is due immediately.
    pub fn new(target: impl Into<String>, action: impl Into<String>, arguments: Vec<Argument>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            target: target.into(),
            action: action.into(),
            arguments,
            priority: 0,
            parent_id: None,
            created_at: now,
            run_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            return_value: None,
            exception_message: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Whether the job has finished, successfully or not.
    pub fn has_ran(&self) -> bool {
        self.is_completed() || self.is_failed()
    }

    pub fn state(&self) -> JobState {
        if self.is_completed() {
            JobState::Completed
        } else if self.is_failed() {
            JobState::Failed
        } else if self.started_at.is_some() {
            JobState::Running
        } else {
            JobState::Pending
        }
    }

    /// Wall time between claim and finish; zero until the job has ran.
    pub fn duration(&self) -> Duration {
        if !self.has_ran() {
            return Duration::zero();
        }
        match (self.completed_at.or(self.failed_at), self.started_at) {
            (Some(finished), Some(started)) => finished - started,
            _ => Duration::zero(),
        }
    }

    /// Identifier shared by every attempt in this job's retry lineage.
    pub fn lineage_root(&self) -> JobId {
        self.parent_id.unwrap_or(self.id)
    }

    /// Whether the job could be selected at `now`, given the staleness cutoff
    /// for running jobs.
    pub fn is_eligible(&self, now: DateTime<Utc>, stale_before: Option<DateTime<Utc>>) -> bool {
        if self.has_ran() || self.run_at > now {
            return false;
        }
        match (self.started_at, stale_before) {
            (None, _) => true,
            (Some(started), Some(cutoff)) => started < cutoff,
            (Some(_), None) => false,
        }
    }
}
