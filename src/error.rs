//! # Error Handling
//!
//! Queue-level error type returned by the public engine operations. Storage,
//! registry, and invocation failures each keep their own enum next to the code
//! that raises them and are re-exported here.

use thiserror::Error;

use crate::job::JobId;

pub use crate::config::ConfigError;
pub use crate::registry::{InvocationError, RegistryError};
pub use crate::store::StoreError;

/// Errors surfaced by scheduler, executor, retry, and retention operations.
///
/// Job-level failures (unresolvable targets, handler errors) never appear here;
/// they are recorded on the job itself.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("job {0} has not failed and cannot be retried")]
    NotFailed(JobId),

    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Stable machine-readable code, used as a log field and by the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Store(StoreError::NotFound(_)) => "JOB_NOT_FOUND",
            QueueError::Store(_) => "STORAGE_ERROR",
            QueueError::NotFailed(_) => "JOB_NOT_FAILED",
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Store(StoreError::Database(_)))
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
