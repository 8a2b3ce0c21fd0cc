//! Handler registry
//!
//! Maps a job's `target`/`action` pair to an invocable [`Handler`]. Handlers are
//! registered up front so that a job naming an unknown target or action fails
//! with a precise error instead of at some arbitrary dispatch point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::value::Argument;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("target '{target}' is not registered")]
    TargetNotFound { target: String },

    #[error("target '{target}' has no action '{action}'")]
    ActionNotFound { target: String, action: String },

    #[error("handler for '{target}.{action}' is already registered")]
    Duplicate { target: String, action: String },
}

/// Failure raised by a handler while performing a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// A positional argument was missing or had the wrong kind.
    pub fn bad_argument(index: usize, expected: &str, got: Option<&Argument>) -> Self {
        let got = got.map(Argument::kind).unwrap_or("nothing");
        Self::new(format!("argument {index}: expected {expected}, got {got}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for InvocationError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Something a job can invoke.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Perform the action with the job's positional arguments, returning a
    /// JSON value recorded as the job's return value.
    async fn invoke(&self, arguments: &[Argument]) -> Result<JsonValue, InvocationError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Argument>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, InvocationError>> + Send,
{
    async fn invoke(&self, arguments: &[Argument]) -> Result<JsonValue, InvocationError> {
        (self.0)(arguments.to_vec()).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Vec<Argument>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, InvocationError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Registry of handlers keyed by target, then action
#[derive(Clone, Default)]
pub struct Registry {
    targets: HashMap<String, HashMap<String, Arc<dyn Handler>>>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `target.action`.
    pub fn register(
        &mut self,
        target: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let target = target.into();
        let action = action.into();
        let actions = self.targets.entry(target.clone()).or_default();
        if actions.contains_key(&action) {
            return Err(RegistryError::Duplicate { target, action });
        }
        debug!(target_name = %target, action = %action, "Registered job handler");
        actions.insert(action, handler);
        Ok(())
    }

    /// Builder-style [`Registry::register`].
    pub fn with(
        mut self,
        target: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, RegistryError> {
        self.register(target, action, handler)?;
        Ok(self)
    }

    /// Look up the handler for `target.action`.
    pub fn resolve(&self, target: &str, action: &str) -> Result<Arc<dyn Handler>, RegistryError> {
        let actions = self
            .targets
            .get(target)
            .ok_or_else(|| RegistryError::TargetNotFound {
                target: target.to_string(),
            })?;
        actions
            .get(action)
            .cloned()
            .ok_or_else(|| RegistryError::ActionNotFound {
                target: target.to_string(),
                action: action.to_string(),
            })
    }

    pub fn contains(&self, target: &str, action: &str) -> bool {
        self.resolve(target, action).is_ok()
    }

    /// All registered `(target, action)` pairs, sorted.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .targets
            .iter()
            .flat_map(|(target, actions)| {
                actions
                    .keys()
                    .map(move |action| (target.clone(), action.clone()))
            })
            .collect();
        entries.sort();
        entries
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries())
            .finish()
    }
}
