//! # Stevedore
//!
//! A durable, priority-ordered job queue. Producers enqueue jobs naming a
//! target, an action and positional arguments; workers select eligible jobs
//! in priority order, claim them atomically, run them through a handler
//! registry, and record the outcome.

pub mod builtin;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod job;
pub mod models;
pub mod registry;
pub mod repositories;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod value;
pub mod worker;

pub use error::QueueError;
pub use executor::{Executor, RunOutcome};
pub use job::{Job, JobId, JobState};
pub use registry::{Handler, InvocationError, Registry, RegistryError, handler_fn};
pub use repositories::JobRepository;
pub use retention::{Keep, Retention};
pub use retry::RetryTracker;
pub use scheduler::{EnqueueRequest, Scheduler};
pub use settings::QueueSettings;
pub use store::{InMemoryJobStore, JobStore, QueueStats, StoreError};
pub use value::Argument;
pub use worker::{TickReport, Worker, WorkerConfig};

pub use migration;
