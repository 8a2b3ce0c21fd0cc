//! # Data Models
//!
//! SeaORM entities backing the durable job store.

pub mod job;

pub use job::Entity as JobEntity;
