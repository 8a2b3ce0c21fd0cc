//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations behind the
//! crate's storage port.

pub mod job;

pub use job::JobRepository;
