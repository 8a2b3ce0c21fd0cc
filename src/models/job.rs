//! Job entity model
//!
//! This module contains the SeaORM entity model for the jobs table, which
//! holds every enqueued unit of work together with its lifecycle timestamps.

use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::job::{Job, JobId};
use crate::store::StoreError;
use crate::value::{decode_arguments, encode_arguments};

/// Job entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Receiver resolved through the registry
    pub target: String,

    /// Operation invoked on the target
    pub action: String,

    /// Tagged argument list
    #[sea_orm(column_type = "JsonBinary")]
    pub arguments: JsonValue,

    /// Higher values are dequeued first
    pub priority: i32,

    /// Root job of the retry lineage
    pub parent_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,

    /// Earliest time the job may be dequeued
    pub run_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub failed_at: Option<DateTimeWithTimeZone>,

    /// JSON encoded success value
    pub return_value: Option<String>,

    pub exception_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Normalize a timestamp for storage.
///
/// Values are written as UTC with microsecond precision so that Postgres and
/// SQLite compare and round-trip them identically.
pub fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    dt.trunc_subsecs(6).fixed_offset()
}

impl TryFrom<Model> for Job {
    type Error = StoreError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let arguments = decode_arguments(model.arguments)
            .map_err(|e| StoreError::Encoding(format!("job {}: {e}", model.id)))?;

        Ok(Job {
            id: JobId::from_uuid(model.id),
            target: model.target,
            action: model.action,
            arguments,
            priority: model.priority,
            parent_id: model.parent_id.map(JobId::from_uuid),
            created_at: model.created_at.with_timezone(&Utc),
            run_at: model.run_at.with_timezone(&Utc),
            started_at: model.started_at.map(|t| t.with_timezone(&Utc)),
            completed_at: model.completed_at.map(|t| t.with_timezone(&Utc)),
            failed_at: model.failed_at.map(|t| t.with_timezone(&Utc)),
            return_value: model.return_value,
            exception_message: model.exception_message,
        })
    }
}

impl TryFrom<&Job> for ActiveModel {
    type Error = StoreError;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        let arguments = encode_arguments(&job.arguments)
            .map_err(|e| StoreError::Encoding(format!("job {}: {e}", job.id)))?;

        Ok(ActiveModel {
            id: Set(job.id.as_uuid()),
            target: Set(job.target.clone()),
            action: Set(job.action.clone()),
            arguments: Set(arguments),
            priority: Set(job.priority),
            parent_id: Set(job.parent_id.map(|id| id.as_uuid())),
            created_at: Set(to_db_time(job.created_at)),
            run_at: Set(to_db_time(job.run_at)),
            started_at: Set(job.started_at.map(to_db_time)),
            completed_at: Set(job.completed_at.map(to_db_time)),
            failed_at: Set(job.failed_at.map(to_db_time)),
            return_value: Set(job.return_value.clone()),
            exception_message: Set(job.exception_message.clone()),
        })
    }
}
