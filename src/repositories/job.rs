//! # Job Repository
//!
//! SeaORM-backed [`JobStore`]. Filters are translated into SQL conditions and
//! the conditional update is a single guarded `UPDATE`, so claims stay atomic
//! across processes sharing the database.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::prelude::{DateTimeWithTimeZone, Uuid};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, SqlErr, UpdateMany,
};
use tracing::{debug, error};

use crate::job::{Job, JobId};
use crate::models::job::{ActiveModel, Column, Entity, Model, to_db_time};
use crate::store::{ClaimWindow, Expected, JobChanges, JobFilter, JobOrder, JobStore, StoreError};

/// Repository for job database operations
#[derive(Clone, Debug)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    /// Create a new JobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Take a row whose arguments cannot be decoded out of circulation.
    ///
    /// Unfinished rows are marked failed so they stop being selected; the
    /// record itself is kept for inspection.
    async fn quarantine(
        &self,
        (id, started_at, completed_at, failed_at): RowState,
        err: StoreError,
    ) -> Result<(), StoreError> {
        error!(job_id = %id, error = %err, "Skipping undecodable job row");
        if completed_at.is_some() || failed_at.is_some() {
            return Ok(());
        }

        let now = Utc::now();
        let changes = JobChanges {
            started_at: Some(started_at.map_or(now, |at| at.with_timezone(&Utc))),
            ..JobChanges::failed(now, err.to_string())
        };
        let expected = Expected {
            started_at: started_at.map(|at| at.with_timezone(&Utc)),
        };
        let result = with_changes(Entity::update_many(), &changes)
            .filter(guard_for(JobId::from_uuid(id), &expected))
            .exec(&self.db)
            .await
            .map_err(|e| log_db_err("quarantine job", e))?;

        if result.rows_affected == 1 {
            counter!("stevedore_jobs_quarantined_total").increment(1);
        }
        Ok(())
    }
}

type RowState = (
    Uuid,
    Option<DateTimeWithTimeZone>,
    Option<DateTimeWithTimeZone>,
    Option<DateTimeWithTimeZone>,
);

fn condition_for(filter: &JobFilter) -> Condition {
    let mut cond = Condition::all();

    if let Some(root) = filter.lineage {
        cond = cond.add(
            Condition::any()
                .add(Column::Id.eq(root.as_uuid()))
                .add(Column::ParentId.eq(root.as_uuid())),
        );
    }
    if let Some(completed) = filter.completed {
        cond = cond.add(if completed {
            Column::CompletedAt.is_not_null()
        } else {
            Column::CompletedAt.is_null()
        });
    }
    if let Some(failed) = filter.failed {
        cond = cond.add(if failed {
            Column::FailedAt.is_not_null()
        } else {
            Column::FailedAt.is_null()
        });
    }
    if let Some(started) = filter.started {
        cond = cond.add(if started {
            Column::StartedAt.is_not_null()
        } else {
            Column::StartedAt.is_null()
        });
    }
    if let Some(at) = filter.run_at_or_before {
        cond = cond.add(Column::RunAt.lte(to_db_time(at)));
    }
    if let Some(at) = filter.completed_before {
        cond = cond.add(Column::CompletedAt.lt(to_db_time(at)));
    }
    match filter.claimable {
        None => {}
        Some(ClaimWindow::Unclaimed) => cond = cond.add(Column::StartedAt.is_null()),
        Some(ClaimWindow::StaleBefore(cutoff)) => {
            cond = cond.add(
                Condition::any()
                    .add(Column::StartedAt.is_null())
                    .add(Column::StartedAt.lt(to_db_time(cutoff))),
            );
        }
    }

    cond
}

fn with_changes(mut update: UpdateMany<Entity>, changes: &JobChanges) -> UpdateMany<Entity> {
    if let Some(at) = changes.started_at {
        update = update.col_expr(Column::StartedAt, Expr::value(to_db_time(at)));
    }
    if let Some(at) = changes.completed_at {
        update = update.col_expr(Column::CompletedAt, Expr::value(to_db_time(at)));
    }
    if let Some(at) = changes.failed_at {
        update = update.col_expr(Column::FailedAt, Expr::value(to_db_time(at)));
    }
    if let Some(value) = &changes.return_value {
        update = update.col_expr(Column::ReturnValue, Expr::value(value.clone()));
    }
    if let Some(message) = &changes.exception_message {
        update = update.col_expr(Column::ExceptionMessage, Expr::value(message.clone()));
    }
    update
}

/// Row-level precondition shared by conditional writes.
fn guard_for(id: JobId, expected: &Expected) -> Condition {
    let started = match expected.started_at {
        None => Column::StartedAt.is_null(),
        Some(at) => Column::StartedAt.eq(to_db_time(at)),
    };

    Condition::all()
        .add(Column::Id.eq(id.as_uuid()))
        .add(Column::CompletedAt.is_null())
        .add(Column::FailedAt.is_null())
        .add(started)
}

fn log_db_err(context: &'static str, err: sea_orm::DbErr) -> StoreError {
    error!(error = ?err, context, "Database operation failed");
    StoreError::Database(err)
}

#[async_trait]
impl JobStore for JobRepository {
    async fn insert(&self, job: Job) -> Result<JobId, StoreError> {
        let id = job.id;
        let active = ActiveModel::try_from(&job)?;
        active.insert(&self.db).await.map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::AlreadyExists(id),
            _ => log_db_err("insert job", e),
        })?;

        debug!(job_id = %id, target = %job.target, action = %job.action, "Job row inserted");
        Ok(id)
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let model = Entity::find_by_id(id.as_uuid())
            .one(&self.db)
            .await
            .map_err(|e| log_db_err("find job", e))?;

        model.map(Job::try_from).transpose()
    }

    async fn find_many(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: Option<u64>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut query = Entity::find().filter(condition_for(filter));
        query = match order {
            JobOrder::Queue => query
                .order_by_desc(Column::Priority)
                .order_by_asc(Column::CreatedAt),
            JobOrder::Oldest => query.order_by_asc(Column::CreatedAt),
        };
        if let Some(limit_value) = limit {
            query = query.limit(limit_value);
        }

        let models: Vec<Model> = query
            .all(&self.db)
            .await
            .map_err(|e| log_db_err("list jobs", e))?;

        let mut jobs = Vec::with_capacity(models.len());
        for model in models {
            let snapshot = (model.id, model.started_at, model.completed_at, model.failed_at);
            match Job::try_from(model) {
                Ok(job) => jobs.push(job),
                Err(err) => self.quarantine(snapshot, err).await?,
            }
        }
        Ok(jobs)
    }

    async fn update_fields(&self, id: JobId, changes: &JobChanges) -> Result<(), StoreError> {
        let result = with_changes(Entity::update_many(), changes)
            .filter(Column::Id.eq(id.as_uuid()))
            .exec(&self.db)
            .await
            .map_err(|e| log_db_err("update job", e))?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn conditional_update_fields(
        &self,
        id: JobId,
        expected: &Expected,
        changes: &JobChanges,
    ) -> Result<bool, StoreError> {
        let result = with_changes(Entity::update_many(), changes)
            .filter(guard_for(id, expected))
            .exec(&self.db)
            .await
            .map_err(|e| log_db_err("conditionally update job", e))?;

        Ok(result.rows_affected == 1)
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let result = Entity::delete_by_id(id.as_uuid())
            .exec(&self.db)
            .await
            .map_err(|e| log_db_err("delete job", e))?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn conditional_delete(&self, id: JobId, expected: &Expected) -> Result<bool, StoreError> {
        let result = Entity::delete_many()
            .filter(guard_for(id, expected))
            .exec(&self.db)
            .await
            .map_err(|e| log_db_err("conditionally delete job", e))?;

        Ok(result.rows_affected == 1)
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let result = Entity::delete_many()
            .filter(condition_for(filter))
            .exec(&self.db)
            .await
            .map_err(|e| log_db_err("delete jobs", e))?;

        Ok(result.rows_affected)
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        Entity::find()
            .filter(condition_for(filter))
            .count(&self.db)
            .await
            .map_err(|e| log_db_err("count jobs", e))
    }
}
