//! Migration to create the jobs table.
//!
//! This migration creates the jobs table which holds every deferred unit of work,
//! its scheduling fields, lifecycle timestamps and recorded outcome.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::Target).text().not_null())
                    .col(ColumnDef::new(Jobs::Action).text().not_null())
                    .col(ColumnDef::new(Jobs::Arguments).json_binary().not_null())
                    .col(
                        ColumnDef::new(Jobs::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::ParentId).uuid().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::RunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Jobs::StartedAt).timestamp_with_time_zone().null())
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Jobs::FailedAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(Jobs::ReturnValue).text().null())
                    .col(ColumnDef::new(Jobs::ExceptionMessage).text().null())
                    .to_owned(),
            )
            .await?;

        // Dequeue scans unfinished rows that are due, highest priority first
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_jobs_eligible ON jobs (failed_at, completed_at, run_at, priority DESC)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_parent_id")
                    .table(Jobs::Table)
                    .col(Jobs::ParentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_completed_at")
                    .table(Jobs::Table)
                    .col(Jobs::CompletedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_jobs_eligible").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_parent_id").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_completed_at").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Target,
    Action,
    Arguments,
    Priority,
    ParentId,
    CreatedAt,
    RunAt,
    StartedAt,
    CompletedAt,
    FailedAt,
    ReturnValue,
    ExceptionMessage,
}
