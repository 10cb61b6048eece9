use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use sqlx::{
    migrate::{MigrateDatabase, Migrator},
    postgres::PgPoolOptions,
    Executor, PgPool, Postgres, QueryBuilder, Row,
};
use tracing::debug;

use crate::data_types::{ColumnId, EndpointId, LogicalType, SqlValue, TableId, Timestamp};
use crate::implement_repository;

use super::{
    default::{PhysicalTypes, RepositoryQueries},
    interface::{
        quote_identifier, AuthSettingsRecord, ColumnRecord, EndpointRecord, Error,
        PhysicalColumn, Repository, Result, RowData, RowQuery, TableRecord,
    },
};

#[derive(Debug)]
pub struct PostgresRepository {
    pub executor: PgPool,
    pub schema_name: String,
}

impl PostgresRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/postgres");
    pub const QUERIES: RepositoryQueries = RepositoryQueries {
        physical_types: PhysicalTypes {
            text: "TEXT",
            integer: "BIGINT",
            uuid: "UUID",
            timestamp: "TIMESTAMPTZ",
            boolean: "BOOLEAN",
            json: "JSONB",
        },
        table_exists: r#"SELECT CAST(table_name AS TEXT) AS name
            FROM information_schema.tables
            WHERE table_schema = current_schema() AND CAST(table_name AS TEXT) = $1"#,
        table_columns: r#"SELECT CAST(column_name AS TEXT) AS name
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND CAST(table_name AS TEXT) = $1
            ORDER BY ordinal_position"#,
        drop_table_suffix: " CASCADE",
    };

    pub async fn try_new(
        dsn: String,
        schema_name: String,
    ) -> std::result::Result<Self, Error> {
        if !Postgres::database_exists(&dsn)
            .await
            .map_err(Error::SqlxError)?
        {
            let _ = Postgres::create_database(&dsn).await;
        }

        let repo = PostgresRepository::connect(dsn, schema_name.clone())
            .await
            .map_err(Error::SqlxError)?;

        repo.executor
            .execute(
                format!(
                    "CREATE SCHEMA IF NOT EXISTS {};",
                    quote_identifier(&schema_name)
                )
                .as_str(),
            )
            .await
            .map_err(Error::SqlxError)?;

        // Setup the schema
        repo.setup().await?;
        Ok(repo)
    }

    pub async fn connect(
        dsn: String,
        schema_name: String,
    ) -> std::result::Result<Self, sqlx::Error> {
        let schema_name_2 = schema_name.clone();

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(16)
            .idle_timeout(Duration::from_millis(30000))
            .test_before_acquire(true)
            .after_connect(move |c, _m| {
                let schema_name = quote_identifier(&schema_name);
                Box::pin(async move {
                    let query = format!("SET search_path TO {schema_name},public;");
                    c.execute(sqlx::query(&query)).await?;
                    Ok(())
                })
            })
            .connect(&dsn)
            .await?;

        Ok(Self {
            executor: pool,
            schema_name: schema_name_2,
        })
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = d.code() {
                if code == "23505" {
                    return Error::UniqueConstraintViolation(error);
                } else if code == "23503" {
                    return Error::FKConstraintViolation(error);
                }
            }
        }
        Error::SqlxError(error)
    }
}

implement_repository!(PostgresRepository, Postgres);

pub mod testutils {
    use uuid::Uuid;

    use super::PostgresRepository;

    pub fn get_random_schema() -> String {
        // Schema names have to start with a letter
        format!("test_{}", Uuid::new_v4().simple())
    }

    pub async fn make_repository(dsn: &str) -> PostgresRepository {
        let schema_name = get_random_schema();

        PostgresRepository::try_new(dsn.to_string(), schema_name)
            .await
            .expect("Error setting up the database")
    }
}
