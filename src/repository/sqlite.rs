use std::{fmt::Debug, str::FromStr};

use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, QueryBuilder, Row, Sqlite,
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
pub struct SqliteRepository {
    pub executor: Pool<Sqlite>,
}

impl SqliteRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");
    pub const QUERIES: RepositoryQueries = RepositoryQueries {
        physical_types: PhysicalTypes {
            text: "TEXT",
            integer: "INTEGER",
            // sqlx stores UUIDs as their 16 raw bytes
            uuid: "BLOB",
            timestamp: "TEXT",
            boolean: "BOOLEAN",
            json: "TEXT",
        },
        table_exists: "SELECT name FROM sqlite_master WHERE type = 'table' AND name = $1",
        table_columns: "SELECT name FROM pragma_table_info($1)",
        drop_table_suffix: "",
    };

    pub async fn try_new(
        dsn: String,
        journal_mode: SqliteJournalMode,
    ) -> std::result::Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(&dsn)
            .map_err(Error::SqlxError)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal_mode);

        // An in-memory database lives as long as its last connection, and
        // concurrent writers over a shared cache fail with SQLITE_LOCKED
        // instead of waiting, so keep exactly one connection around.
        let pool_options = if dsn.contains(":memory:") || dsn.contains("mode=memory") {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(Error::SqlxError)?;
        let repo = Self { executor: pool };
        repo.setup().await?;
        Ok(repo)
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // For some reason, sqlx doesn't return the proper errcode for FK violations,
            // even though it's calling sqlite3_extended_errcode which is meant to return full codes.
            // Unique constraint violations do return the correct code though.
            if message.contains("FOREIGN KEY constraint failed") {
                return Error::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return Error::UniqueConstraintViolation(error);
            }
        }
        Error::SqlxError(error)
    }
}

implement_repository!(SqliteRepository, Sqlite);
