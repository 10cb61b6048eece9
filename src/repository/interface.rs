use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;

use crate::data_types::{
    ColumnId, EndpointId, LogicalType, SqlValue, TableId, Timestamp,
};
use crate::flow::model::Flow;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct TableRecord {
    pub id: TableId,
    pub name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct ColumnRecord {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    pub r#type: String,
    pub required: bool,
    pub materialized: bool,
    pub ordinal: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub name: String,
    pub method: String,
    pub path: String,
    pub flow_definition: Json<Flow>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct AuthSettingsRecord {
    pub id: String,
    pub method: String,
    pub config: Json<Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A column as the physical store sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalColumn {
    pub name: String,
    pub logical_type: LogicalType,
    pub required: bool,
}

/// Shape of a single-table SELECT against a user table
#[derive(Debug, Clone, Default)]
pub struct RowQuery {
    /// Columns to return, together with the type used to decode them
    pub columns: Vec<(String, LogicalType)>,
    /// Equality predicates, ANDed together
    pub filters: Vec<(String, SqlValue)>,
    /// Column name and whether to sort descending
    pub order_by: Option<(String, bool)>,
    pub limit: Option<i64>,
}

pub type RowData = Map<String, Value>;

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug)]
pub enum Error {
    UniqueConstraintViolation(sqlx::Error),
    FKConstraintViolation(sqlx::Error),

    // All other errors
    SqlxError(sqlx::Error),
}

impl Error {
    /// Whether the statement was rejected by the database itself (constraint,
    /// type or syntax problem), as opposed to the store being unreachable.
    pub fn is_rejection(&self) -> bool {
        match self {
            Error::UniqueConstraintViolation(_) | Error::FKConstraintViolation(_) => true,
            Error::SqlxError(e) => matches!(
                e,
                sqlx::Error::Database(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UniqueConstraintViolation(e)
            | Error::FKConstraintViolation(e)
            | Error::SqlxError(e) => write!(f, "{e}"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait Repository: Send + Sync + Debug {
    async fn setup(&self) -> Result<(), Error>;

    // Catalog: tables and columns

    async fn create_table(
        &self,
        table: &TableRecord,
        columns: &[ColumnRecord],
    ) -> Result<(), Error>;

    async fn get_table(&self, table_id: TableId) -> Result<TableRecord, Error>;

    async fn get_table_by_name(&self, name: &str) -> Result<TableRecord, Error>;

    async fn list_tables(&self) -> Result<Vec<TableRecord>, Error>;

    async fn get_columns(&self, table_id: TableId) -> Result<Vec<ColumnRecord>, Error>;

    async fn list_all_columns(&self) -> Result<Vec<ColumnRecord>, Error>;

    async fn insert_columns(&self, columns: &[ColumnRecord]) -> Result<(), Error>;

    async fn mark_columns_materialized(
        &self,
        column_ids: &[ColumnId],
        updated_at: Timestamp,
    ) -> Result<u64, Error>;

    async fn touch_table(
        &self,
        table_id: TableId,
        updated_at: Timestamp,
    ) -> Result<(), Error>;

    async fn delete_table(&self, table_id: TableId) -> Result<(), Error>;

    // Catalog: endpoints

    async fn create_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), Error>;

    async fn get_endpoint(&self, endpoint_id: EndpointId) -> Result<EndpointRecord, Error>;

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, Error>;

    async fn update_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), Error>;

    async fn delete_endpoint(&self, endpoint_id: EndpointId) -> Result<(), Error>;

    // Catalog: auth settings

    async fn get_auth_settings(&self, key: &str) -> Result<AuthSettingsRecord, Error>;

    async fn upsert_auth_settings(
        &self,
        settings: &AuthSettingsRecord,
    ) -> Result<AuthSettingsRecord, Error>;

    // Physical tables

    async fn physical_table_exists(&self, name: &str) -> Result<bool, Error>;

    async fn physical_column_names(&self, table_name: &str) -> Result<Vec<String>, Error>;

    async fn create_physical_table(
        &self,
        name: &str,
        columns: &[PhysicalColumn],
    ) -> Result<(), Error>;

    async fn add_physical_column(
        &self,
        table_name: &str,
        column: &PhysicalColumn,
    ) -> Result<(), Error>;

    async fn drop_physical_table(&self, name: &str) -> Result<(), Error>;

    // Rows

    async fn select_rows(&self, table_name: &str, query: &RowQuery) -> Result<Vec<RowData>, Error>;

    async fn insert_row(
        &self,
        table_name: &str,
        values: Vec<(String, SqlValue)>,
        returning: &[(String, LogicalType)],
    ) -> Result<RowData, Error>;

    async fn update_rows(
        &self,
        table_name: &str,
        values: Vec<(String, SqlValue)>,
        filters: Vec<(String, SqlValue)>,
    ) -> Result<u64, Error>;

    async fn delete_rows(
        &self,
        table_name: &str,
        filters: Vec<(String, SqlValue)>,
    ) -> Result<u64, Error>;
}

/// Quote an identifier for use in generated DDL/DML. Names are validated by the
/// catalog before they get here; quoting still keeps reserved words usable.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
