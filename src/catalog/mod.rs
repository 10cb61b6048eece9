use std::collections::HashSet;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::data_types::{ColumnId, EndpointId, LogicalType, TableId, Timestamp};
use crate::flow::model::Flow;
use crate::repository::interface::{ColumnRecord, TableRecord};

mod repository;

pub use repository::RepositoryStore;

/// Well-known key of the one auth settings record
pub const AUTH_SETTINGS_KEY: &str = "default";

pub const MAX_IDENTIFIER_LENGTH: usize = 63;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{reason}")]
    Validation { reason: String },

    // Table errors
    #[error("Table {name:?} doesn't exist")]
    TableDoesNotExist { name: String },

    #[error("Table {name:?} already exists")]
    TableAlreadyExists { name: String },

    #[error("Column {name:?} already exists in table {table:?} with a different definition")]
    ColumnAlreadyExists { table: String, name: String },

    // Endpoint errors
    #[error("Endpoint {id} doesn't exist")]
    EndpointDoesNotExist { id: EndpointId },

    #[error("An endpoint for {method} {path} already exists")]
    EndpointAlreadyExists { method: String, path: String },

    #[error("Internal SQL error: {0:?}")]
    SqlxError(sqlx::Error),

    #[error("Failed parsing JSON: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

pub(crate) fn validation<T>(reason: impl Into<String>) -> CatalogResult<T> {
    Err(CatalogError::Validation {
        reason: reason.into(),
    })
}

/// A column as requested by an administrator
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    pub required: bool,
    /// Whether the column physically exists yet
    pub materialized: bool,
    pub ordinal: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<Column>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Column {
    pub fn definition(&self) -> ColumnDefinition {
        ColumnDefinition {
            name: self.name.clone(),
            logical_type: self.logical_type,
            required: self.required,
        }
    }
}

impl TryFrom<ColumnRecord> for Column {
    type Error = CatalogError;

    fn try_from(record: ColumnRecord) -> CatalogResult<Self> {
        let logical_type = record.r#type.parse().map_err(|_| CatalogError::Validation {
            reason: format!(
                "Column {:?} has an unsupported stored type {:?}",
                record.name, record.r#type
            ),
        })?;

        Ok(Self {
            id: record.id,
            table_id: record.table_id,
            name: record.name,
            logical_type,
            required: record.required,
            materialized: record.materialized,
            ordinal: record.ordinal,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl Table {
    pub(crate) fn from_records(
        table: TableRecord,
        columns: Vec<ColumnRecord>,
    ) -> CatalogResult<Self> {
        Ok(Self {
            id: table.id,
            name: table.name,
            columns: columns
                .into_iter()
                .map(Column::try_from)
                .collect::<CatalogResult<_>>()?,
            created_at: table.created_at,
            updated_at: table.updated_at,
        })
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns that row operations may touch
    pub fn materialized_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.materialized)
    }
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    pub flow: Flow,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AuthMethod {
    Email,
    Oauth,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthSettings {
    pub id: String,
    pub method: AuthMethod,
    pub config: Value,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            id: AUTH_SETTINGS_KEY.to_string(),
            method: AuthMethod::Email,
            config: Value::Object(Default::default()),
            created_at: None,
            updated_at: None,
        }
    }
}

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new("^[a-z_][a-z0-9_]*$").expect("valid regex");

    // Keywords that are reserved in PostgreSQL or SQLite (or both)
    static ref RESERVED_WORDS: HashSet<&'static str> = HashSet::from([
        "abort", "add", "all", "alter", "analyze", "and", "any", "array", "as", "asc",
        "asymmetric", "attach", "autoincrement", "between", "both", "by", "case", "cast",
        "check", "collate", "column", "commit", "constraint", "create", "cross",
        "current_date", "current_role", "current_time", "current_timestamp",
        "current_user", "default", "deferrable", "delete", "desc", "detach", "distinct",
        "do", "drop", "else", "end", "escape", "except", "exists", "false", "fetch",
        "for", "foreign", "from", "full", "grant", "group", "having", "in", "index",
        "initially", "inner", "insert", "intersect", "into", "is", "isnull", "join",
        "lateral", "leading", "left", "like", "limit", "localtime", "localtimestamp",
        "natural", "not", "notnull", "null", "offset", "on", "only", "or", "order",
        "outer", "placing", "pragma", "primary", "references", "returning", "right",
        "rowid", "select", "session_user", "set", "some", "symmetric", "table", "then",
        "to", "trailing", "transaction", "true", "union", "unique", "update", "user",
        "using", "vacuum", "values", "variadic", "view", "when", "where", "window", "with",
    ]);

    static ref CATALOG_TABLES: HashSet<&'static str> = HashSet::from([
        "meta_tables", "meta_columns", "meta_endpoints", "meta_auth_settings",
        "_sqlx_migrations",
    ]);
}

/// Check that a user-supplied name is safe to splice (quoted) into DDL
pub fn validate_identifier(kind: &str, name: &str) -> CatalogResult<()> {
    if name.is_empty() {
        return validation(format!("{kind} name must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return validation(format!(
            "{kind} name {name:?} is longer than {MAX_IDENTIFIER_LENGTH} characters"
        ));
    }
    if !IDENTIFIER.is_match(name) {
        return validation(format!(
            "{kind} name {name:?} must start with a lowercase letter or underscore \
            and contain only lowercase letters, digits and underscores"
        ));
    }
    if RESERVED_WORDS.contains(name) {
        return validation(format!("{kind} name {name:?} is a reserved word"));
    }
    Ok(())
}

pub fn validate_table_name(name: &str) -> CatalogResult<()> {
    validate_identifier("Table", name)?;
    if CATALOG_TABLES.contains(name) || name.starts_with("sqlite_") || name.starts_with("pg_")
    {
        return validation(format!("Table name {name:?} is reserved for internal use"));
    }
    Ok(())
}

/// Validate the columns of a single create/add request: names and no duplicates
pub fn validate_column_definitions(columns: &[ColumnDefinition]) -> CatalogResult<()> {
    if columns.is_empty() {
        return validation("At least one column is required");
    }

    let mut seen = HashSet::new();
    for column in columns {
        validate_identifier("Column", &column.name)?;
        if !seen.insert(column.name.as_str()) {
            return validation(format!(
                "Column {:?} is listed more than once",
                column.name
            ));
        }
    }
    Ok(())
}

#[async_trait]
pub trait TableStore: Sync + Send {
    /// Record a new table with all its columns not yet materialized
    async fn create(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
    ) -> CatalogResult<Table>;

    async fn get(&self, id: TableId) -> CatalogResult<Table>;

    async fn get_by_name(&self, name: &str) -> CatalogResult<Table>;

    async fn list(&self) -> CatalogResult<Vec<Table>>;

    /// Append columns to an existing table, not yet materialized
    async fn add_columns(
        &self,
        table: &Table,
        columns: &[ColumnDefinition],
    ) -> CatalogResult<Vec<Column>>;

    async fn mark_materialized(&self, table: &Table, column_ids: &[ColumnId]) -> CatalogResult<()>;

    async fn delete(&self, id: TableId) -> CatalogResult<()>;
}

#[async_trait]
pub trait EndpointStore: Sync + Send {
    async fn create(
        &self,
        name: &str,
        method: HttpMethod,
        path: &str,
        flow: &Flow,
    ) -> CatalogResult<Endpoint>;

    async fn get(&self, id: EndpointId) -> CatalogResult<Endpoint>;

    /// Newest first
    async fn list(&self) -> CatalogResult<Vec<Endpoint>>;

    async fn update(&self, endpoint: &Endpoint) -> CatalogResult<Endpoint>;

    async fn delete(&self, id: EndpointId) -> CatalogResult<()>;
}

#[async_trait]
pub trait AuthSettingsStore: Sync + Send {
    async fn get(&self) -> CatalogResult<AuthSettings>;

    async fn update(&self, method: AuthMethod, config: Value) -> CatalogResult<AuthSettings>;
}
