use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{
    validate_column_definitions, validate_table_name, validation, AuthMethod, AuthSettings,
    AuthSettingsStore, CatalogError, CatalogResult, Column, ColumnDefinition, Endpoint,
    EndpointStore, HttpMethod, Table, TableStore, AUTH_SETTINGS_KEY,
};
use crate::data_types::{now, ColumnId, EndpointId, TableId};
use crate::flow::model::Flow;
use crate::repository::interface::{
    AuthSettingsRecord, ColumnRecord, EndpointRecord, Error as RepositoryError, Repository,
    TableRecord,
};

// The native catalog implementation, on top of the meta_* tables
pub struct RepositoryStore {
    pub repository: Arc<dyn Repository>,
}

impl From<RepositoryError> for CatalogError {
    fn from(err: RepositoryError) -> CatalogError {
        CatalogError::SqlxError(match err {
            RepositoryError::UniqueConstraintViolation(e) => e,
            RepositoryError::FKConstraintViolation(e) => e,
            RepositoryError::SqlxError(e) => e,
        })
    }
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = CatalogError;

    fn try_from(record: EndpointRecord) -> CatalogResult<Self> {
        let method = record.method.parse().map_err(|_| CatalogError::Validation {
            reason: format!("Endpoint {} has an unsupported method {:?}", record.id, record.method),
        })?;

        Ok(Self {
            id: record.id,
            name: record.name,
            method,
            path: record.path,
            flow: record.flow_definition.0,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl TryFrom<AuthSettingsRecord> for AuthSettings {
    type Error = CatalogError;

    fn try_from(record: AuthSettingsRecord) -> CatalogResult<Self> {
        let method = record.method.parse().map_err(|_| CatalogError::Validation {
            reason: format!("Unsupported auth method {:?}", record.method),
        })?;

        Ok(Self {
            id: record.id,
            method,
            config: record.config.0,
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
        })
    }
}

impl RepositoryStore {
    fn table_not_found(id: TableId) -> impl Fn(RepositoryError) -> CatalogError {
        move |e| match e {
            RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                CatalogError::TableDoesNotExist {
                    name: id.to_string(),
                }
            }
            e => e.into(),
        }
    }

    fn endpoint_errors(
        id: EndpointId,
        method: HttpMethod,
        path: &str,
    ) -> impl Fn(RepositoryError) -> CatalogError + '_ {
        move |e| match e {
            RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                CatalogError::EndpointDoesNotExist { id }
            }
            RepositoryError::UniqueConstraintViolation(_) => {
                CatalogError::EndpointAlreadyExists {
                    method: method.to_string(),
                    path: path.to_string(),
                }
            }
            e => e.into(),
        }
    }
}

#[async_trait]
impl TableStore for RepositoryStore {
    async fn create(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
    ) -> CatalogResult<Table> {
        validate_table_name(name)?;
        validate_column_definitions(columns)?;

        let ts = now();
        let table = TableRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: ts,
            updated_at: ts,
        };
        let columns: Vec<ColumnRecord> = columns
            .iter()
            .enumerate()
            .map(|(ordinal, c)| ColumnRecord {
                id: Uuid::new_v4(),
                table_id: table.id,
                name: c.name.clone(),
                r#type: c.logical_type.to_string(),
                required: c.required,
                materialized: false,
                ordinal: ordinal as i64,
                created_at: ts,
                updated_at: ts,
            })
            .collect();

        self.repository
            .create_table(&table, &columns)
            .await
            .map_err(|e| match e {
                RepositoryError::UniqueConstraintViolation(_) => {
                    CatalogError::TableAlreadyExists {
                        name: name.to_string(),
                    }
                }
                e => e.into(),
            })?;

        info!("Recorded table {name:?} ({}) in the catalog", table.id);
        Table::from_records(table, columns)
    }

    async fn get(&self, id: TableId) -> CatalogResult<Table> {
        let table = self
            .repository
            .get_table(id)
            .await
            .map_err(Self::table_not_found(id))?;
        let columns = self.repository.get_columns(id).await?;

        Table::from_records(table, columns)
    }

    async fn get_by_name(&self, name: &str) -> CatalogResult<Table> {
        let table = self
            .repository
            .get_table_by_name(name)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                    CatalogError::TableDoesNotExist {
                        name: name.to_string(),
                    }
                }
                e => e.into(),
            })?;
        let columns = self.repository.get_columns(table.id).await?;

        Table::from_records(table, columns)
    }

    async fn list(&self) -> CatalogResult<Vec<Table>> {
        let tables = self.repository.list_tables().await?;

        let mut columns: HashMap<TableId, Vec<ColumnRecord>> = HashMap::new();
        for column in self.repository.list_all_columns().await? {
            columns.entry(column.table_id).or_default().push(column);
        }

        tables
            .into_iter()
            .map(|t| {
                let table_columns = columns.remove(&t.id).unwrap_or_default();
                Table::from_records(t, table_columns)
            })
            .collect()
    }

    async fn add_columns(
        &self,
        table: &Table,
        columns: &[ColumnDefinition],
    ) -> CatalogResult<Vec<Column>> {
        if columns.is_empty() {
            return Ok(vec![]);
        }
        validate_column_definitions(columns)?;

        let next_ordinal = table
            .columns
            .iter()
            .map(|c| c.ordinal + 1)
            .max()
            .unwrap_or(0);

        let ts = now();
        let records: Vec<ColumnRecord> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| ColumnRecord {
                id: Uuid::new_v4(),
                table_id: table.id,
                name: c.name.clone(),
                r#type: c.logical_type.to_string(),
                required: c.required,
                materialized: false,
                ordinal: next_ordinal + i as i64,
                created_at: ts,
                updated_at: ts,
            })
            .collect();

        self.repository
            .insert_columns(&records)
            .await
            .map_err(|e| match e {
                RepositoryError::UniqueConstraintViolation(_) => {
                    CatalogError::ColumnAlreadyExists {
                        table: table.name.clone(),
                        name: columns
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    }
                }
                RepositoryError::FKConstraintViolation(_) => CatalogError::TableDoesNotExist {
                    name: table.name.clone(),
                },
                e => e.into(),
            })?;

        info!(
            "Recorded {} new column(s) for table {:?}",
            records.len(),
            table.name
        );
        records.into_iter().map(Column::try_from).collect()
    }

    async fn mark_materialized(
        &self,
        table: &Table,
        column_ids: &[ColumnId],
    ) -> CatalogResult<()> {
        let ts = now();
        self.repository
            .mark_columns_materialized(column_ids, ts)
            .await?;
        self.repository
            .touch_table(table.id, ts)
            .await
            .map_err(Self::table_not_found(table.id))?;
        Ok(())
    }

    async fn delete(&self, id: TableId) -> CatalogResult<()> {
        self.repository
            .delete_table(id)
            .await
            .map_err(Self::table_not_found(id))
    }
}

#[async_trait]
impl EndpointStore for RepositoryStore {
    async fn create(
        &self,
        name: &str,
        method: HttpMethod,
        path: &str,
        flow: &Flow,
    ) -> CatalogResult<Endpoint> {
        let ts = now();
        let record = EndpointRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            flow_definition: Json(flow.clone()),
            created_at: ts,
            updated_at: ts,
        };

        self.repository
            .create_endpoint(&record)
            .await
            .map_err(Self::endpoint_errors(record.id, method, path))?;

        info!("Created endpoint {method} {path} ({})", record.id);
        record.try_into()
    }

    async fn get(&self, id: EndpointId) -> CatalogResult<Endpoint> {
        self.repository
            .get_endpoint(id)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                    CatalogError::EndpointDoesNotExist { id }
                }
                e => e.into(),
            })?
            .try_into()
    }

    async fn list(&self) -> CatalogResult<Vec<Endpoint>> {
        self.repository
            .list_endpoints()
            .await?
            .into_iter()
            .map(Endpoint::try_from)
            .collect()
    }

    async fn update(&self, endpoint: &Endpoint) -> CatalogResult<Endpoint> {
        let record = EndpointRecord {
            id: endpoint.id,
            name: endpoint.name.clone(),
            method: endpoint.method.to_string(),
            path: endpoint.path.clone(),
            flow_definition: Json(endpoint.flow.clone()),
            created_at: endpoint.created_at,
            updated_at: now(),
        };

        self.repository
            .update_endpoint(&record)
            .await
            .map_err(Self::endpoint_errors(
                endpoint.id,
                endpoint.method,
                &endpoint.path,
            ))?;

        info!("Updated endpoint {} {} ({})", endpoint.method, endpoint.path, endpoint.id);
        record.try_into()
    }

    async fn delete(&self, id: EndpointId) -> CatalogResult<()> {
        self.repository
            .delete_endpoint(id)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                    CatalogError::EndpointDoesNotExist { id }
                }
                e => e.into(),
            })?;

        info!("Deleted endpoint {id}");
        Ok(())
    }
}

#[async_trait]
impl AuthSettingsStore for RepositoryStore {
    async fn get(&self) -> CatalogResult<AuthSettings> {
        match self.repository.get_auth_settings(AUTH_SETTINGS_KEY).await {
            Ok(record) => record.try_into(),
            Err(RepositoryError::SqlxError(sqlx::error::Error::RowNotFound)) => {
                Ok(AuthSettings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, method: AuthMethod, config: Value) -> CatalogResult<AuthSettings> {
        if !config.is_object() {
            return validation("Auth config must be a JSON object");
        }

        let ts = now();
        let record = AuthSettingsRecord {
            id: AUTH_SETTINGS_KEY.to_string(),
            method: method.to_string(),
            config: Json(config),
            created_at: ts,
            updated_at: ts,
        };

        let stored = self.repository.upsert_auth_settings(&record).await?;
        info!("Auth settings updated, method: {method}");
        stored.try_into()
    }
}
