//! Keeps the physical user tables in lockstep with the table catalog and runs
//! row operations against them.
//!
//! Catalog writes always happen first: a new table or column is recorded as
//! not yet materialized, the DDL is attempted, and only then is it marked as
//! materialized. Dropping goes the other way round (physical first), so a crash
//! can at worst leave a catalog row without a physical table, which
//! [`SchemaSynchronizer::reconcile`] reports.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::catalog::{
    validate_column_definitions, CatalogError, Column, ColumnDefinition, Table, TableStore,
};
use crate::data_types::{ColumnId, LogicalType, SqlValue, TableId};
use crate::repository::interface::{
    Error as RepositoryError, PhysicalColumn, Repository, RowData, RowQuery,
};

pub mod import;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Table {table:?} is only partially synchronized: {reason}")]
    PartialFailure {
        table: String,
        reason: String,
        /// Columns that made it to the physical table
        materialized: Vec<String>,
        /// Columns recorded in the catalog but not physically present
        pending: Vec<String>,
    },

    #[error("Timed out after {timeout:?} while {action}")]
    Timeout { action: String, timeout: Duration },

    #[error("Storage error: {0}")]
    Storage(RepositoryError),

    #[error("Table {table:?} has no column {column:?}")]
    UnknownColumn { table: String, column: String },
}

impl From<RepositoryError> for SyncError {
    fn from(err: RepositoryError) -> Self {
        SyncError::Storage(err)
    }
}

pub type SyncResult<T, E = SyncError> = Result<T, E>;

fn invalid(reason: String) -> SyncError {
    SyncError::Catalog(CatalogError::Validation { reason })
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AddColumnsReport {
    pub table: Table,
    pub added: Vec<String>,
    /// Columns that already existed with an identical definition
    pub skipped: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconciliationReport {
    pub tables_checked: usize,
    /// Catalog tables with no physical table behind them
    pub orphaned_tables: Vec<String>,
    /// `table.column` entries that got materialized by this pass
    pub columns_materialized: Vec<String>,
    /// `table.column` entries that still aren't physical
    pub columns_pending: Vec<String>,
}

/// A row selection in terms of catalog columns and JSON values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSelect {
    /// Empty means every materialized column
    pub columns: Vec<String>,
    pub filters: Map<String, Value>,
    pub order_by: Option<(String, bool)>,
    pub limit: Option<u32>,
}

fn physical_column(column: &Column) -> PhysicalColumn {
    PhysicalColumn {
        name: column.name.clone(),
        logical_type: column.logical_type,
        required: column.required,
    }
}

fn qualified(table: &Table, column: &Column) -> String {
    format!("{}.{}", table.name, column.name)
}

fn resolve_column<'a>(table: &'a Table, name: &str) -> SyncResult<&'a Column> {
    table
        .materialized_columns()
        .find(|c| c.name == name)
        .ok_or_else(|| SyncError::UnknownColumn {
            table: table.name.clone(),
            column: name.to_string(),
        })
}

fn bind_values(table: &Table, values: &Map<String, Value>) -> SyncResult<Vec<(String, SqlValue)>> {
    values
        .iter()
        .map(|(name, value)| {
            let column = resolve_column(table, name)?;
            let value = column
                .logical_type
                .coerce(value)
                .map_err(|reason| invalid(format!("Column {name:?}: {reason}")))?;
            Ok((name.clone(), value))
        })
        .collect()
}

fn returning(table: &Table) -> Vec<(String, LogicalType)> {
    table
        .materialized_columns()
        .map(|c| (c.name.clone(), c.logical_type))
        .collect()
}

pub struct SchemaSynchronizer {
    repository: Arc<dyn Repository>,
    tables: Arc<dyn TableStore>,
    // Schema changes take the write side, row traffic the read side
    locks: DashMap<String, Arc<RwLock<()>>>,
    ddl_timeout: Duration,
}

impl SchemaSynchronizer {
    pub fn new(
        repository: Arc<dyn Repository>,
        tables: Arc<dyn TableStore>,
        ddl_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            tables,
            locks: DashMap::new(),
            ddl_timeout,
        }
    }

    pub fn tables(&self) -> &Arc<dyn TableStore> {
        &self.tables
    }

    fn lock(&self, table_name: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(table_name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) async fn write_lock(&self, table_name: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock(table_name).write_owned().await
    }

    async fn read_lock(&self, table_name: &str) -> OwnedRwLockReadGuard<()> {
        self.lock(table_name).read_owned().await
    }

    async fn ddl<F>(&self, action: String, statement: F) -> SyncResult<()>
    where
        F: Future<Output = Result<(), RepositoryError>>,
    {
        match tokio::time::timeout(self.ddl_timeout, statement).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout {
                action,
                timeout: self.ddl_timeout,
            }),
        }
    }

    /// Record a table in the catalog and create it physically. If the physical
    /// table can't be created, the catalog entry is removed again.
    pub async fn create_physical(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
    ) -> SyncResult<Table> {
        let _guard = self.write_lock(name).await;

        let table = self.tables.create(name, columns).await?;
        let physical: Vec<PhysicalColumn> = table.columns.iter().map(physical_column).collect();

        let created = self
            .ddl(
                format!("creating table {name:?}"),
                self.repository.create_physical_table(name, &physical),
            )
            .await;

        if let Err(e) = created {
            warn!("Could not create physical table {name:?}, rolling back its catalog entry: {e}");

            // A timed out CREATE may still have gone through
            if matches!(e, SyncError::Timeout { .. }) {
                if let Err(drop_error) = self.repository.drop_physical_table(name).await {
                    warn!("Could not clean up physical table {name:?}: {drop_error}");
                }
            }

            if let Err(rollback) = self.tables.delete(table.id).await {
                error!("Could not roll back catalog entry of table {name:?}: {rollback}");
                return Err(SyncError::PartialFailure {
                    table: name.to_string(),
                    reason: format!("{e}; removing the catalog entry failed too: {rollback}"),
                    materialized: vec![],
                    pending: table.columns.iter().map(|c| c.name.clone()).collect(),
                });
            }
            return Err(e);
        }

        let ids: Vec<_> = table.columns.iter().map(|c| c.id).collect();
        if let Err(e) = self.tables.mark_materialized(&table, &ids).await {
            return Err(self.partial_failure(&table, e.to_string(), &ids).await);
        }

        info!("Created table {name:?} with {} column(s)", table.columns.len());
        Ok(self.tables.get(table.id).await?)
    }

    /// Append columns to a table. Columns that already exist with the same
    /// definition are skipped; required columns can't be added to an existing
    /// table.
    pub async fn add_physical_columns(
        &self,
        table_id: TableId,
        columns: &[ColumnDefinition],
    ) -> SyncResult<AddColumnsReport> {
        validate_column_definitions(columns)?;

        let name = self.tables.get(table_id).await?.name;
        let _guard = self.write_lock(&name).await;
        // Re-read under the lock, another change may have won the race
        let table = self.tables.get(table_id).await?;

        let mut new = vec![];
        let mut skipped = vec![];
        for definition in columns {
            match table.column(&definition.name) {
                Some(existing) if existing.definition() == *definition => {
                    skipped.push(definition.name.clone())
                }
                Some(_) => {
                    return Err(CatalogError::ColumnAlreadyExists {
                        table: table.name.clone(),
                        name: definition.name.clone(),
                    }
                    .into())
                }
                None if definition.required => {
                    return Err(invalid(format!(
                        "Column {:?} can't be added as required to an existing table",
                        definition.name
                    )))
                }
                None => new.push(definition.clone()),
            }
        }

        let added = self.tables.add_columns(&table, &new).await?;
        for column in &added {
            let result = match self
                .ddl(
                    format!("adding column {:?} to table {:?}", column.name, table.name),
                    self.repository
                        .add_physical_column(&table.name, &physical_column(column)),
                )
                .await
            {
                Ok(()) => self
                    .tables
                    .mark_materialized(&table, &[column.id])
                    .await
                    .map_err(SyncError::from),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                let ids: Vec<_> = added.iter().map(|c| c.id).collect();
                let failure = self.partial_failure(&table, e.to_string(), &ids).await;
                if let SyncError::PartialFailure { ref pending, .. } = failure {
                    if !pending.is_empty() {
                        return Err(failure);
                    }
                }
                // Reconciliation caught up, nothing is left pending
                warn!("Columns of table {:?} were materialized on a second attempt", table.name);
                break;
            }
        }

        if !added.is_empty() {
            info!(
                "Added {} column(s) to table {:?}",
                added.len(),
                table.name
            );
        }

        Ok(AddColumnsReport {
            table: self.tables.get(table_id).await?,
            added: added.into_iter().map(|c| c.name).collect(),
            skipped,
        })
    }

    /// Drop the physical table and then its catalog entry
    pub async fn drop_physical(&self, table_name: &str) -> SyncResult<()> {
        let _guard = self.write_lock(table_name).await;
        let table = self.tables.get_by_name(table_name).await?;

        self.ddl(
            format!("dropping table {table_name:?}"),
            self.repository.drop_physical_table(table_name),
        )
        .await?;

        if let Err(e) = self.tables.delete(table.id).await {
            error!("Dropped physical table {table_name:?} but not its catalog entry: {e}");
            return Err(SyncError::PartialFailure {
                table: table_name.to_string(),
                reason: format!("the physical table was dropped but its catalog entry remains: {e}"),
                materialized: vec![],
                pending: table.columns.into_iter().map(|c| c.name).collect(),
            });
        }

        // Callers already queued on this lock still hold a reference to it
        self.locks
            .remove_if(table_name, |_, lock| Arc::strong_count(lock) <= 2);
        info!("Dropped table {table_name:?}");
        Ok(())
    }

    /// Check every catalog table against the physical schema and materialize
    /// columns that were left behind
    pub async fn reconcile(&self) -> SyncResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        for table in self.tables.list().await? {
            let _guard = self.write_lock(&table.name).await;
            let table = match self.tables.get(table.id).await {
                Ok(table) => table,
                Err(CatalogError::TableDoesNotExist { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            self.reconcile_table(&table, &mut report).await?;
        }

        info!(
            "Reconciled {} table(s): {} orphaned, {} column(s) materialized, {} pending",
            report.tables_checked,
            report.orphaned_tables.len(),
            report.columns_materialized.len(),
            report.columns_pending.len()
        );
        Ok(report)
    }

    // Caller holds the table's write lock
    async fn reconcile_table(
        &self,
        table: &Table,
        report: &mut ReconciliationReport,
    ) -> SyncResult<()> {
        report.tables_checked += 1;

        if !self.repository.physical_table_exists(&table.name).await? {
            warn!("Table {:?} is in the catalog but has no physical table", table.name);
            report.orphaned_tables.push(table.name.clone());
            report
                .columns_pending
                .extend(table.columns.iter().filter(|c| !c.materialized).map(|c| qualified(table, c)));
            return Ok(());
        }

        let pending: Vec<&Column> = table.columns.iter().filter(|c| !c.materialized).collect();
        if pending.is_empty() {
            return Ok(());
        }

        let existing: HashSet<String> = self
            .repository
            .physical_column_names(&table.name)
            .await?
            .into_iter()
            .collect();

        for column in pending {
            let present = existing.contains(&column.name)
                || match self
                    .ddl(
                        format!("adding column {:?} to table {:?}", column.name, table.name),
                        self.repository
                            .add_physical_column(&table.name, &physical_column(column)),
                    )
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Column {} is still not physical: {e}", qualified(table, column));
                        false
                    }
                };

            if present {
                self.tables.mark_materialized(table, &[column.id]).await?;
                debug!("Materialized column {}", qualified(table, column));
                report.columns_materialized.push(qualified(table, column));
            } else {
                report.columns_pending.push(qualified(table, column));
            }
        }
        Ok(())
    }

    /// Reconcile the table, then build the error describing what is still
    /// out of sync among `columns`. Caller holds the table's write lock.
    async fn partial_failure(
        &self,
        table: &Table,
        reason: String,
        columns: &[ColumnId],
    ) -> SyncError {
        error!("Table {:?} diverged from its catalog entry: {reason}", table.name);

        // The caller's snapshot may predate the columns it just inserted
        let current = self
            .tables
            .get(table.id)
            .await
            .unwrap_or_else(|_| table.clone());

        let mut report = ReconciliationReport::default();
        if let Err(e) = self.reconcile_table(&current, &mut report).await {
            warn!("Reconciliation check of table {:?} failed: {e}", table.name);
        }

        let (materialized, pending) = match self.tables.get(table.id).await {
            Ok(current) => current
                .columns
                .into_iter()
                .filter(|c| columns.contains(&c.id))
                .partition::<Vec<_>, _>(|c| c.materialized),
            Err(_) => (vec![], vec![]),
        };

        SyncError::PartialFailure {
            table: table.name.clone(),
            reason,
            materialized: materialized.into_iter().map(|c| c.name).collect(),
            pending: pending.into_iter().map(|c| c.name).collect(),
        }
    }

    async fn table_for_rows(&self, table_name: &str) -> SyncResult<Table> {
        Ok(self.tables.get_by_name(table_name).await?)
    }

    pub async fn select_rows(
        &self,
        table_name: &str,
        select: &RowSelect,
    ) -> SyncResult<Vec<RowData>> {
        let _guard = self.read_lock(table_name).await;
        let table = self.table_for_rows(table_name).await?;

        let columns = if select.columns.is_empty() {
            returning(&table)
        } else {
            select
                .columns
                .iter()
                .map(|name| resolve_column(&table, name).map(|c| (c.name.clone(), c.logical_type)))
                .collect::<SyncResult<_>>()?
        };
        if let Some((column, _)) = &select.order_by {
            resolve_column(&table, column)?;
        }

        let query = RowQuery {
            columns,
            filters: bind_values(&table, &select.filters)?,
            order_by: select.order_by.clone(),
            limit: select.limit.map(i64::from),
        };
        Ok(self.repository.select_rows(&table.name, &query).await?)
    }

    /// Insert each row and return it as stored
    pub async fn insert_rows(
        &self,
        table_name: &str,
        rows: Vec<Map<String, Value>>,
    ) -> SyncResult<Vec<RowData>> {
        let _guard = self.read_lock(table_name).await;
        let table = self.table_for_rows(table_name).await?;
        let returning = returning(&table);

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            for column in table.materialized_columns().filter(|c| c.required) {
                if row.get(&column.name).map_or(true, Value::is_null) {
                    return Err(invalid(format!("Column {:?} is required", column.name)));
                }
            }
            let values = bind_values(&table, &row)?;
            inserted.push(
                self.repository
                    .insert_row(&table.name, values, &returning)
                    .await?,
            );
        }
        Ok(inserted)
    }

    pub async fn update_rows(
        &self,
        table_name: &str,
        values: &Map<String, Value>,
        filters: &Map<String, Value>,
    ) -> SyncResult<u64> {
        let _guard = self.read_lock(table_name).await;
        let table = self.table_for_rows(table_name).await?;

        if values.is_empty() {
            return Err(invalid(format!("No values to update in table {table_name:?}")));
        }
        for column in table.materialized_columns().filter(|c| c.required) {
            if values.get(&column.name).map_or(false, Value::is_null) {
                return Err(invalid(format!("Column {:?} is required", column.name)));
            }
        }

        Ok(self
            .repository
            .update_rows(
                &table.name,
                bind_values(&table, values)?,
                bind_values(&table, filters)?,
            )
            .await?)
    }

    pub async fn delete_rows(
        &self,
        table_name: &str,
        filters: &Map<String, Value>,
    ) -> SyncResult<u64> {
        let _guard = self.read_lock(table_name).await;
        let table = self.table_for_rows(table_name).await?;

        Ok(self
            .repository
            .delete_rows(&table.name, bind_values(&table, filters)?)
            .await?)
    }
}
