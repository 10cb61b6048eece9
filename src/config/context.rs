use std::sync::Arc;

use tracing::{info, warn};

#[cfg(feature = "catalog-postgres")]
use crate::repository::postgres::PostgresRepository;

use crate::{
    catalog::{CatalogResult, RepositoryStore},
    context::FlowcoreContext,
    flow::FlowInterpreter,
    repository::{interface::Repository, sqlite::SqliteRepository},
    resolver::EndpointResolver,
    sync::SchemaSynchronizer,
};

use super::schema;

async fn build_repository(config: &schema::FlowcoreConfig) -> CatalogResult<Arc<dyn Repository>> {
    Ok(match &config.catalog {
        #[cfg(feature = "catalog-postgres")]
        schema::Catalog::Postgres(schema::Postgres { dsn, schema }) => {
            Arc::new(PostgresRepository::try_new(dsn.to_string(), schema.to_string()).await?)
        }
        schema::Catalog::Sqlite(schema::Sqlite { dsn, journal_mode }) => {
            Arc::new(SqliteRepository::try_new(dsn.to_string(), *journal_mode).await?)
        }
    })
}

/// Connect to the catalog database, run its migrations and wire up the
/// context. Tables left half-synchronized by a previous run are reconciled.
pub async fn build_context(cfg: schema::FlowcoreConfig) -> CatalogResult<FlowcoreContext> {
    let repository = build_repository(&cfg).await?;
    let store = Arc::new(RepositoryStore {
        repository: repository.clone(),
    });

    let sync = Arc::new(SchemaSynchronizer::new(
        repository.clone(),
        store.clone(),
        cfg.runtime.ddl_timeout(),
    ));

    match sync.reconcile().await {
        Ok(report) => info!(
            "Reconciled {} table(s): {} orphaned, {} column(s) materialized, {} still pending",
            report.tables_checked,
            report.orphaned_tables.len(),
            report.columns_materialized.len(),
            report.columns_pending.len()
        ),
        Err(e) => warn!("Startup reconciliation failed: {e}"),
    }

    Ok(FlowcoreContext {
        request_timeout: cfg.runtime.request_timeout(),
        config: cfg,
        repository,
        tables: store.clone(),
        endpoints: store.clone(),
        auth_settings: store.clone(),
        resolver: EndpointResolver::new(store),
        interpreter: FlowInterpreter::new(sync.clone()),
        sync,
    })
}
