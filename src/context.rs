//! The process-wide handle on everything a request needs: the catalog stores,
//! the schema synchronizer, the endpoint resolver and the interpreter.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{
    AuthMethod, AuthSettings, AuthSettingsStore, CatalogError, ColumnDefinition,
    Endpoint, EndpointStore, HttpMethod, Table, TableStore,
};
use crate::config::schema::FlowcoreConfig;
use crate::data_types::{EndpointId, LogicalType, TableId};
use crate::flow::{
    validate, ExecutionError, Flow, FlowInterpreter, FlowRequest, FlowResponse,
    FlowValidationError,
};
use crate::repository::interface::Repository;
use crate::resolver::{normalize_path, EndpointResolver};
use crate::sync::import::ImportReport;
use crate::sync::{AddColumnsReport, ReconciliationReport, SchemaSynchronizer, SyncError};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    InvalidFlow(#[from] FlowValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("No endpoint matches {method} {path}")]
    EndpointNotFound { method: String, path: String },
}

pub type Result<T, E = ContextError> = std::result::Result<T, E>;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CreateEndpoint {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    pub flow: Flow,
}

/// Partial endpoint update, absent fields are kept
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct UpdateEndpoint {
    pub name: Option<String>,
    pub method: Option<HttpMethod>,
    pub path: Option<String>,
    pub flow: Option<Flow>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthField {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    pub required: bool,
}

/// User fields offered by the auth editor
pub const AUTH_FIELDS: [AuthField; 4] = [
    AuthField {
        name: "email",
        logical_type: LogicalType::Text,
        required: true,
    },
    AuthField {
        name: "username",
        logical_type: LogicalType::Text,
        required: false,
    },
    AuthField {
        name: "avatar_url",
        logical_type: LogicalType::Text,
        required: false,
    },
    AuthField {
        name: "created_at",
        logical_type: LogicalType::Timestamp,
        required: true,
    },
];

pub struct FlowcoreContext {
    pub config: FlowcoreConfig,
    pub repository: Arc<dyn Repository>,
    pub tables: Arc<dyn TableStore>,
    pub endpoints: Arc<dyn EndpointStore>,
    pub auth_settings: Arc<dyn AuthSettingsStore>,
    pub sync: Arc<SchemaSynchronizer>,
    pub resolver: EndpointResolver,
    pub interpreter: FlowInterpreter,
    pub request_timeout: Duration,
}

fn checked_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CatalogError::Validation {
            reason: "Endpoint name must not be empty".to_string(),
        }
        .into());
    }
    Ok(name.to_string())
}

fn checked_path(path: &str) -> Result<String> {
    normalize_path(path).map_err(|reason| CatalogError::Validation { reason }.into())
}

impl FlowcoreContext {
    // Tables

    pub async fn list_tables(&self) -> Result<Vec<Table>> {
        Ok(self.tables.list().await?)
    }

    pub async fn get_table(&self, id: TableId) -> Result<Table> {
        Ok(self.tables.get(id).await?)
    }

    pub async fn create_table(&self, request: &CreateTable) -> Result<Table> {
        Ok(self
            .sync
            .create_physical(request.name.trim(), &request.columns)
            .await?)
    }

    pub async fn add_columns(
        &self,
        id: TableId,
        columns: &[ColumnDefinition],
    ) -> Result<AddColumnsReport> {
        Ok(self.sync.add_physical_columns(id, columns).await?)
    }

    pub async fn delete_table(&self, id: TableId) -> Result<()> {
        let table = self.tables.get(id).await?;
        Ok(self.sync.drop_physical(&table.name).await?)
    }

    pub async fn import_csv(&self, id: TableId, csv_data: &str) -> Result<ImportReport> {
        Ok(self.sync.import_csv(id, csv_data).await?)
    }

    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        Ok(self.sync.reconcile().await?)
    }

    // Endpoints

    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.list().await?)
    }

    pub async fn get_endpoint(&self, id: EndpointId) -> Result<Endpoint> {
        Ok(self.endpoints.get(id).await?)
    }

    /// Dry run of the checks a stored flow has to pass
    pub fn validate_flow(&self, flow: &Flow) -> Result<()> {
        Ok(validate(flow)?)
    }

    pub async fn create_endpoint(&self, request: &CreateEndpoint) -> Result<Endpoint> {
        let name = checked_name(&request.name)?;
        let path = checked_path(&request.path)?;
        validate(&request.flow)?;

        let endpoint = self
            .endpoints
            .create(&name, request.method, &path, &request.flow)
            .await?;
        self.resolver.invalidate().await;
        Ok(endpoint)
    }

    pub async fn update_endpoint(&self, id: EndpointId, update: &UpdateEndpoint) -> Result<Endpoint> {
        let mut endpoint = self.endpoints.get(id).await?;

        if let Some(name) = &update.name {
            endpoint.name = checked_name(name)?;
        }
        if let Some(method) = update.method {
            endpoint.method = method;
        }
        if let Some(path) = &update.path {
            endpoint.path = checked_path(path)?;
        }
        if let Some(flow) = &update.flow {
            validate(flow)?;
            endpoint.flow = flow.clone();
        }

        let endpoint = self.endpoints.update(&endpoint).await?;
        self.resolver.invalidate().await;
        Ok(endpoint)
    }

    pub async fn delete_endpoint(&self, id: EndpointId) -> Result<()> {
        self.endpoints.delete(id).await?;
        self.resolver.invalidate().await;
        Ok(())
    }

    // Auth settings

    pub async fn get_auth_settings(&self) -> Result<AuthSettings> {
        Ok(self.auth_settings.get().await?)
    }

    pub async fn update_auth_settings(&self, method: AuthMethod, config: Value) -> Result<AuthSettings> {
        Ok(self.auth_settings.update(method, config).await?)
    }

    // Runtime

    /// Resolve `(method, path)` to an endpoint and run its flow
    pub async fn execute(
        &self,
        method: HttpMethod,
        path: &str,
        mut request: FlowRequest,
    ) -> Result<FlowResponse> {
        let resolved = self
            .resolver
            .resolve(method, path)
            .await?
            .ok_or_else(|| ContextError::EndpointNotFound {
                method: method.to_string(),
                path: path.to_string(),
            })?;

        let endpoint = resolved.endpoint;
        debug!(
            "Dispatching {method} {path} to endpoint {:?} ({})",
            endpoint.name, endpoint.id
        );
        request.path_params.extend(resolved.path_params);

        let deadline = Instant::now() + self.request_timeout;
        match self.interpreter.execute(&endpoint.flow, &request, deadline).await {
            Ok(response) => {
                info!("{method} {path} answered {} by endpoint {:?}", response.status, endpoint.name);
                Ok(response)
            }
            Err(e) => {
                warn!("{method} {path} failed in endpoint {:?}: {e}", endpoint.name);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
pub mod test_utils {
    use crate::config::context::build_context;
    use crate::config::schema::{Catalog, FlowcoreConfig, Sqlite};
    use sqlx::sqlite::SqliteJournalMode;

    use super::FlowcoreContext;

    pub async fn in_memory_context() -> FlowcoreContext {
        let config = FlowcoreConfig {
            catalog: Catalog::Sqlite(Sqlite {
                dsn: "sqlite::memory:".to_string(),
                journal_mode: SqliteJournalMode::Wal,
            }),
            ..Default::default()
        };
        build_context(config).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::flow::model::{Connection, Node, NodeKind};
    use crate::flow::NodeFailure;

    use super::test_utils::in_memory_context;
    use super::*;

    fn echo_flow(param: &str) -> Flow {
        Flow {
            nodes: vec![
                Node::new("start", NodeKind::Start, "Start", json!({}))
                    .with_output("out", param, "any"),
                Node::new("done", NodeKind::Response, "Done", json!({}))
                    .with_input("in", "data", "any"),
            ],
            connections: vec![Connection::new("c1", ("start", "out"), ("done", "in"))],
        }
    }

    fn create(name: &str, method: HttpMethod, path: &str, flow: Flow) -> CreateEndpoint {
        CreateEndpoint {
            name: name.to_string(),
            method,
            path: path.to_string(),
            flow,
        }
    }

    #[tokio::test]
    async fn test_endpoint_lifecycle() {
        let context = in_memory_context().await;

        let endpoint = context
            .create_endpoint(&create("user", HttpMethod::Get, "users//{id}/", echo_flow("id")))
            .await
            .unwrap();
        assert_eq!(endpoint.path, "/users/{id}");

        let response = context
            .execute(HttpMethod::Get, "/users/42", FlowRequest::default())
            .await
            .unwrap();
        assert_eq!(response.body, json!("42"));

        // The resolver cache is refreshed after updates
        context
            .update_endpoint(
                endpoint.id,
                &UpdateEndpoint {
                    path: Some("/people/:id".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = context
            .execute(HttpMethod::Get, "/users/42", FlowRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::EndpointNotFound { .. }));
        let response = context
            .execute(HttpMethod::Get, "/people/7", FlowRequest::default())
            .await
            .unwrap();
        assert_eq!(response.body, json!("7"));

        let stored = context.get_endpoint(endpoint.id).await.unwrap();
        assert_eq!(stored.name, "user");
        assert_eq!(stored.flow, echo_flow("id"));

        context.delete_endpoint(endpoint.id).await.unwrap();
        assert!(context.list_endpoints().await.unwrap().is_empty());
        let err = context
            .execute(HttpMethod::Get, "/people/7", FlowRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::EndpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_endpoint_checks() {
        let context = in_memory_context().await;

        let err = context
            .create_endpoint(&create("broken", HttpMethod::Post, "/x", Flow::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidFlow(_)));

        let err = context
            .create_endpoint(&create(" ", HttpMethod::Post, "/x", echo_flow("body")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Endpoint name must not be empty");

        let err = context
            .create_endpoint(&create("x", HttpMethod::Post, "/a%2Fb", echo_flow("body")))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Catalog(CatalogError::Validation { .. })));

        context
            .create_endpoint(&create("x", HttpMethod::Post, "/x", echo_flow("body")))
            .await
            .unwrap();
        let err = context
            .create_endpoint(&create("again", HttpMethod::Post, "/x/", echo_flow("body")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::Catalog(CatalogError::EndpointAlreadyExists { .. })
        ));

        assert!(context.validate_flow(&echo_flow("body")).is_ok());
    }

    #[tokio::test]
    async fn test_table_operations_through_flow() {
        let context = in_memory_context().await;
        let table = context
            .create_table(&CreateTable {
                name: "notes".to_string(),
                columns: vec![ColumnDefinition {
                    name: "body".to_string(),
                    logical_type: LogicalType::Text,
                    required: true,
                }],
            })
            .await
            .unwrap();

        let report = context
            .import_csv(table.id, "body\nfirst\nsecond\n")
            .await
            .unwrap();
        assert_eq!(report.rows_imported, 2);

        let flow = Flow {
            nodes: vec![
                Node::new("start", NodeKind::Start, "Start", json!({}))
                    .with_output("out", "query", "any"),
                Node::new("db", NodeKind::Database, "Notes", json!({"table": "notes", "orderBy": "-body"}))
                    .with_input("in", "where", "any")
                    .with_output("rows", "rows", "list<record>"),
                Node::new("done", NodeKind::Response, "Done", json!({}))
                    .with_input("in", "data", "any"),
            ],
            connections: vec![
                Connection::new("c1", ("start", "out"), ("db", "in")),
                Connection::new("c2", ("db", "rows"), ("done", "in")),
            ],
        };
        context
            .create_endpoint(&create("notes", HttpMethod::Get, "/notes", flow))
            .await
            .unwrap();

        let response = context
            .execute(HttpMethod::Get, "/notes", FlowRequest::default())
            .await
            .unwrap();
        assert_eq!(response.body, json!([{"body": "second"}, {"body": "first"}]));

        context.delete_table(table.id).await.unwrap();
        let err = context
            .execute(HttpMethod::Get, "/notes", FlowRequest::default())
            .await
            .unwrap_err();
        let ContextError::Execution(e) = err else {
            panic!("expected an execution error")
        };
        assert_eq!(e.kind, NodeFailure::Query);
    }

    #[tokio::test]
    async fn test_auth_settings() {
        let context = in_memory_context().await;
        assert_eq!(context.get_auth_settings().await.unwrap().method, AuthMethod::Email);

        let settings = context
            .update_auth_settings(AuthMethod::Oauth, json!({"provider": "github"}))
            .await
            .unwrap();
        assert_eq!(settings.config, json!({"provider": "github"}));
        assert_eq!(context.get_auth_settings().await.unwrap(), settings);
    }
}
