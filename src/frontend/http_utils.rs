// Warp error handling and propagation
//
// Handlers return `Result<impl Reply, ApiError>` instead of rejecting: a
// rejection means "some other filter may handle this", while our errors are
// final. `ApiError` renders itself as a status code plus the JSON envelope
// `{"error": {"code", "message", "details"}}`, and `into_response` collapses
// the `Result` into a response.

use serde_json::{json, Value};
use tracing::{error, warn};
use warp::hyper::{Body, Response, StatusCode};
use warp::Reply;

use crate::auth::AuthError;
use crate::catalog::CatalogError;
use crate::context::ContextError;
use crate::flow::{ExecutionError, FlowValidationError, NodeFailure};
use crate::sync::SyncError;

#[derive(Debug)]
pub enum ApiError {
    Context(ContextError),
    Auth(AuthError),
    BadRequest(String),
    NotFound(String),
    /// The store was unreachable at startup
    Degraded,
}

impl From<ContextError> for ApiError {
    fn from(err: ContextError) -> Self {
        ApiError::Context(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

fn catalog_error(e: &CatalogError) -> (StatusCode, &'static str) {
    match e {
        CatalogError::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        CatalogError::TableDoesNotExist { .. } | CatalogError::EndpointDoesNotExist { .. } => {
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        }
        CatalogError::TableAlreadyExists { .. }
        | CatalogError::ColumnAlreadyExists { .. }
        | CatalogError::EndpointAlreadyExists { .. } => (StatusCode::CONFLICT, "CONFLICT"),
        CatalogError::SqlxError(_) | CatalogError::SerdeJsonError(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        }
    }
}

fn sync_error(e: &SyncError) -> (StatusCode, &'static str, Value) {
    match e {
        SyncError::Catalog(e) => {
            let (status, code) = catalog_error(e);
            (status, code, Value::Null)
        }
        SyncError::PartialFailure {
            table,
            materialized,
            pending,
            ..
        } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "PARTIAL_FAILURE",
            json!({"table": table, "materialized": materialized, "pending": pending}),
        ),
        SyncError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", Value::Null),
        SyncError::UnknownColumn { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", Value::Null),
        SyncError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", Value::Null),
    }
}

fn invalid_flow(e: &FlowValidationError) -> Value {
    json!({ "violations": e.violations })
}

fn execution_error(e: &ExecutionError) -> (StatusCode, &'static str, Value) {
    let (status, code) = match e.kind {
        NodeFailure::InvalidInput => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        NodeFailure::Query => (StatusCode::UNPROCESSABLE_ENTITY, "QUERY_ERROR"),
        NodeFailure::Storage | NodeFailure::NoResponse => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        }
        NodeFailure::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        NodeFailure::InvalidFlow => (StatusCode::INTERNAL_SERVER_ERROR, "INVALID_FLOW"),
    };
    (
        status,
        code,
        json!({"node_id": e.node_id, "node_label": e.node_label, "kind": e.kind}),
    )
}

impl ApiError {
    fn status_code_body(self) -> (StatusCode, Value) {
        let (status, code, message, details) = match &self {
            ApiError::Context(ContextError::Catalog(e)) => {
                let (status, code) = catalog_error(e);
                (status, code, e.to_string(), Value::Null)
            }
            ApiError::Context(ContextError::Sync(e)) => {
                let (status, code, details) = sync_error(e);
                (status, code, e.to_string(), details)
            }
            ApiError::Context(ContextError::InvalidFlow(e)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                e.to_string(),
                invalid_flow(e),
            ),
            ApiError::Context(ContextError::Execution(e)) => {
                let (status, code, details) = execution_error(e);
                (status, code, e.to_string(), details)
            }
            ApiError::Context(e @ ContextError::EndpointNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string(), Value::Null)
            }
            ApiError::Auth(AuthError::Unauthorized) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "An admin token is required".to_string(),
                Value::Null,
            ),
            ApiError::Auth(AuthError::WrongPassword) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "The admin token is not valid".to_string(),
                Value::Null,
            ),
            ApiError::Auth(AuthError::Disabled) => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "The admin API is disabled".to_string(),
                Value::Null,
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                message.clone(),
                Value::Null,
            ),
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", message.clone(), Value::Null)
            }
            ApiError::Degraded => (
                StatusCode::SERVICE_UNAVAILABLE,
                "DEGRADED",
                "The catalog database is unavailable".to_string(),
                Value::Null,
            ),
        };

        if status.is_server_error() {
            error!("Request failed with {status}: {message}");
        } else {
            warn!("Request failed with {status}: {message}");
        }

        (
            status,
            json!({"error": {"code": code, "message": message, "details": details}}),
        )
    }
}

impl Reply for ApiError {
    fn into_response(self) -> Response<Body> {
        let (status, body) = self.status_code_body();
        warp::reply::with_status(warp::reply::json(&body), status).into_response()
    }
}

pub fn into_response<S: Reply, E: Reply>(reply_res: Result<S, E>) -> Response<Body> {
    match reply_res {
        Ok(resp) => resp.into_response(),
        Err(err) => err.into_response(),
    }
}
