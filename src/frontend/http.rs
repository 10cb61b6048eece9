use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};
use warp::filters::body::BodyDeserializeError;
use warp::filters::path::Tail;
use warp::http::{HeaderMap, Method};
use warp::hyper::{Body, Response, StatusCode};
use warp::reject::{InvalidQuery, MethodNotAllowed, Reject};
use warp::{Filter, Rejection, Reply};

use crate::auth::{bearer_token, token_to_principal, AccessPolicy, AuthError};
use crate::catalog::{AuthMethod, ColumnDefinition, HttpMethod};
use crate::config::schema::HttpFrontend;
use crate::context::{
    ContextError, CreateEndpoint, CreateTable, FlowcoreContext, UpdateEndpoint, AUTH_FIELDS,
};
use crate::data_types::{EndpointId, TableId};
use crate::flow::{Flow, FlowRequest};

use super::http_utils::{into_response, ApiError};

type Context = Arc<FlowcoreContext>;

impl Reject for AuthError {}

#[derive(Debug, Deserialize)]
struct AddColumnsBody {
    columns: Vec<ColumnDefinition>,
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    csv_data: String,
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    flow: Flow,
}

#[derive(Debug, Deserialize)]
struct AuthSettingsBody {
    method: AuthMethod,
    #[serde(default = "empty_object")]
    config: Value,
}

fn empty_object() -> Value {
    json!({})
}

fn with_context(context: Context) -> impl Filter<Extract = (Context,), Error = Infallible> + Clone {
    warp::any().map(move || context.clone())
}

fn json_reply<T: serde::Serialize>(value: &T, status: StatusCode) -> Response<Body> {
    warp::reply::with_status(warp::reply::json(value), status).into_response()
}

fn ok<T: serde::Serialize>(value: T) -> Response<Body> {
    json_reply(&value, StatusCode::OK)
}

// Admin routes are gated by the configured access policy
fn with_admin(policy: AccessPolicy) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |authorization: Option<String>| {
            let policy = policy.clone();
            async move {
                let principal = token_to_principal(bearer_token(authorization.as_deref()), &policy)
                    .map_err(warp::reject::custom)?;
                debug!("Admin request as {principal:?}");
                Ok::<_, Rejection>(())
            }
        })
        .untuple_one()
}

// GET /health
pub fn health() -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .map(|| ok(json!({"status": "ok"})))
}

// /admin/tables[/{id}[/import]]
fn table_routes(context: Context) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    let list = warp::path!("tables")
        .and(warp::get())
        .and(with_context(context.clone()))
        .then(|context: Context| async move {
            context
                .list_tables()
                .await
                .map(|tables| ok(json!({ "tables": tables })))
                .map_err(ApiError::from)
        })
        .map(into_response);

    let create = warp::path!("tables")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .then(|request: CreateTable, context: Context| async move {
            context
                .create_table(&request)
                .await
                .map(|table| json_reply(&table, StatusCode::CREATED))
                .map_err(ApiError::from)
        })
        .map(into_response);

    let get = warp::path!("tables" / TableId)
        .and(warp::get())
        .and(with_context(context.clone()))
        .then(|id: TableId, context: Context| async move {
            context.get_table(id).await.map(ok).map_err(ApiError::from)
        })
        .map(into_response);

    let add_columns = warp::path!("tables" / TableId)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .then(|id: TableId, body: AddColumnsBody, context: Context| async move {
            context
                .add_columns(id, &body.columns)
                .await
                .map(|report| {
                    if !report.skipped.is_empty() {
                        debug!("Columns already present: {:?}", report.skipped);
                    }
                    ok(report.table)
                })
                .map_err(ApiError::from)
        })
        .map(into_response);

    let delete = warp::path!("tables" / TableId)
        .and(warp::delete())
        .and(with_context(context.clone()))
        .then(|id: TableId, context: Context| async move {
            context
                .delete_table(id)
                .await
                .map(|_| StatusCode::NO_CONTENT.into_response())
                .map_err(ApiError::from)
        })
        .map(into_response);

    let import = warp::path!("tables" / TableId / "import")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context))
        .then(|id: TableId, body: ImportBody, context: Context| async move {
            context
                .import_csv(id, &body.csv_data)
                .await
                .map(ok)
                .map_err(ApiError::from)
        })
        .map(into_response);

    list.or(create)
        .unify()
        .or(get)
        .unify()
        .or(add_columns)
        .unify()
        .or(delete)
        .unify()
        .or(import)
        .unify()
}

// POST /admin/reconcile
fn reconcile_route(context: Context) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    warp::path!("reconcile")
        .and(warp::post())
        .and(with_context(context))
        .then(|context: Context| async move {
            context.reconcile().await.map(ok).map_err(ApiError::from)
        })
        .map(into_response)
}

// /admin/endpoints[/{id}|/validate]
fn endpoint_routes(context: Context) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    let list = warp::path!("endpoints")
        .and(warp::get())
        .and(with_context(context.clone()))
        .then(|context: Context| async move {
            context
                .list_endpoints()
                .await
                .map(|endpoints| ok(json!({ "endpoints": endpoints })))
                .map_err(ApiError::from)
        })
        .map(into_response);

    let create = warp::path!("endpoints")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .then(|request: CreateEndpoint, context: Context| async move {
            context
                .create_endpoint(&request)
                .await
                .map(|endpoint| json_reply(&endpoint, StatusCode::CREATED))
                .map_err(ApiError::from)
        })
        .map(into_response);

    let validate = warp::path!("endpoints" / "validate")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .map(|body: ValidateBody, context: Context| {
            match context.validate_flow(&body.flow) {
                Ok(()) => Ok(ok(json!({"valid": true, "violations": []}))),
                Err(ContextError::InvalidFlow(e)) => {
                    Ok(ok(json!({"valid": false, "violations": e.violations})))
                }
                Err(e) => Err(ApiError::from(e)),
            }
        })
        .map(into_response);

    let get = warp::path!("endpoints" / EndpointId)
        .and(warp::get())
        .and(with_context(context.clone()))
        .then(|id: EndpointId, context: Context| async move {
            context.get_endpoint(id).await.map(ok).map_err(ApiError::from)
        })
        .map(into_response);

    let update = warp::path!("endpoints" / EndpointId)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .then(|id: EndpointId, update: UpdateEndpoint, context: Context| async move {
            context
                .update_endpoint(id, &update)
                .await
                .map(ok)
                .map_err(ApiError::from)
        })
        .map(into_response);

    let delete = warp::path!("endpoints" / EndpointId)
        .and(warp::delete())
        .and(with_context(context))
        .then(|id: EndpointId, context: Context| async move {
            context
                .delete_endpoint(id)
                .await
                .map(|_| StatusCode::NO_CONTENT.into_response())
                .map_err(ApiError::from)
        })
        .map(into_response);

    list.or(create)
        .unify()
        .or(validate)
        .unify()
        .or(get)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
}

// /admin/auth/{settings,fields}
fn auth_routes(context: Context) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    let get = warp::path!("auth" / "settings")
        .and(warp::get())
        .and(with_context(context.clone()))
        .then(|context: Context| async move {
            context.get_auth_settings().await.map(ok).map_err(ApiError::from)
        })
        .map(into_response);

    let update = warp::path!("auth" / "settings")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context))
        .then(|body: AuthSettingsBody, context: Context| async move {
            context
                .update_auth_settings(body.method, body.config)
                .await
                .map(ok)
                .map_err(ApiError::from)
        })
        .map(into_response);

    let fields = warp::path!("auth" / "fields")
        .and(warp::get())
        .map(|| ok(json!({ "fields": AUTH_FIELDS })));

    get.or(update).unify().or(fields).unify()
}

pub fn admin(
    context: Context,
    policy: AccessPolicy,
) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    warp::path("admin").and(with_admin(policy)).and(
        table_routes(context.clone())
            .or(reconcile_route(context.clone()))
            .unify()
            .or(endpoint_routes(context.clone()))
            .unify()
            .or(auth_routes(context))
            .unify(),
    )
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn dispatch(
    context: Context,
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    let Ok(http_method) = method.as_str().parse::<HttpMethod>() else {
        return Err(ApiError::NotFound(format!("No endpoint matches {method} {path}")));
    };

    let body = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Request body is not valid JSON: {e}")))?
    };

    let request = FlowRequest {
        path_params: HashMap::new(),
        query,
        headers: header_map(&headers),
        body,
    };
    let response = context.execute(http_method, &path, request).await?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok(json_reply(&response.body, status))
}

// ANY /api/{path...}
pub fn runtime(context: Context) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    warp::path("api")
        .and(warp::path::tail())
        .and(warp::method())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(with_context(context))
        .then(
            |tail: Tail,
             method: Method,
             query: HashMap<String, String>,
             headers: HeaderMap,
             body: Bytes,
             context: Context| {
                dispatch(context, method, format!("/{}", tail.as_str()), query, headers, body)
            },
        )
        .map(into_response)
}

pub async fn handle_rejection(err: Rejection) -> Result<Response<Body>, Infallible> {
    let error = if let Some(e) = err.find::<AuthError>() {
        ApiError::Auth(e.clone())
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        ApiError::BadRequest(format!("Invalid request body: {e}"))
    } else if let Some(e) = err.find::<InvalidQuery>() {
        ApiError::BadRequest(e.to_string())
    } else if err.is_not_found() || err.find::<MethodNotAllowed>().is_some() {
        ApiError::NotFound("Route not found".to_string())
    } else {
        error!("Unhandled rejection: {err:?}");
        ApiError::BadRequest(format!("{err:?}"))
    };
    Ok(error.into_response())
}

fn cors(config: &HttpFrontend) -> warp::cors::Builder {
    let cors = warp::cors()
        .allow_headers(vec!["Authorization", "Content-Type"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "PATCH"]);

    if config.cors_allowed_origins.iter().any(|o| o == "*") {
        cors.allow_any_origin()
    } else {
        cors.allow_origins(config.cors_allowed_origins.iter().map(String::as_str))
    }
}

pub fn filters(
    context: Context,
    config: &HttpFrontend,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let policy = AccessPolicy::from_config(config);

    health()
        .or(admin(context.clone(), policy))
        .unify()
        .or(runtime(context))
        .unify()
        .recover(handle_rejection)
        .with(cors(config))
        .with(warp::log("flowcore::http"))
}

/// What gets served when the catalog database couldn't be reached at startup
pub fn degraded_filters(
    config: &HttpFrontend,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .map(|| json_reply(&json!({"status": "degraded"}), StatusCode::SERVICE_UNAVAILABLE));

    health
        .or(warp::any().map(|| ApiError::Degraded.into_response()))
        .unify()
        .with(cors(config))
        .with(warp::log("flowcore::http"))
}

pub async fn run_server(
    context: Option<Context>,
    config: HttpFrontend,
    shutdown: impl Future<Output = ()> + Send + 'static,
) {
    let socket_addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port)
        .parse()
        .expect("Error parsing the listen address");

    match context {
        Some(context) => {
            info!("Starting the HTTP frontend on {socket_addr}");
            let (_, server) = warp::serve(filters(context, &config))
                .bind_with_graceful_shutdown(socket_addr, shutdown);
            server.await
        }
        None => {
            info!("Starting the HTTP frontend in degraded mode on {socket_addr}");
            let (_, server) = warp::serve(degraded_filters(&config))
                .bind_with_graceful_shutdown(socket_addr, shutdown);
            server.await
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warp::test::request;

    use crate::config::schema::{str_to_hex_hash, AccessSettings};
    use crate::context::test_utils::in_memory_context;

    use super::*;

    async fn context() -> Context {
        Arc::new(in_memory_context().await)
    }

    fn body(response: &Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let handler = filters(context().await, &HttpFrontend::default());
        let resp = request().method("GET").path("/health").reply(&handler).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_admin_token() {
        let config = HttpFrontend {
            admin_access: AccessSettings::Password {
                sha256_hash: str_to_hex_hash("secret"),
            },
            ..Default::default()
        };
        let handler = filters(context().await, &config);

        let resp = request().method("GET").path("/admin/tables").reply(&handler).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&resp)["error"]["code"], "UNAUTHORIZED");

        let resp = request()
            .method("GET")
            .path("/admin/tables")
            .header("Authorization", "Bearer wrong")
            .reply(&handler)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = request()
            .method("GET")
            .path("/admin/tables")
            .header("Authorization", "Bearer secret")
            .reply(&handler)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp), json!({"tables": []}));

        // Runtime routes are not gated
        let resp = request().method("GET").path("/api/nothing").reply(&handler).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&resp)["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_admin_disabled() {
        let config = HttpFrontend {
            admin_access: AccessSettings::Off,
            ..Default::default()
        };
        let handler = filters(context().await, &config);

        let resp = request()
            .method("GET")
            .path("/admin/endpoints")
            .reply(&handler)
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body(&resp)["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_bad_body() {
        let handler = filters(context().await, &HttpFrontend::default());

        let resp = request()
            .method("POST")
            .path("/admin/tables")
            .body("{\"name\": 1}")
            .reply(&handler)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&resp)["error"]["code"], "VALIDATION_ERROR");

        let resp = request().method("GET").path("/nowhere").reply(&handler).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_degraded() {
        let handler = degraded_filters(&HttpFrontend::default());

        let resp = request().method("GET").path("/health").reply(&handler).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(&resp), json!({"status": "degraded"}));

        let resp = request().method("GET").path("/admin/tables").reply(&handler).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(&resp)["error"]["code"], "DEGRADED");
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let config = HttpFrontend {
            cors_allowed_origins: vec!["https://editor.example.com".to_string()],
            ..Default::default()
        };
        let handler = filters(context().await, &config);

        let resp = request()
            .method("OPTIONS")
            .path("/admin/tables")
            .header("Origin", "https://editor.example.com")
            .header("Access-Control-Request-Method", "POST")
            .reply(&handler)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "https://editor.example.com"
        );
    }
}
