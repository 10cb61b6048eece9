use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use serde_json::{json, Value};

use flowcore::catalog::{ColumnDefinition, HttpMethod};
use flowcore::context::{ContextError, CreateEndpoint, CreateTable, FlowcoreContext};
use flowcore::data_types::LogicalType;
use flowcore::flow::model::{Connection, Node, NodeKind};
use flowcore::flow::{Flow, FlowRequest, NodeFailure};

use crate::test_context;

fn column(name: &str, logical_type: LogicalType, required: bool) -> ColumnDefinition {
    ColumnDefinition {
        name: name.to_string(),
        logical_type,
        required,
    }
}

async fn scores(context: &FlowcoreContext) {
    let table = context
        .create_table(&CreateTable {
            name: "scores".to_string(),
            columns: vec![
                column("player", LogicalType::Text, true),
                column("points", LogicalType::Integer, false),
            ],
        })
        .await
        .unwrap();
    let report = context
        .import_csv(table.id, "player,points\nann,12\nben,3\ncat,25\n")
        .await
        .unwrap();
    assert_eq!(report.rows_imported, 3);
}

async fn endpoint(context: &FlowcoreContext, method: HttpMethod, path: &str, flow: Flow) {
    context
        .create_endpoint(&CreateEndpoint {
            name: format!("{method} {path}"),
            method,
            path: path.to_string(),
            flow,
        })
        .await
        .unwrap();
}

fn request(query: &[(&str, &str)], body: Value) -> FlowRequest {
    FlowRequest {
        path_params: HashMap::new(),
        query: query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        headers: HashMap::new(),
        body,
    }
}

// GET /leaders?min=N: all scores, split by a threshold taken from the query
fn leaders_flow() -> Flow {
    Flow {
        nodes: vec![
            Node::new("start", NodeKind::Start, "Request", json!({"params": ["min"]}))
                .with_output("q", "query", "any"),
            // Drops the query so every row is selected
            Node::new(
                "clear",
                NodeKind::Process,
                "Clear",
                json!({"step": {"op": "project", "fields": []}}),
            )
            .with_input("in", "query", "any")
            .with_output("out", "where", "any"),
            Node::new(
                "all",
                NodeKind::Database,
                "All scores",
                json!({"table": "scores", "orderBy": "-points"}),
            )
            .with_input("in", "where", "any")
            .with_output("rows", "rows", "list<record>"),
            Node::new(
                "threshold",
                NodeKind::Process,
                "Threshold",
                json!({"step": {"op": "pick", "field": "min"}}),
            )
            .with_input("in", "query", "any")
            .with_output("out", "min", "any"),
            Node::new(
                "top",
                NodeKind::Filter,
                "Top players",
                json!({"predicate": {"field": "points", "op": "gte", "value": {"pin": "min"}}}),
            )
            .with_input("rows", "rows", "list<record>")
            .with_input("min", "min", "any")
            .with_output("yes", "matched", "list<record>"),
            Node::new(
                "shape",
                NodeKind::Process,
                "Shape",
                json!({"steps": [
                    {"op": "project", "fields": ["player"]},
                    {"op": "wrap", "key": "leaders"}
                ]}),
            )
            .with_input("in", "in", "list<record>")
            .with_output("out", "out", "record"),
            Node::new("done", NodeKind::Response, "Leaders", json!({}))
                .with_input("in", "data", "any"),
        ],
        connections: vec![
            Connection::new("c1", ("start", "q"), ("threshold", "in")),
            Connection::new("c2", ("all", "rows"), ("top", "rows")),
            Connection::new("c6", ("start", "q"), ("clear", "in")),
            Connection::new("c7", ("clear", "out"), ("all", "in")),
            Connection::new("c3", ("threshold", "out"), ("top", "min")),
            Connection::new("c4", ("top", "yes"), ("shape", "in")),
            Connection::new("c5", ("shape", "out"), ("done", "in")),
        ],
    }
}

#[rstest]
#[tokio::test]
async fn test_filter_and_transform(#[future] test_context: Arc<FlowcoreContext>) {
    let context = test_context.await;
    scores(&context).await;
    endpoint(&context, HttpMethod::Get, "/leaders", leaders_flow()).await;

    let response = context
        .execute(HttpMethod::Get, "/leaders", request(&[("min", "10")], Value::Null))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(
        response.body,
        json!({"leaders": [{"player": "cat"}, {"player": "ann"}]})
    );

    let err = context
        .execute(HttpMethod::Get, "/leaders", request(&[], Value::Null))
        .await
        .unwrap_err();
    let ContextError::Execution(e) = err else {
        panic!("expected an execution error, got {err:?}")
    };
    assert_eq!(e.kind, NodeFailure::InvalidInput);
    assert_eq!(e.node_label.as_deref(), Some("Request"));
}

// PATCH /scores/{player}: body values, path params as the filter, count out
fn update_flow() -> Flow {
    Flow {
        nodes: vec![
            Node::new("start", NodeKind::Start, "Request", json!({}))
                .with_output("params", "params", "any")
                .with_output("body", "body", "any"),
            Node::new(
                "update",
                NodeKind::Database,
                "Update score",
                json!({"table": "scores", "operation": "update"}),
            )
            .with_input("where", "where", "any")
            .with_input("values", "values", "any")
            .with_output("count", "count", "number"),
            Node::new("done", NodeKind::Response, "Updated", json!({}))
                .with_input("in", "updated", "number"),
        ],
        connections: vec![
            Connection::new("c1", ("start", "params"), ("update", "where")),
            Connection::new("c2", ("start", "body"), ("update", "values")),
            Connection::new("c3", ("update", "count"), ("done", "in")),
        ],
    }
}

#[rstest]
#[tokio::test]
async fn test_update_through_template(#[future] test_context: Arc<FlowcoreContext>) {
    let context = test_context.await;
    scores(&context).await;
    endpoint(&context, HttpMethod::Patch, "/scores/{player}", update_flow()).await;
    endpoint(&context, HttpMethod::Get, "/leaders", leaders_flow()).await;

    let response = context
        .execute(HttpMethod::Patch, "/scores/ben", request(&[], json!({"points": 40})))
        .await
        .unwrap();
    assert_eq!(response.body, json!(1));

    let response = context
        .execute(HttpMethod::Patch, "/scores/nobody", request(&[], json!({"points": 1})))
        .await
        .unwrap();
    assert_eq!(response.body, json!(0));

    let response = context
        .execute(HttpMethod::Get, "/leaders", request(&[("min", "30")], Value::Null))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"leaders": [{"player": "ben"}]}));

    // Unknown column in the update values
    let err = context
        .execute(HttpMethod::Patch, "/scores/ann", request(&[], json!({"rank": 1})))
        .await
        .unwrap_err();
    let ContextError::Execution(e) = err else {
        panic!("expected an execution error, got {err:?}")
    };
    assert_eq!(e.kind, NodeFailure::Query);
    assert_eq!(e.node_id.as_deref(), Some("update"));
}

fn constant_flow(status: u16) -> Flow {
    Flow {
        nodes: vec![
            Node::new("start", NodeKind::Start, "Request", json!({}))
                .with_output("out", "params", "any"),
            Node::new("done", NodeKind::Response, "Done", json!({"statusCode": status}))
                .with_input("in", "data", "any"),
        ],
        connections: vec![Connection::new("c1", ("start", "out"), ("done", "in"))],
    }
}

#[rstest]
#[tokio::test]
async fn test_route_precedence(#[future] test_context: Arc<FlowcoreContext>) {
    let context = test_context.await;
    endpoint(&context, HttpMethod::Get, "/items/{id}", constant_flow(200)).await;
    endpoint(&context, HttpMethod::Get, "/items/featured", constant_flow(201)).await;
    // Keep the creation timestamps apart
    tokio::time::sleep(Duration::from_millis(20)).await;
    endpoint(&context, HttpMethod::Get, "/items/:key", constant_flow(202)).await;

    let response = context
        .execute(HttpMethod::Get, "/items/featured", FlowRequest::default())
        .await
        .unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.body, json!({}));

    // Equally specific templates: the newest one wins
    let response = context
        .execute(HttpMethod::Get, "/items/7", FlowRequest::default())
        .await
        .unwrap();
    assert_eq!(response.status, 202);
    assert_eq!(response.body, json!({"key": "7"}));

    let err = context
        .execute(HttpMethod::Get, "/items/7/extra", FlowRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "No endpoint matches GET /items/7/extra");
}
