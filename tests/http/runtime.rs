use std::sync::Arc;

use rstest::rstest;
use serde_json::json;
use warp::hyper::StatusCode;
use warp::test::request;

use flowcore::context::FlowcoreContext;

use super::echo_flow;
use crate::{call, json_body, test_context, test_filters};

#[rstest]
#[tokio::test]
async fn test_echo(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints",
        Some(json!({"name": "echo", "method": "POST", "path": "/echo", "flow": echo_flow()})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = call(&filters, "POST", "/api/echo/", Some(json!({"hello": ["world"]}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp), json!({"hello": ["world"]}));

    // No body at all is a null body
    let resp = call(&filters, "POST", "/api/echo", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp), json!(null));

    let resp = request()
        .method("POST")
        .path("/api/echo")
        .body("{not json")
        .reply(&filters)
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&resp)["error"]["code"], "VALIDATION_ERROR");

    // Wrong method on a known path
    let resp = call(&filters, "GET", "/api/echo", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(&resp)["error"]["code"], "NOT_FOUND");
}

#[rstest]
#[tokio::test]
async fn test_insert_and_lookup(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let resp = call(
        &filters,
        "POST",
        "/admin/tables",
        Some(json!({
            "name": "books",
            "columns": [
                {"name": "isbn", "type": "text", "required": true},
                {"name": "title", "type": "text", "required": true},
                {"name": "pages", "type": "integer"}
            ]
        })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // POST /api/books: body -> insert -> 201
    let insert = json!({
        "nodes": [
            {"id": "start", "type": "start", "label": "Request", "config": {"params": ["isbn"]},
             "pins": [{"id": "out", "node_id": "start", "type": "output", "data_type": "any", "label": "body"}]},
            {"id": "save", "type": "database", "label": "Save",
             "config": {"table": "books", "operation": "insert"},
             "pins": [
                {"id": "values", "node_id": "save", "type": "input", "data_type": "any", "label": "values"},
                {"id": "row", "node_id": "save", "type": "output", "data_type": "record", "label": "row"}
             ]},
            {"id": "done", "type": "response", "label": "Created", "config": {"statusCode": 201},
             "pins": [{"id": "in", "node_id": "done", "type": "input", "data_type": "any", "label": "data"}]}
        ],
        "connections": [
            {"id": "c1", "from": {"node_id": "start", "pin_id": "out"}, "to": {"node_id": "save", "pin_id": "values"}},
            {"id": "c2", "from": {"node_id": "save", "pin_id": "row"}, "to": {"node_id": "done", "pin_id": "in"}}
        ]
    });
    // GET /api/books/{isbn}: params -> select where -> first row
    let lookup = json!({
        "nodes": [
            {"id": "start", "type": "start", "label": "Request",
             "pins": [{"id": "out", "node_id": "start", "type": "output", "data_type": "any", "label": "params"}]},
            {"id": "find", "type": "database", "label": "Find",
             "config": {"table": "books", "columns": ["title", "pages"]},
             "pins": [
                {"id": "in", "node_id": "find", "type": "input", "data_type": "any", "label": "where"},
                {"id": "rows", "node_id": "find", "type": "output", "data_type": "list<record>", "label": "rows"}
             ]},
            {"id": "done", "type": "response", "label": "Found",
             "pins": [{"id": "in", "node_id": "done", "type": "input", "data_type": "any", "label": "data"}]}
        ],
        "connections": [
            {"id": "c1", "from": {"node_id": "start", "pin_id": "out"}, "to": {"node_id": "find", "pin_id": "in"}},
            {"id": "c2", "from": {"node_id": "find", "pin_id": "rows"}, "to": {"node_id": "done", "pin_id": "in"}}
        ]
    });

    for (name, method, path, flow) in [
        ("add book", "POST", "/books", insert),
        ("find book", "GET", "/books/{isbn}", lookup),
    ] {
        let resp = call(
            &filters,
            "POST",
            "/admin/endpoints",
            Some(json!({"name": name, "method": method, "path": path, "flow": flow})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED, "{:?}", json_body(&resp));
    }

    let resp = call(
        &filters,
        "POST",
        "/api/books",
        Some(json!({"isbn": "978-0", "title": "Dune", "pages": 412})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(json_body(&resp)["title"], "Dune");

    // Required start parameter
    let resp = call(&filters, "POST", "/api/books", Some(json!({"title": "Emma"}))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(&resp);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["details"]["node_id"], "start");

    // Required column
    let resp = call(&filters, "POST", "/api/books", Some(json!({"isbn": "978-1"}))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&resp)["error"]["details"]["node_id"], "save");

    let resp = call(&filters, "GET", "/api/books/978-0", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp), json!([{"title": "Dune", "pages": 412}]));

    let resp = call(&filters, "GET", "/api/books/unknown", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp), json!([]));
}

#[rstest]
#[tokio::test]
async fn test_query_error(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let flow = json!({
        "nodes": [
            {"id": "start", "type": "start", "label": "Request",
             "pins": [{"id": "out", "node_id": "start", "type": "output", "data_type": "any", "label": "query"}]},
            {"id": "db", "type": "database", "label": "Missing",
             "config": {"table": "missing"},
             "pins": [
                {"id": "in", "node_id": "db", "type": "input", "data_type": "any", "label": "where"},
                {"id": "rows", "node_id": "db", "type": "output", "data_type": "list<record>", "label": "rows"}
             ]},
            {"id": "done", "type": "response", "label": "Done",
             "pins": [{"id": "in", "node_id": "done", "type": "input", "data_type": "any", "label": "data"}]}
        ],
        "connections": [
            {"id": "c1", "from": {"node_id": "start", "pin_id": "out"}, "to": {"node_id": "db", "pin_id": "in"}},
            {"id": "c2", "from": {"node_id": "db", "pin_id": "rows"}, "to": {"node_id": "done", "pin_id": "in"}}
        ]
    });
    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints",
        Some(json!({"name": "broken", "method": "GET", "path": "/broken", "flow": flow})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = call(&filters, "GET", "/api/broken?x=1", None).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(&resp);
    assert_eq!(body["error"]["code"], "QUERY_ERROR");
    assert_eq!(body["error"]["details"]["node_label"], "Missing");
}
