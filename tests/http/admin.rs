use std::sync::Arc;

use rstest::rstest;
use serde_json::json;
use warp::hyper::StatusCode;

use flowcore::context::FlowcoreContext;

use super::echo_flow;
use crate::{call, json_body, test_context, test_filters};

#[rstest]
#[tokio::test]
async fn test_table_lifecycle(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let resp = call(
        &filters,
        "POST",
        "/admin/tables",
        Some(json!({
            "name": "products",
            "columns": [
                {"name": "title", "type": "text", "required": true},
                {"name": "price", "type": "integer"}
            ]
        })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let table = json_body(&resp);
    assert_eq!(table["name"], "products");
    let id = table["id"].as_str().unwrap().to_string();

    let resp = call(&filters, "GET", "/admin/tables", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp)["tables"].as_array().unwrap().len(), 1);

    let resp = call(
        &filters,
        "PUT",
        &format!("/admin/tables/{id}"),
        Some(json!({"columns": [
            {"name": "price", "type": "integer"},
            {"name": "in_stock", "type": "boolean"}
        ]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let names: Vec<_> = json_body(&resp)["columns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"in_stock".to_string()));
    assert_eq!(names.iter().filter(|n| *n == "price").count(), 1);

    let resp = call(
        &filters,
        "POST",
        &format!("/admin/tables/{id}/import"),
        Some(json!({"csv_data": "title,price\nlamp,20\nchair,oops\n"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report = json_body(&resp);
    assert_eq!(report["rows_imported"], 1);
    assert_eq!(report["rows_failed"], 1);
    assert_eq!(report["errors"][0]["line"], 3);

    let resp = call(&filters, "DELETE", &format!("/admin/tables/{id}"), None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = call(&filters, "GET", &format!("/admin/tables/{id}"), None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(&resp)["error"]["code"], "NOT_FOUND");
}

#[rstest]
#[tokio::test]
async fn test_table_errors(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let create = json!({"name": "tags", "columns": [{"name": "label", "type": "text"}]});
    let resp = call(&filters, "POST", "/admin/tables", Some(create.clone())).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let id = json_body(&resp)["id"].as_str().unwrap().to_string();

    let resp = call(&filters, "POST", "/admin/tables", Some(create)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(&resp)["error"]["code"], "CONFLICT");

    let resp = call(
        &filters,
        "POST",
        "/admin/tables",
        Some(json!({"name": "Bad Name", "columns": []})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&resp)["error"]["code"], "VALIDATION_ERROR");

    // Same name, different type
    let resp = call(
        &filters,
        "PUT",
        &format!("/admin/tables/{id}"),
        Some(json!({"columns": [{"name": "label", "type": "integer"}]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = call(
        &filters,
        "PUT",
        &format!("/admin/tables/{id}"),
        Some(json!({"columns": [{"name": "weight", "type": "integer", "required": true}]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = call(
        &filters,
        "GET",
        "/admin/tables/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[rstest]
#[tokio::test]
async fn test_endpoint_admin(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints",
        Some(json!({"name": "echo", "method": "POST", "path": "/echo/", "flow": echo_flow()})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let endpoint = json_body(&resp);
    assert_eq!(endpoint["path"], "/echo");
    let id = endpoint["id"].as_str().unwrap().to_string();

    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints",
        Some(json!({"name": "echo again", "method": "POST", "path": "/echo", "flow": echo_flow()})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = call(
        &filters,
        "PUT",
        &format!("/admin/endpoints/{id}"),
        Some(json!({"name": "renamed"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp)["name"], "renamed");
    assert_eq!(json_body(&resp)["path"], "/echo");

    let resp = call(&filters, "GET", "/admin/endpoints", None).await;
    assert_eq!(json_body(&resp)["endpoints"][0]["name"], "renamed");

    let resp = call(&filters, "DELETE", &format!("/admin/endpoints/{id}"), None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = call(&filters, "GET", &format!("/admin/endpoints/{id}"), None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[rstest]
#[tokio::test]
async fn test_flow_validation(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints/validate",
        Some(json!({"flow": echo_flow()})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp), json!({"valid": true, "violations": []}));

    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints/validate",
        Some(json!({"flow": {"nodes": []}})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(&resp);
    assert_eq!(body["valid"], false);
    assert!(!body["violations"].as_array().unwrap().is_empty());

    // Storing an invalid flow is refused with the same violations
    let resp = call(
        &filters,
        "POST",
        "/admin/endpoints",
        Some(json!({"name": "empty", "method": "GET", "path": "/empty", "flow": {"nodes": []}})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(&resp);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(!body["error"]["details"]["violations"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[rstest]
#[tokio::test]
async fn test_auth_routes(#[future] test_context: Arc<FlowcoreContext>) {
    let filters = test_filters(test_context.await);

    let resp = call(&filters, "GET", "/admin/auth/settings", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp)["method"], "email");

    let resp = call(
        &filters,
        "PUT",
        "/admin/auth/settings",
        Some(json!({"method": "oauth", "config": {"provider": "github"}})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp)["config"]["provider"], "github");

    let resp = call(&filters, "GET", "/admin/auth/fields", None).await;
    let fields = json_body(&resp)["fields"].clone();
    assert_eq!(fields[0], json!({"name": "email", "type": "text", "required": true}));
    assert_eq!(fields.as_array().unwrap().len(), 4);
}
