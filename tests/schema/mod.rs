use std::fs;

use serde_json::json;
use warp::hyper::StatusCode;

use flowcore::config::context::build_context;
use flowcore::config::schema::{load_config, AccessSettings, Catalog};
use flowcore::data_types::LogicalType;

use crate::{call, json_body, test_filters};

// Everything below goes through a config file on disk and a file-backed catalog
#[tokio::test]
async fn test_catalog_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("flowcore.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[catalog]
type = "sqlite"
dsn = "sqlite://{}"
journal_mode = "wal"

[runtime]
request_timeout_ms = 5000
"#,
            dir.path().join("catalog.sqlite").display()
        ),
    )
    .unwrap();

    let config = load_config(&config_path).unwrap();
    assert!(matches!(config.catalog, Catalog::Sqlite(_)));
    assert_eq!(config.frontend.http.admin_access, AccessSettings::Any);

    let filters = test_filters(build_context(config.clone()).await.unwrap().into());
    let resp = call(
        &filters,
        "POST",
        "/admin/tables",
        Some(json!({"name": "visits", "columns": [{"name": "page", "type": "text", "required": true}]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let id = json_body(&resp)["id"].as_str().unwrap().to_string();

    let resp = call(
        &filters,
        "POST",
        &format!("/admin/tables/{id}/import"),
        Some(json!({"csv_data": "page\n/home\n/about\n"})),
    )
    .await;
    assert_eq!(json_body(&resp)["rows_imported"], 2);
    drop(filters);

    let context = build_context(config).await.unwrap();
    let tables = context.list_tables().await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].name, "visits");
    let page = tables[0].column("page").unwrap();
    assert_eq!(page.logical_type, LogicalType::Text);
    assert!(page.required);
    assert!(page.materialized);

    // The reconciliation at startup found nothing to repair
    let report = context.reconcile().await.unwrap();
    assert!(report.orphaned_tables.is_empty());
    assert!(report.columns_pending.is_empty());

    let filters = test_filters(context.into());
    let resp = call(
        &filters,
        "PUT",
        &format!("/admin/tables/{id}"),
        Some(json!({"columns": [{"name": "referrer", "type": "text"}]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp)["columns"].as_array().unwrap().len(), 2);

    let resp = call(&filters, "POST", "/admin/reconcile", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(&resp)["tables_checked"], 1);
}

#[tokio::test]
async fn test_environment_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("missing.toml");

    // Only this test touches FLOWCORE__* variables
    std::env::set_var("FLOWCORE__FRONTEND__HTTP__BIND_PORT", "9191");
    std::env::set_var(
        "FLOWCORE__FRONTEND__HTTP__CORS_ALLOWED_ORIGINS",
        "https://a.example.com,https://b.example.com",
    );
    std::env::set_var("FLOWCORE__RUNTIME__REQUEST_TIMEOUT_MS", "250");
    let config = load_config(&config_path);
    std::env::remove_var("FLOWCORE__FRONTEND__HTTP__BIND_PORT");
    std::env::remove_var("FLOWCORE__FRONTEND__HTTP__CORS_ALLOWED_ORIGINS");
    std::env::remove_var("FLOWCORE__RUNTIME__REQUEST_TIMEOUT_MS");

    let config = config.unwrap();
    assert_eq!(config.frontend.http.bind_port, 9191);
    assert_eq!(
        config.frontend.http.cors_allowed_origins,
        vec!["https://a.example.com", "https://b.example.com"]
    );
    assert_eq!(config.runtime.request_timeout_ms, 250);
    assert_eq!(config.catalog, Catalog::default());
}
