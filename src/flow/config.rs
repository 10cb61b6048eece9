//! Declared configuration schema of every node type. A node's free-form
//! `config` object is compiled into one of these before a flow is stored and
//! again before it runs.

use serde::{de, de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

use crate::catalog::{validate_identifier, HttpMethod};

use super::model::{Node, NodeKind};
use super::predicate::Predicate;
use super::transform::Step;

pub const DEFAULT_STATUS_CODE: u16 = 200;

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct StartConfig {
    /// Names that must be present in the path, the query or the body
    #[serde(default)]
    pub params: Vec<String>,
    /// Kept from the editor, the endpoint's own method is what counts
    #[serde(default)]
    pub method: Option<HttpMethod>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatabaseOperation {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub table: String,
    #[serde(default)]
    pub operation: DatabaseOperation,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, rename = "where")]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default, alias = "orderBy")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Informational only, there is one database
    #[serde(default)]
    pub database: Option<String>,
}

impl DatabaseConfig {
    /// Column and direction (`true` = descending) of `order_by`
    pub fn ordering(&self) -> Option<(&str, bool)> {
        self.order_by.as_deref().map(|o| match o.strip_prefix('-') {
            Some(column) => (column, true),
            None => (o, false),
        })
    }
}

fn default_emit_empty() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub predicate: Predicate,
    #[serde(default = "default_emit_empty", alias = "emitEmpty")]
    pub emit_empty: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub step: Option<Step>,
}

impl ProcessConfig {
    /// `step` first, then `steps`
    pub fn pipeline(&self) -> Vec<Step> {
        self.step.iter().chain(self.steps.iter()).cloned().collect()
    }
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

fn status_code<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let code = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match code {
        Some(code) if (100..=599).contains(&code) => Ok(code as u16),
        _ => Err(de::Error::custom(format!(
            "invalid status code {value}, expected a number between 100 and 599"
        ))),
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Json,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResponseConfig {
    #[serde(
        default = "default_status_code",
        alias = "statusCode",
        deserialize_with = "status_code"
    )]
    pub status_code: u16,
    #[serde(default, alias = "selectedFields")]
    pub selected_fields: Vec<String>,
    #[serde(default)]
    pub format: ResponseFormat,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            status_code: DEFAULT_STATUS_CODE,
            selected_fields: vec![],
            format: ResponseFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Start(StartConfig),
    Database(DatabaseConfig),
    Filter(FilterConfig),
    Process(ProcessConfig),
    Response(ResponseConfig),
}

fn parse<T: DeserializeOwned>(config: &Value) -> Result<T, String> {
    let config = match config {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|e| e.to_string())
}

fn check_pins<'a>(node: &Node, labels: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
    for label in labels {
        if !node.inputs().any(|p| p.label == label) {
            return Err(format!("references input pin {label:?}, which the node does not have"));
        }
    }
    Ok(())
}

fn check_column(name: &str) -> Result<(), String> {
    validate_identifier("Column", name).map_err(|e| e.to_string())
}

impl NodeConfig {
    pub fn compile(node: &Node) -> Result<Self, String> {
        let config = match node.kind {
            NodeKind::Start => NodeConfig::Start(parse(&node.config)?),
            NodeKind::Database => NodeConfig::Database(parse(&node.config)?),
            NodeKind::Filter => NodeConfig::Filter(parse(&node.config)?),
            NodeKind::Process => NodeConfig::Process(parse(&node.config)?),
            NodeKind::Response => NodeConfig::Response(parse(&node.config)?),
        };

        match &config {
            NodeConfig::Start(start) => {
                if start.params.iter().any(|p| p.is_empty()) {
                    return Err("parameter names must not be empty".to_string());
                }
            }
            NodeConfig::Database(database) => {
                validate_identifier("Table", &database.table).map_err(|e| e.to_string())?;
                database
                    .columns
                    .iter()
                    .chain(database.filters.keys())
                    .chain(database.values.keys())
                    .try_for_each(|c| check_column(c))?;
                if let Some((column, _)) = database.ordering() {
                    check_column(column)?;
                }
            }
            NodeConfig::Filter(filter) => check_pins(node, filter.predicate.pin_labels())?,
            NodeConfig::Process(process) => {
                let pipeline = process.pipeline();
                check_pins(node, pipeline.iter().flat_map(|s| s.pin_labels()))?
            }
            NodeConfig::Response(_) => {}
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn compile(kind: NodeKind, config: Value) -> Result<NodeConfig, String> {
        let node = Node::new("n", kind, "n", config).with_input("in", "user", "any");
        NodeConfig::compile(&node)
    }

    #[test]
    fn test_database_config() {
        let config = compile(
            NodeKind::Database,
            json!({
                "table": "orders",
                "operation": "update",
                "where": {"id": 1},
                "values": {"total": 10},
                "orderBy": "-created_at",
                "limit": 5,
                "database": "main"
            }),
        )
        .unwrap();

        let NodeConfig::Database(database) = config else {
            panic!("expected a database config")
        };
        assert_eq!(database.operation, DatabaseOperation::Update);
        assert_eq!(database.ordering(), Some(("created_at", true)));
        assert_eq!(database.filters.get("id"), Some(&json!(1)));
        assert_eq!(database.limit, Some(5));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(
            compile(NodeKind::Response, Value::Null).unwrap(),
            NodeConfig::Response(ResponseConfig::default())
        );
        assert_eq!(
            compile(NodeKind::Start, json!({"method": "GET", "params": ["userId"]})).unwrap(),
            NodeConfig::Start(StartConfig {
                params: vec!["userId".to_string()],
                method: Some(HttpMethod::Get)
            })
        );
        assert_eq!(
            compile(NodeKind::Process, json!({})).unwrap(),
            NodeConfig::Process(ProcessConfig::default())
        );
    }

    #[rstest]
    #[case(json!({"statusCode": "201"}), 201)]
    #[case(json!({"status_code": 404}), 404)]
    #[case(json!({"selectedFields": ["id"]}), 200)]
    fn test_status_code(#[case] config: Value, #[case] expected: u16) {
        let NodeConfig::Response(response) = compile(NodeKind::Response, config).unwrap() else {
            panic!("expected a response config")
        };
        assert_eq!(response.status_code, expected);
    }

    #[rstest]
    #[case(NodeKind::Response, json!({"status_code": 42}), "invalid status code 42")]
    #[case(NodeKind::Response, json!({"statusCode": "abc"}), "invalid status code \"abc\"")]
    #[case(NodeKind::Database, json!({}), "missing field `table`")]
    #[case(NodeKind::Database, json!({"table": "Orders"}), "must start with a lowercase letter")]
    #[case(NodeKind::Database, json!({"table": "t", "where": {"1=1": 1}}), "Column name \"1=1\"")]
    #[case(NodeKind::Database, json!({"table": "t", "operation": "merge"}), "unknown variant `merge`")]
    #[case(NodeKind::Process, json!({"processType": "script", "script": "x"}), "unknown field `processType`")]
    #[case(NodeKind::Filter, json!({"transformType": "map"}), "unknown field `transformType`")]
    #[case(NodeKind::Filter, json!({"predicate": {"field": "a", "op": "eq", "value": {"pin": "other"}}}), "input pin \"other\"")]
    #[case(NodeKind::Process, json!({"step": {"op": "set", "fields": {"x": {"pin": "nope"}}}}), "input pin \"nope\"")]
    fn test_invalid_configs(#[case] kind: NodeKind, #[case] config: Value, #[case] message: &str) {
        let error = compile(kind, config).unwrap_err();
        assert!(error.contains(message), "{error:?} should contain {message:?}");
    }

    #[test]
    fn test_filter_with_pin_operand() {
        let config = compile(
            NodeKind::Filter,
            json!({"predicate": {"field": "owner", "op": "eq", "value": {"pin": "user"}}, "emitEmpty": false}),
        )
        .unwrap();
        let NodeConfig::Filter(filter) = config else {
            panic!("expected a filter config")
        };
        assert!(!filter.emit_empty);
    }
}
