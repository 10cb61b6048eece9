//! Executes a validated flow against one request.
//!
//! Scheduling is plain dataflow: a node becomes ready once every one of its
//! connected input pins holds a value, and ready nodes fire in declaration
//! order. A node that withholds a value from an output pin (a filter branch
//! that didn't match) keeps everything downstream of that pin from running.
//! The first `response` node to fire ends the execution.
//!
//! There is no transaction around a flow: rows written by `database` nodes
//! before a failure stay written.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use strum_macros::Display;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::catalog::CatalogError;
use crate::sync::{RowSelect, SchemaSynchronizer, SyncError};

use super::config::{
    DatabaseConfig, DatabaseOperation, FilterConfig, NodeConfig, ProcessConfig, ResponseConfig,
    StartConfig,
};
use super::graph::{FlowGraph, PinIx};
use super::model::{Flow, Node, Pin, PinDirection};
use super::transform::apply_all;
use super::validate::validate;

/// What the dispatch layer extracted from the HTTP request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowRequest {
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FlowResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
pub enum NodeFailure {
    /// The request doesn't carry what the flow needs
    InvalidInput,
    /// The store rejected an operation (unknown table/column, constraint)
    Query,
    Storage,
    Timeout,
    InvalidFlow,
    NoResponse,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", describe(.node_id, .message))]
pub struct ExecutionError {
    pub node_id: Option<String>,
    pub node_label: Option<String>,
    pub kind: NodeFailure,
    pub message: String,
}

impl ExecutionError {
    fn flow(kind: NodeFailure, message: String) -> Self {
        Self {
            node_id: None,
            node_label: None,
            kind,
            message,
        }
    }

    fn at(node: &Node, kind: NodeFailure, message: String) -> Self {
        Self {
            node_id: Some(node.id.clone()),
            node_label: Some(node.label.clone()),
            kind,
            message,
        }
    }
}

fn describe(node_id: &Option<String>, message: &str) -> String {
    match node_id {
        Some(id) => format!("Node {id:?} failed: {message}"),
        None => message.to_string(),
    }
}

fn classify(error: &SyncError) -> NodeFailure {
    match error {
        SyncError::Catalog(CatalogError::Validation { .. }) => NodeFailure::InvalidInput,
        SyncError::Catalog(CatalogError::TableDoesNotExist { .. })
        | SyncError::UnknownColumn { .. } => NodeFailure::Query,
        SyncError::Storage(e) if e.is_rejection() => NodeFailure::Query,
        SyncError::Timeout { .. } => NodeFailure::Timeout,
        _ => NodeFailure::Storage,
    }
}

/// Values a node produced, per output pin (index into the node's pins)
enum Fired {
    Outputs(Vec<(usize, Value)>),
    Response(FlowResponse),
}

type NodeResult<T> = Result<T, (NodeFailure, String)>;

fn object_of(inputs: &[(&Pin, Value)]) -> Value {
    Value::Object(
        inputs
            .iter()
            .map(|(pin, value)| (pin.label.clone(), value.clone()))
            .collect(),
    )
}

fn string_map(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn request_value(request: &FlowRequest, name: &str) -> Option<Value> {
    request
        .path_params
        .get(name)
        .or_else(|| request.query.get(name))
        .map(|v| Value::String(v.clone()))
        .or_else(|| request.body.get(name).filter(|v| !v.is_null()).cloned())
}

// Labels that receive the rows a filter rejected
fn is_rejected_branch(label: &str) -> bool {
    let word: String = label
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    matches!(word.as_str(), "rejected" | "else" | "false")
}

fn select_fields(value: Value, fields: &[String]) -> Value {
    match value {
        Value::Object(mut object) => Value::Object(
            fields
                .iter()
                .filter_map(|f| object.remove(f).map(|v| (f.clone(), v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| select_fields(item, fields))
                .collect(),
        ),
        other => other,
    }
}

fn expect_object(label: &str, value: Value) -> NodeResult<Map<String, Value>> {
    match value {
        Value::Object(object) => Ok(object),
        other => Err((
            NodeFailure::InvalidInput,
            format!("input {label:?} must be an object, got {other}"),
        )),
    }
}

pub struct FlowInterpreter {
    sync: Arc<SchemaSynchronizer>,
}

impl FlowInterpreter {
    pub fn new(sync: Arc<SchemaSynchronizer>) -> Self {
        Self { sync }
    }

    pub async fn execute(
        &self,
        flow: &Flow,
        request: &FlowRequest,
        deadline: Instant,
    ) -> Result<FlowResponse, ExecutionError> {
        validate(flow).map_err(|e| ExecutionError::flow(NodeFailure::InvalidFlow, e.to_string()))?;

        let configs = flow
            .nodes
            .iter()
            .map(|node| {
                NodeConfig::compile(node)
                    .map_err(|e| ExecutionError::at(node, NodeFailure::InvalidFlow, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (graph, _) = FlowGraph::build(flow);
        let mut values: HashMap<PinIx, Value> = HashMap::new();
        let mut waiting: Vec<usize> = (0..graph.node_count())
            .map(|ix| graph.incoming(ix).len())
            .collect();
        let mut ready: BTreeSet<usize> = (0..graph.node_count())
            .filter(|ix| waiting[*ix] == 0)
            .collect();

        while let Some(ix) = ready.pop_first() {
            let node = graph.node(ix);
            if Instant::now() >= deadline {
                return Err(ExecutionError::at(
                    node,
                    NodeFailure::Timeout,
                    "the request deadline passed before the node could run".to_string(),
                ));
            }

            let mut inputs: Vec<(PinIx, Value)> = graph
                .incoming(ix)
                .iter()
                .map(|edge| {
                    let edge = graph.edge(*edge);
                    (edge.to, values.get(&edge.from).cloned().unwrap_or(Value::Null))
                })
                .collect();
            inputs.sort_by_key(|(pin, _)| pin.pin);
            let inputs: Vec<(&Pin, Value)> = inputs
                .into_iter()
                .map(|(pin, value)| (graph.pin(pin), value))
                .collect();

            debug!("Firing node {:?} ({}) with {} input(s)", node.id, node.kind, inputs.len());

            let fired = match &configs[ix] {
                NodeConfig::Start(config) => self.start(node, config, request),
                NodeConfig::Database(config) => self.database(node, config, inputs, deadline).await,
                NodeConfig::Filter(config) => self.filter(node, config, inputs),
                NodeConfig::Process(config) => self.process(node, config, inputs),
                NodeConfig::Response(config) => self.response(config, inputs),
            }
            .map_err(|(kind, message)| ExecutionError::at(node, kind, message))?;

            match fired {
                Fired::Response(response) => {
                    debug!("Response node {:?} answered with {}", node.id, response.status);
                    return Ok(response);
                }
                Fired::Outputs(outputs) => {
                    for (pin, value) in outputs {
                        let from = PinIx { node: ix, pin };
                        values.insert(from, value);
                        for edge in graph.outgoing(ix) {
                            let edge = graph.edge(*edge);
                            if edge.from == from {
                                waiting[edge.to.node] -= 1;
                                if waiting[edge.to.node] == 0 {
                                    ready.insert(edge.to.node);
                                }
                            }
                        }
                    }
                }
            }
        }

        Err(ExecutionError::flow(
            NodeFailure::NoResponse,
            "the flow finished without reaching a response node".to_string(),
        ))
    }

    fn start(&self, node: &Node, config: &StartConfig, request: &FlowRequest) -> NodeResult<Fired> {
        for param in &config.params {
            if request_value(request, param).is_none() {
                return Err((
                    NodeFailure::InvalidInput,
                    format!("missing required parameter {param:?}"),
                ));
            }
        }

        let outputs = node
            .pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| pin.direction == PinDirection::Output)
            .map(|(ix, pin)| {
                let value = match pin.label.as_str() {
                    "body" => request.body.clone(),
                    "query" => string_map(&request.query),
                    "params" => string_map(&request.path_params),
                    "headers" => string_map(&request.headers),
                    "request" => serde_json::json!({
                        "params": string_map(&request.path_params),
                        "query": string_map(&request.query),
                        "headers": string_map(&request.headers),
                        "body": request.body,
                    }),
                    name => request_value(request, name).unwrap_or(Value::Null),
                };
                (ix, value)
            })
            .collect();
        Ok(Fired::Outputs(outputs))
    }

    async fn database(
        &self,
        node: &Node,
        config: &DatabaseConfig,
        inputs: Vec<(&Pin, Value)>,
        deadline: Instant,
    ) -> NodeResult<Fired> {
        let mut filters = config.filters.clone();
        let mut values = config.values.clone();
        let mut batch: Option<Vec<Map<String, Value>>> = None;

        for (pin, value) in inputs {
            match (pin.label.as_str(), value) {
                ("values", Value::Array(items)) if config.operation == DatabaseOperation::Insert => {
                    batch = Some(
                        items
                            .into_iter()
                            .map(|item| expect_object("values", item))
                            .collect::<NodeResult<_>>()?,
                    );
                }
                ("values", value) => values.extend(expect_object("values", value)?),
                ("where", value) => filters.extend(expect_object("where", value)?),
                (column, value) if config.operation == DatabaseOperation::Insert => {
                    values.insert(column.to_string(), value);
                }
                (column, value) => {
                    filters.insert(column.to_string(), value);
                }
            }
        }

        let sync = &self.sync;
        let table = &config.table;
        let operation = async {
            let columns = sync.tables().get_by_name(table).await?.columns;
            let (rows, count) = match config.operation {
                DatabaseOperation::Select => {
                    let select = RowSelect {
                        columns: config.columns.clone(),
                        filters,
                        order_by: config.ordering().map(|(c, desc)| (c.to_string(), desc)),
                        limit: config.limit,
                    };
                    let rows = sync.select_rows(table, &select).await?;
                    let count = rows.len() as u64;
                    (Some(rows), count)
                }
                DatabaseOperation::Insert => {
                    let rows = match batch {
                        Some(items) => items
                            .into_iter()
                            .map(|item| {
                                let mut row = values.clone();
                                row.extend(item);
                                row
                            })
                            .collect(),
                        None => vec![values],
                    };
                    let rows = sync.insert_rows(table, rows).await?;
                    let count = rows.len() as u64;
                    (Some(rows), count)
                }
                DatabaseOperation::Update => {
                    (None, sync.update_rows(table, &values, &filters).await?)
                }
                DatabaseOperation::Delete => (None, sync.delete_rows(table, &filters).await?),
            };
            Ok::<_, SyncError>((columns, rows, count))
        };

        let (columns, rows, count) = match timeout_at(deadline, operation).await {
            Ok(result) => result.map_err(|e| (classify(&e), e.to_string()))?,
            Err(_) => {
                return Err((
                    NodeFailure::Timeout,
                    format!("{} on table {table:?} did not finish before the request deadline", config.operation),
                ))
            }
        };
        debug!("Database node {:?}: {} on {table:?} touched {count} row(s)", node.id, config.operation);

        let rows = rows.map(|rows| rows.into_iter().map(Value::Object).collect::<Vec<_>>());
        let first = rows.as_ref().and_then(|r| r.first().cloned()).unwrap_or(Value::Null);
        let primary = match &rows {
            Some(rows) => Value::Array(rows.clone()),
            None => Value::from(count),
        };

        let outputs = node
            .pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| pin.direction == PinDirection::Output)
            .map(|(ix, pin)| {
                let value = match pin.label.as_str() {
                    "rows" => Value::Array(rows.clone().unwrap_or_default()),
                    "row" => first.clone(),
                    "count" => Value::from(count),
                    label if columns.iter().any(|c| c.name == label) => {
                        first.get(label).cloned().unwrap_or(Value::Null)
                    }
                    _ => primary.clone(),
                };
                (ix, value)
            })
            .collect();
        Ok(Fired::Outputs(outputs))
    }

    fn filter(&self, node: &Node, config: &FilterConfig, inputs: Vec<(&Pin, Value)>) -> NodeResult<Fired> {
        let pins: Map<String, Value> = inputs
            .iter()
            .map(|(pin, value)| (pin.label.clone(), value.clone()))
            .collect();
        let subject = inputs
            .iter()
            .find(|(pin, _)| matches!(pin.label.as_str(), "rows" | "data" | "input"))
            .or_else(|| inputs.first())
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null);

        // (matched, rejected); None withholds the branch
        let (matched, rejected) = match subject {
            Value::Array(items) => {
                let (matched, rejected): (Vec<_>, Vec<_>) = items
                    .into_iter()
                    .partition(|item| config.predicate.evaluate(item, &pins));
                let branch = |rows: Vec<Value>| {
                    (config.emit_empty || !rows.is_empty()).then_some(Value::Array(rows))
                };
                (branch(matched), branch(rejected))
            }
            single => {
                if config.predicate.evaluate(&single, &pins) {
                    (Some(single), None)
                } else {
                    (None, Some(single))
                }
            }
        };

        let outputs = node
            .pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| pin.direction == PinDirection::Output)
            .filter_map(|(ix, pin)| {
                let value = if is_rejected_branch(&pin.label) {
                    rejected.clone()
                } else {
                    matched.clone()
                };
                value.map(|v| (ix, v))
            })
            .collect();
        Ok(Fired::Outputs(outputs))
    }

    fn process(&self, node: &Node, config: &ProcessConfig, inputs: Vec<(&Pin, Value)>) -> NodeResult<Fired> {
        let pins: Map<String, Value> = inputs
            .iter()
            .map(|(pin, value)| (pin.label.clone(), value.clone()))
            .collect();
        let input = match inputs.as_slice() {
            [(_, value)] => value.clone(),
            _ => object_of(&inputs),
        };

        let output = apply_all(&config.pipeline(), input, &pins)
            .map_err(|e| (NodeFailure::InvalidInput, e))?;

        let outputs = node
            .pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| pin.direction == PinDirection::Output)
            .map(|(ix, _)| (ix, output.clone()))
            .collect();
        Ok(Fired::Outputs(outputs))
    }

    fn response(&self, config: &ResponseConfig, inputs: Vec<(&Pin, Value)>) -> NodeResult<Fired> {
        let body = match inputs.as_slice() {
            [(_, value)] => value.clone(),
            _ => object_of(&inputs),
        };
        let body = if config.selected_fields.is_empty() {
            body
        } else {
            select_fields(body, &config.selected_fields)
        };

        Ok(Fired::Response(FlowResponse {
            status: config.status_code,
            body,
        }))
    }
}
