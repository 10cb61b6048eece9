use serde::Serialize;
use strum_macros::Display;

use super::config::NodeConfig;
use super::graph::{FlowGraph, PinIx};
use super::model::{Flow, Node, NodeKind, Pin};

/// Data type tag that matches anything on the receiving end
pub const ANY_TYPE: &str = "any";
const ANY_LIST_TYPE: &str = "list<any>";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ViolationKind {
    /// Malformed structure or configuration
    Validation,
    Cyclic,
    TypeMismatch,
    Unreachable,
    FanIn,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FlowViolation {
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl FlowViolation {
    pub fn flow(kind: ViolationKind, message: String) -> Self {
        Self {
            kind,
            node_id: None,
            message,
        }
    }

    pub fn node(kind: ViolationKind, node: &Node, message: String) -> Self {
        Self {
            kind,
            node_id: Some(node.id.clone()),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid flow: {}", join_messages(.violations))]
pub struct FlowValidationError {
    pub violations: Vec<FlowViolation>,
}

fn join_messages(violations: &[FlowViolation]) -> String {
    violations
        .iter()
        .map(|v| v.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl FlowValidationError {
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

/// Whether a connection from `source` into `target` (an input pin of a node of
/// kind `target_kind`) carries a compatible data type
pub fn accepts(target_kind: NodeKind, target: &Pin, source: &Pin) -> bool {
    let (target_type, source_type) = (target.data_type.as_str(), source.data_type.as_str());

    target_kind == NodeKind::Process
        || target_type == source_type
        || target_type == ANY_TYPE
        || target.accepts.iter().any(|t| t == source_type || t == ANY_TYPE)
        || (target_type == ANY_LIST_TYPE && source_type.starts_with("list<"))
}

fn describe(graph: &FlowGraph, ix: PinIx) -> String {
    let pin = graph.pin(ix);
    format!(
        "{}.{} ({})",
        graph.node(ix.node).id,
        pin.id,
        pin.data_type
    )
}

/// Check every structural, typing and configuration rule of a flow and report
/// all violations found.
pub fn validate(flow: &Flow) -> Result<(), FlowValidationError> {
    let mut violations = vec![];

    if flow.nodes.is_empty() {
        violations.push(FlowViolation::flow(
            ViolationKind::Validation,
            "flow must contain at least one node".to_string(),
        ));
        return Err(FlowValidationError { violations });
    }

    for node in &flow.nodes {
        if node.pins.is_empty() {
            violations.push(FlowViolation::node(
                ViolationKind::Validation,
                node,
                format!("node {:?} has no pins", node.id),
            ));
        }
        match node.kind {
            NodeKind::Start if node.inputs().next().is_some() => {
                violations.push(FlowViolation::node(
                    ViolationKind::Validation,
                    node,
                    format!("start node {:?} cannot have input pins", node.id),
                ))
            }
            NodeKind::Response if node.outputs().next().is_some() => {
                violations.push(FlowViolation::node(
                    ViolationKind::Validation,
                    node,
                    format!("response node {:?} cannot have output pins", node.id),
                ))
            }
            _ => {}
        }
        if let Err(reason) = NodeConfig::compile(node) {
            violations.push(FlowViolation::node(
                ViolationKind::Validation,
                node,
                format!("node {:?}: {reason}", node.id),
            ));
        }
    }

    let (graph, structural) = FlowGraph::build(flow);
    violations.extend(structural);

    let starts = graph.nodes_of_kind(NodeKind::Start);
    if starts.len() != 1 {
        violations.push(FlowViolation::flow(
            ViolationKind::Validation,
            format!(
                "flow must have exactly one start node, found {}",
                starts.len()
            ),
        ));
    }
    let responses = graph.nodes_of_kind(NodeKind::Response);
    if responses.is_empty() {
        violations.push(FlowViolation::flow(
            ViolationKind::Validation,
            "flow must have at least one response node".to_string(),
        ));
    }

    for (pin, count) in graph.fan_in_violations() {
        violations.push(FlowViolation::node(
            ViolationKind::FanIn,
            graph.node(pin.node),
            format!(
                "input pin {} has {count} incoming connections, at most one is allowed",
                describe(&graph, pin)
            ),
        ));
    }

    if let Some(node) = graph.find_cycle(&starts) {
        let node = graph.node(node);
        violations.push(FlowViolation::node(
            ViolationKind::Cyclic,
            node,
            format!("node {:?} closes a cycle", node.id),
        ));
    }

    if let [start] = starts[..] {
        let reachable = graph.reachable_from(start);
        for (ix, node) in flow.nodes.iter().enumerate() {
            if !reachable[ix] {
                violations.push(FlowViolation::node(
                    ViolationKind::Unreachable,
                    node,
                    format!("node {:?} is not reachable from the start node", node.id),
                ));
            }
        }
        if !responses.is_empty() && !responses.iter().any(|r| reachable[*r]) {
            violations.push(FlowViolation::flow(
                ViolationKind::Validation,
                "no response node is reachable from the start node".to_string(),
            ));
        }
    }

    for edge in &graph.edges {
        let target_kind = graph.node(edge.to.node).kind;
        if !accepts(target_kind, graph.pin(edge.to), graph.pin(edge.from)) {
            violations.push(FlowViolation::node(
                ViolationKind::TypeMismatch,
                graph.node(edge.to.node),
                format!(
                    "connection {:?}: {} does not accept {}",
                    flow.connections[edge.connection].id,
                    describe(&graph, edge.to),
                    describe(&graph, edge.from)
                ),
            ));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(FlowValidationError { violations })
    }
}
