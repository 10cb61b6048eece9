//! Index-based view over a [`Flow`]: nodes, pins and connections are addressed
//! by their position in the flow instead of by string ids, so the validator and
//! the interpreter never chase references.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use super::model::{Flow, Node, NodeKind, Pin, PinDirection};
use super::validate::{FlowViolation, ViolationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinIx {
    pub node: usize,
    pub pin: usize,
}

/// A connection whose both ends resolved to existing pins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphEdge {
    /// Position of the connection in `flow.connections`
    pub connection: usize,
    pub from: PinIx,
    pub to: PinIx,
}

#[derive(Debug)]
pub struct FlowGraph<'a> {
    pub flow: &'a Flow,
    pub edges: Vec<GraphEdge>,
    node_index: HashMap<&'a str, usize>,
    pin_index: Vec<HashMap<&'a str, usize>>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl<'a> FlowGraph<'a> {
    /// Index the flow. Problems that prevent a connection or a node from being
    /// indexed (duplicates, dangling references, wrong direction) are returned
    /// as violations and the offending element is left out of the graph.
    pub fn build(flow: &'a Flow) -> (Self, Vec<FlowViolation>) {
        let mut violations = vec![];

        let mut node_index = HashMap::new();
        let mut pin_index = Vec::with_capacity(flow.nodes.len());
        for (ix, node) in flow.nodes.iter().enumerate() {
            match node_index.entry(node.id.as_str()) {
                Entry::Occupied(_) => violations.push(FlowViolation::node(
                    ViolationKind::Validation,
                    node,
                    format!("duplicate node id {:?}", node.id),
                )),
                Entry::Vacant(e) => {
                    e.insert(ix);
                }
            }

            let mut pins = HashMap::new();
            for (pin_ix, pin) in node.pins.iter().enumerate() {
                if pin.node_id != node.id {
                    violations.push(FlowViolation::node(
                        ViolationKind::Validation,
                        node,
                        format!(
                            "pin {:?} claims to belong to node {:?}",
                            pin.id, pin.node_id
                        ),
                    ));
                }
                if pins.insert(pin.id.as_str(), pin_ix).is_some() {
                    violations.push(FlowViolation::node(
                        ViolationKind::Validation,
                        node,
                        format!("duplicate pin id {:?}", pin.id),
                    ));
                }
            }
            pin_index.push(pins);
        }

        let mut graph = Self {
            flow,
            edges: vec![],
            node_index,
            pin_index,
            incoming: vec![vec![]; flow.nodes.len()],
            outgoing: vec![vec![]; flow.nodes.len()],
        };

        let mut connection_ids = HashSet::new();
        for (ix, connection) in flow.connections.iter().enumerate() {
            if !connection_ids.insert(connection.id.as_str()) {
                violations.push(FlowViolation::flow(
                    ViolationKind::Validation,
                    format!("duplicate connection id {:?}", connection.id),
                ));
            }

            let from = graph.resolve(&connection.from.node_id, &connection.from.pin_id);
            let to = graph.resolve(&connection.to.node_id, &connection.to.pin_id);
            let (from, to) = match (from, to) {
                (Some(from), Some(to)) => (from, to),
                (from, _) => {
                    let (node_id, pin_id) = if from.is_none() {
                        (&connection.from.node_id, &connection.from.pin_id)
                    } else {
                        (&connection.to.node_id, &connection.to.pin_id)
                    };
                    violations.push(FlowViolation::flow(
                        ViolationKind::Validation,
                        format!(
                            "connection {:?} references unknown pin {node_id}.{pin_id}",
                            connection.id
                        ),
                    ));
                    continue;
                }
            };

            if graph.pin(from).direction != PinDirection::Output
                || graph.pin(to).direction != PinDirection::Input
            {
                violations.push(FlowViolation::flow(
                    ViolationKind::Validation,
                    format!(
                        "connection {:?} must go from an output pin to an input pin",
                        connection.id
                    ),
                ));
                continue;
            }

            let edge_ix = graph.edges.len();
            graph.edges.push(GraphEdge {
                connection: ix,
                from,
                to,
            });
            graph.outgoing[from.node].push(edge_ix);
            graph.incoming[to.node].push(edge_ix);
        }

        (graph, violations)
    }

    fn resolve(&self, node_id: &str, pin_id: &str) -> Option<PinIx> {
        let node = *self.node_index.get(node_id)?;
        let pin = *self.pin_index[node].get(pin_id)?;
        Some(PinIx { node, pin })
    }

    pub fn node_count(&self) -> usize {
        self.flow.nodes.len()
    }

    pub fn node(&self, ix: usize) -> &'a Node {
        &self.flow.nodes[ix]
    }

    pub fn pin(&self, ix: PinIx) -> &'a Pin {
        &self.flow.nodes[ix.node].pins[ix.pin]
    }

    pub fn edge(&self, ix: usize) -> &GraphEdge {
        &self.edges[ix]
    }

    /// Edges ending at the node, in connection declaration order
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<usize> {
        self.flow
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == kind)
            .map(|(ix, _)| ix)
            .collect()
    }

    /// Input pins that receive more than one connection
    pub fn fan_in_violations(&self) -> Vec<(PinIx, usize)> {
        let mut counts: HashMap<PinIx, usize> = HashMap::new();
        for edge in &self.edges {
            *counts.entry(edge.to).or_default() += 1;
        }
        let mut over: Vec<_> = counts.into_iter().filter(|(_, c)| *c > 1).collect();
        over.sort();
        over
    }

    /// Three-colour DFS, first from `roots` and then from every node not yet
    /// visited, in declaration order. Returns the source node of the first
    /// back-edge found.
    pub fn find_cycle(&self, roots: &[usize]) -> Option<usize> {
        let mut colour = vec![Colour::White; self.node_count()];

        let starts = roots.iter().copied().chain(0..self.node_count());
        for root in starts {
            if colour[root] != Colour::White {
                continue;
            }

            // Explicit stack of (node, next outgoing edge to look at)
            let mut stack = vec![(root, 0usize)];
            colour[root] = Colour::Grey;

            while let Some((node, next)) = stack.last_mut() {
                let node = *node;
                match self.outgoing[node].get(*next) {
                    Some(&edge_ix) => {
                        *next += 1;
                        let target = self.edges[edge_ix].to.node;
                        match colour[target] {
                            Colour::Grey => return Some(node),
                            Colour::White => {
                                colour[target] = Colour::Grey;
                                stack.push((target, 0));
                            }
                            Colour::Black => {}
                        }
                    }
                    None => {
                        colour[node] = Colour::Black;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// Which nodes can be reached from `root` by following connections
    pub fn reachable_from(&self, root: usize) -> Vec<bool> {
        let mut seen = vec![false; self.node_count()];
        let mut stack = vec![root];
        seen[root] = true;

        while let Some(node) = stack.pop() {
            for &edge_ix in &self.outgoing[node] {
                let target = self.edges[edge_ix].to.node;
                if !seen[target] {
                    seen[target] = true;
                    stack.push(target);
                }
            }
        }
        seen
    }
}
