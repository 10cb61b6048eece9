//! Wire representation of a flow, as stored in `meta_endpoints.flow_definition`
//! and exchanged with the admin API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Flow {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    Start,
    Database,
    Filter,
    Response,
    Process,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    // Position in the editor canvas, never looked at by the server
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "empty_config")]
    pub config: Value,
    #[serde(default)]
    pub pins: Vec<Pin>,
}

fn empty_config() -> Value {
    Value::Object(Map::new())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub direction: PinDirection,
    pub data_type: String,
    #[serde(default)]
    pub label: String,
    /// Extra source data types an input pin takes besides its own `data_type`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepts: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PinRef {
    pub node_id: String,
    pub pin_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub from: PinRef,
    pub to: PinRef,
}

impl Node {
    pub fn new(id: &str, kind: NodeKind, label: &str, config: Value) -> Self {
        Self {
            id: id.to_string(),
            kind,
            label: label.to_string(),
            x: 0.0,
            y: 0.0,
            config,
            pins: vec![],
        }
    }

    pub fn with_input(mut self, pin_id: &str, label: &str, data_type: &str) -> Self {
        self.pins.push(Pin {
            id: pin_id.to_string(),
            node_id: self.id.clone(),
            direction: PinDirection::Input,
            data_type: data_type.to_string(),
            label: label.to_string(),
            accepts: vec![],
        });
        self
    }

    pub fn with_output(mut self, pin_id: &str, label: &str, data_type: &str) -> Self {
        self.pins.push(Pin {
            id: pin_id.to_string(),
            node_id: self.id.clone(),
            direction: PinDirection::Output,
            data_type: data_type.to_string(),
            label: label.to_string(),
            accepts: vec![],
        });
        self
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Pin> {
        self.pins
            .iter()
            .filter(|p| p.direction == PinDirection::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Pin> {
        self.pins
            .iter()
            .filter(|p| p.direction == PinDirection::Output)
    }
}

impl Connection {
    pub fn new(id: &str, from: (&str, &str), to: (&str, &str)) -> Self {
        Self {
            id: id.to_string(),
            from: PinRef {
                node_id: from.0.to_string(),
                pin_id: from.1.to_string(),
            },
            to: PinRef {
                node_id: to.0.to_string(),
                pin_id: to.1.to_string(),
            },
        }
    }
}
