//! Transformation steps applied by `process` nodes, in order.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::predicate::lookup;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Keep only these fields of an object (each object of a list)
    Project { fields: Vec<String> },
    Rename { fields: BTreeMap<String, String> },
    /// Assign fields: a literal, `{"pin": label}` or `{"field": path}`
    Set { fields: Map<String, Value> },
    Pick { field: String },
    Wrap { key: String },
    /// Fold a list of objects into one object, later keys win
    Merge,
    First,
    Count,
    Identity,
}

enum SetSource<'a> {
    Literal(&'a Value),
    Pin(&'a str),
    Field(&'a str),
}

fn set_source(value: &Value) -> SetSource<'_> {
    if let Value::Object(o) = value {
        if o.len() == 1 {
            match (o.get("pin"), o.get("field")) {
                (Some(Value::String(label)), _) => return SetSource::Pin(label),
                (_, Some(Value::String(path))) => return SetSource::Field(path),
                _ => {}
            }
        }
    }
    SetSource::Literal(value)
}

impl Step {
    /// Labels of input pins the step reads
    pub fn pin_labels(&self) -> Vec<&str> {
        match self {
            Step::Set { fields } => fields
                .values()
                .filter_map(|v| match set_source(v) {
                    SetSource::Pin(label) => Some(label),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    pub fn apply(&self, input: Value, pins: &Map<String, Value>) -> Result<Value, String> {
        match self {
            Step::Project { fields } => map_objects(input, "project", |object| {
                Ok(fields
                    .iter()
                    .filter_map(|f| object.get(f).map(|v| (f.clone(), v.clone())))
                    .collect())
            }),
            Step::Rename { fields } => map_objects(input, "rename", |mut object| {
                for (from, to) in fields {
                    if let Some(value) = object.remove(from) {
                        object.insert(to.clone(), value);
                    }
                }
                Ok(object)
            }),
            Step::Set { fields } => map_objects(input, "set", |mut object| {
                for (name, source) in fields {
                    let value = match set_source(source) {
                        SetSource::Literal(v) => v.clone(),
                        SetSource::Pin(label) => pins.get(label).cloned().unwrap_or(Value::Null),
                        SetSource::Field(path) => {
                            let current = Value::Object(object.clone());
                            lookup(&current, path).cloned().unwrap_or(Value::Null)
                        }
                    };
                    object.insert(name.clone(), value);
                }
                Ok(object)
            }),
            Step::Pick { field } => Ok(match input {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|i| lookup(i, field).cloned().unwrap_or(Value::Null))
                        .collect(),
                ),
                other => lookup(&other, field).cloned().unwrap_or(Value::Null),
            }),
            Step::Wrap { key } => {
                let mut object = Map::new();
                object.insert(key.clone(), input);
                Ok(Value::Object(object))
            }
            Step::Merge => match input {
                Value::Array(items) => {
                    let mut merged = Map::new();
                    for item in items {
                        match item {
                            Value::Object(o) => merged.extend(o),
                            other => return Err(format!("merge expects objects, got {other}")),
                        }
                    }
                    Ok(Value::Object(merged))
                }
                object @ Value::Object(_) => Ok(object),
                other => Err(format!("merge expects a list of objects, got {other}")),
            },
            Step::First => Ok(match input {
                Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
                other => other,
            }),
            Step::Count => Ok(Value::from(match input {
                Value::Array(items) => items.len(),
                Value::Null => 0,
                _ => 1,
            })),
            Step::Identity => Ok(input),
        }
    }
}

/// Run `f` on an object, or on every object of a list
fn map_objects<F>(input: Value, step: &str, f: F) -> Result<Value, String>
where
    F: Fn(Map<String, Value>) -> Result<Map<String, Value>, String>,
{
    match input {
        Value::Object(object) => Ok(Value::Object(f(object)?)),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(object) => f(object).map(Value::Object),
                other => Err(format!("{step} expects objects, got {other}")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(format!("{step} expects an object or a list of objects, got {other}")),
    }
}

pub fn apply_all(steps: &[Step], input: Value, pins: &Map<String, Value>) -> Result<Value, String> {
    steps
        .iter()
        .try_fold(input, |value, step| step.apply(value, pins))
}
