//! Predicates evaluated by `filter` nodes.
//!
//! ```json
//! {"and": [
//!     {"field": "age", "op": "gte", "value": 18},
//!     {"not": {"field": "status", "op": "eq", "value": {"pin": "excluded"}}}
//! ]}
//! ```

use std::cmp::Ordering;

use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// Value currently held by the node's input pin with this label
    Pin(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        field: String,
        op: CompareOp,
        value: Operand,
    },
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Predicate::parse(&value).map_err(de::Error::custom)
    }
}

fn parse_list(value: &Value, key: &str) -> Result<Vec<Predicate>, String> {
    match value {
        Value::Array(items) if !items.is_empty() => items.iter().map(Predicate::parse).collect(),
        _ => Err(format!("{key:?} expects a non-empty list of predicates")),
    }
}

impl Predicate {
    pub fn parse(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("a predicate must be an object, got {value}"))?;

        if object.len() == 1 {
            if let Some((key, inner)) = object.iter().next() {
                match key.as_str() {
                    "and" => return Ok(Predicate::And(parse_list(inner, key)?)),
                    "or" => return Ok(Predicate::Or(parse_list(inner, key)?)),
                    "not" => return Ok(Predicate::Not(Box::new(Predicate::parse(inner)?))),
                    _ => {}
                }
            }
        }

        if let Some(unknown) = object
            .keys()
            .find(|k| !matches!(k.as_str(), "field" | "op" | "value"))
        {
            return Err(format!("unknown predicate key {unknown:?}"));
        }

        let field = match object.get("field") {
            Some(Value::String(field)) => field.clone(),
            _ => return Err("a comparison needs a string \"field\"".to_string()),
        };
        let op = match object.get("op") {
            Some(Value::String(op)) => op
                .parse::<CompareOp>()
                .map_err(|_| format!("unknown predicate operator {op:?}"))?,
            _ => return Err("a comparison needs a string \"op\"".to_string()),
        };

        let value = match (op, object.get("value")) {
            (CompareOp::Exists | CompareOp::NotExists, None) => Operand::Literal(Value::Null),
            (_, None) => return Err(format!("operator {op} needs a \"value\"")),
            (_, Some(Value::Object(o))) if o.len() == 1 && o.contains_key("pin") => {
                match o.get("pin") {
                    Some(Value::String(label)) => Operand::Pin(label.clone()),
                    _ => return Err("\"pin\" must name an input pin label".to_string()),
                }
            }
            (_, Some(v)) => Operand::Literal(v.clone()),
        };

        if op == CompareOp::In {
            if let Operand::Literal(ref v) = value {
                if !v.is_array() {
                    return Err(format!("operator in needs a list value, got {v}"));
                }
            }
        }

        Ok(Predicate::Compare { field, op, value })
    }

    /// Labels of input pins the predicate compares against
    pub fn pin_labels(&self) -> Vec<&str> {
        match self {
            Predicate::And(items) | Predicate::Or(items) => {
                items.iter().flat_map(|p| p.pin_labels()).collect()
            }
            Predicate::Not(inner) => inner.pin_labels(),
            Predicate::Compare {
                value: Operand::Pin(label),
                ..
            } => vec![label.as_str()],
            Predicate::Compare { .. } => vec![],
        }
    }

    pub fn evaluate(&self, subject: &Value, pins: &Map<String, Value>) -> bool {
        match self {
            Predicate::And(items) => items.iter().all(|p| p.evaluate(subject, pins)),
            Predicate::Or(items) => items.iter().any(|p| p.evaluate(subject, pins)),
            Predicate::Not(inner) => !inner.evaluate(subject, pins),
            Predicate::Compare { field, op, value } => {
                let left = lookup(subject, field).unwrap_or(&Value::Null);
                let right = match value {
                    Operand::Literal(v) => v,
                    Operand::Pin(label) => pins.get(label).unwrap_or(&Value::Null),
                };
                compare(left, *op, right)
            }
        }
    }
}

/// Resolve a dotted path (`address.city`, `items.0`) inside a value. `.` or an
/// empty path is the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() || path == "." {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Equality that treats `"42"` and `42` alike, since request parameters
/// always arrive as strings
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_number(left), as_number(right)), (Some(l), Some(r)) if l == r)
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => false,
    }
}

fn loose_cmp(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => Some(l.cmp(r)),
        },
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => loose_eq(left, right),
        CompareOp::Ne => !loose_eq(left, right),
        CompareOp::Gt => loose_cmp(left, right) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            loose_cmp(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => loose_cmp(left, right) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            loose_cmp(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| loose_eq(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        CompareOp::In => match right {
            Value::Array(items) => items.iter().any(|i| loose_eq(left, i)),
            _ => false,
        },
        CompareOp::Exists => !left.is_null(),
        CompareOp::NotExists => left.is_null(),
    }
}
