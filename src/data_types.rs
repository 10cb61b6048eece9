use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

pub type TableId = Uuid;
pub type ColumnId = Uuid;
pub type EndpointId = Uuid;
pub type Timestamp = DateTime<Utc>;

/// Current time at the precision every catalog backend can store
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}

/// Column types a table can declare. Each one maps to exactly one physical
/// type per storage dialect (see `repository::default::PhysicalTypes`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogicalType {
    Text,
    Integer,
    Uuid,
    Timestamp,
    Boolean,
    #[serde(alias = "structured-document")]
    #[strum(to_string = "json", serialize = "structured-document")]
    Json,
}

/// A value ready to be bound to a statement parameter. The variant always
/// follows the target column's logical type so that NULLs are typed too.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Integer(Option<i64>),
    Uuid(Option<Uuid>),
    Timestamp(Option<Timestamp>),
    Boolean(Option<bool>),
    Json(Option<Json<Value>>),
}

impl SqlValue {
    pub fn null(logical_type: LogicalType) -> Self {
        match logical_type {
            LogicalType::Text => SqlValue::Text(None),
            LogicalType::Integer => SqlValue::Integer(None),
            LogicalType::Uuid => SqlValue::Uuid(None),
            LogicalType::Timestamp => SqlValue::Timestamp(None),
            LogicalType::Boolean => SqlValue::Boolean(None),
            LogicalType::Json => SqlValue::Json(None),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Text(v) => v.is_none(),
            SqlValue::Integer(v) => v.is_none(),
            SqlValue::Uuid(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
            SqlValue::Boolean(v) => v.is_none(),
            SqlValue::Json(v) => v.is_none(),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            SqlValue::Text(v) => v.map(Value::String),
            SqlValue::Integer(v) => v.map(Value::from),
            SqlValue::Uuid(v) => v.map(|u| Value::String(u.to_string())),
            SqlValue::Timestamp(v) => v.map(|t| Value::String(t.to_rfc3339())),
            SqlValue::Boolean(v) => v.map(Value::Bool),
            SqlValue::Json(v) => v.map(|j| j.0),
        }
        .unwrap_or(Value::Null)
    }
}

impl LogicalType {
    /// Coerce a JSON value (usually coming from a request or a CSV field) into
    /// a value of this type. Strings are parsed, since path and query
    /// parameters always arrive as text.
    pub fn coerce(&self, value: &Value) -> Result<SqlValue, String> {
        if value.is_null() {
            return Ok(SqlValue::null(*self));
        }

        let mismatch = || format!("expected a {self} value, got {value}");

        Ok(match self {
            LogicalType::Text => SqlValue::Text(Some(match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(mismatch()),
            })),
            LogicalType::Integer => SqlValue::Integer(Some(match value {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i,
                    None => match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => f as i64,
                        _ => return Err(mismatch()),
                    },
                },
                Value::String(s) => s.trim().parse::<i64>().map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            })),
            LogicalType::Uuid => SqlValue::Uuid(Some(match value {
                Value::String(s) => Uuid::parse_str(s.trim()).map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            })),
            LogicalType::Timestamp => SqlValue::Timestamp(Some(match value {
                Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map_err(|_| mismatch())?
                    .with_timezone(&Utc),
                _ => return Err(mismatch()),
            })),
            LogicalType::Boolean => SqlValue::Boolean(Some(match value {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_i64() == Some(0) => false,
                Value::Number(n) if n.as_i64() == Some(1) => true,
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" | "yes" => true,
                    "false" | "f" | "0" | "no" => false,
                    _ => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            })),
            // Text fields (e.g. from CSV) holding JSON are parsed, anything
            // else is stored as-is
            LogicalType::Json => SqlValue::Json(Some(Json(match value {
                Value::String(s) => {
                    serde_json::from_str(s).unwrap_or_else(|_| value.clone())
                }
                other => other.clone(),
            }))),
        })
    }
}
