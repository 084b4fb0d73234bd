// Scalar and list values flowing through filters, records and aggregates

use crate::schema::FieldType;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// A dynamically typed field value. Records store one `Value` per field;
/// the schema registry decides which variants a field may hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::List(_) => "list",
        }
    }

    /// Ordering between two values of comparable kinds. Ints and floats
    /// compare numerically; everything else only against its own kind.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality used by filters: numeric kinds compare by value and strings
    /// optionally ignore case.
    pub fn matches(&self, other: &Value, insensitive: bool) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) if insensitive => {
                a.to_lowercase() == b.to_lowercase()
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.matches(y, insensitive))
            }
            (Value::Null, Value::Null) => true,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Canonical string form used as a hash key by indexes, `distinct` and
    /// `groupBy`. Numerically equal ints and floats share a key.
    pub fn index_key(&self) -> String {
        match self {
            Value::Null => "~".to_string(),
            Value::Bool(b) => format!("b:{b}"),
            Value::Int(n) => format!("n:{n}"),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    format!("n:{}", *f as i64)
                } else {
                    format!("n:{f}")
                }
            }
            Value::String(s) => format!("s:{s}"),
            Value::DateTime(d) => format!("t:{}", d.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Value::List(items) => {
                let keys: Vec<String> = items.iter().map(Value::index_key).collect();
                format!("l:[{}]", keys.join("\u{1f}"))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(d) => {
                serde_json::Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Decode a JSON value for a field of the given declared type.
    /// Returns `None` when the JSON shape does not fit the type.
    pub fn from_json(json: &serde_json::Value, ty: FieldType, list: bool) -> Option<Value> {
        use serde_json::Value as Json;

        if json.is_null() {
            return Some(Value::Null);
        }
        if list {
            return json
                .as_array()?
                .iter()
                .map(|item| Value::from_json(item, ty, false))
                .collect::<Option<Vec<_>>>()
                .map(Value::List);
        }
        match (ty, json) {
            (FieldType::String, Json::String(s)) => Some(Value::String(s.clone())),
            (FieldType::Int, Json::Number(n)) => n.as_i64().map(Value::Int),
            (FieldType::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
            (FieldType::Boolean, Json::Bool(b)) => Some(Value::Bool(*b)),
            (FieldType::DateTime, Json::String(s)) => parse_datetime(s).map(Value::DateTime),
            _ => None,
        }
    }

    /// Coerce a scalar literal to a declared field type: ints widen to
    /// floats, integral floats narrow to ints and RFC 3339 strings become
    /// datetimes. Null passes through.
    pub fn coerce_scalar(self, ty: FieldType) -> Option<Value> {
        match (ty, self) {
            (_, Value::Null) => Some(Value::Null),
            (FieldType::String, v @ Value::String(_)) => Some(v),
            (FieldType::Int, v @ Value::Int(_)) => Some(v),
            (FieldType::Int, Value::Float(f)) if f.fract() == 0.0 => Some(Value::Int(f as i64)),
            (FieldType::Float, Value::Int(n)) => Some(Value::Float(n as f64)),
            (FieldType::Float, v @ Value::Float(_)) => Some(v),
            (FieldType::Boolean, v @ Value::Bool(_)) => Some(v),
            (FieldType::DateTime, v @ Value::DateTime(_)) => Some(v),
            (FieldType::DateTime, Value::String(s)) => parse_datetime(&s).map(Value::DateTime),
            _ => None,
        }
    }

    /// Parse command-line text as a scalar of the given type. The literal
    /// `null` parses as `Value::Null` for every type.
    pub fn parse_as(text: &str, ty: FieldType) -> Option<Value> {
        if text == "null" {
            return Some(Value::Null);
        }
        match ty {
            FieldType::String => Some(Value::String(text.to_string())),
            FieldType::Int => text.parse().ok().map(Value::Int),
            FieldType::Float => text.parse().ok().map(Value::Float),
            FieldType::Boolean => text.parse().ok().map(Value::Bool),
            FieldType::DateTime => parse_datetime(text).map(Value::DateTime),
        }
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::DateTime(d) => {
                serializer.serialize_str(&d.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::List(items) => items.serialize(serializer),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::DateTime(d)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison_across_kinds() {
        assert_eq!(Value::Int(3).compare(&Value::Float(2.5)), Some(Ordering::Greater));
        assert_eq!(Value::Float(1.0).compare(&Value::Int(1)), Some(Ordering::Equal));
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_insensitive_match() {
        assert!(Value::from("Rust").matches(&Value::from("rust"), true));
        assert!(!Value::from("Rust").matches(&Value::from("rust"), false));
    }

    #[test]
    fn test_index_key_unifies_integral_floats() {
        assert_eq!(Value::Int(4).index_key(), Value::Float(4.0).index_key());
        assert_ne!(Value::from("4").index_key(), Value::Int(4).index_key());
    }

    #[test]
    fn test_from_json_respects_declared_type() {
        let json = serde_json::json!(["a", "b", "a"]);
        assert_eq!(
            Value::from_json(&json, FieldType::String, true),
            Some(Value::from(vec!["a", "b", "a"]))
        );
        assert_eq!(Value::from_json(&serde_json::json!("x"), FieldType::Int, false), None);
        let when = Value::from_json(
            &serde_json::json!("2026-02-13T10:00:00Z"),
            FieldType::DateTime,
            false,
        );
        assert!(matches!(when, Some(Value::DateTime(_))));
    }

    #[test]
    fn test_coerce_scalar() {
        assert_eq!(Value::Int(2).coerce_scalar(FieldType::Float), Some(Value::Float(2.0)));
        assert_eq!(Value::Float(2.5).coerce_scalar(FieldType::Int), None);
        assert_eq!(Value::from("x").coerce_scalar(FieldType::Boolean), None);
    }

    #[test]
    fn test_parse_as() {
        assert_eq!(Value::parse_as("80", FieldType::Int), Some(Value::Int(80)));
        assert_eq!(Value::parse_as("true", FieldType::Boolean), Some(Value::Bool(true)));
        assert_eq!(Value::parse_as("null", FieldType::String), Some(Value::Null));
        assert_eq!(Value::parse_as("eighty", FieldType::Int), None);
    }
}
