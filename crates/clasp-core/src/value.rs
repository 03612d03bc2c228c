//! Dynamic values carried by CLASP messages

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Value type that can be sent in messages.
///
/// Exactly eight variants; deserialization of anything else is a decode
/// error. Variant order matters for serde(untagged): Array must come before
/// Bytes because MessagePack arrays of small integers would otherwise be
/// misread as binary data. Bytes go through serde_bytes so they hit the
/// wire as the MessagePack bin format rather than an integer array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    /// Numeric view. Ints widen to f64; everything else is non-numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Ordering used by the Max/Min conflict strategies. Defined only when
    /// both sides are numeric: Int/Int compares exactly, anything involving
    /// a Float compares as f64. NaN never orders.
    pub fn numeric_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Absolute numeric distance, used by epsilon throttling.
    pub fn numeric_delta(&self, other: &Value) -> Option<f64> {
        Some((self.as_f64()? - other.as_f64()?).abs())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cmp_int_exact() {
        let a = Value::Int(i64::MAX);
        let b = Value::Int(i64::MAX - 1);
        assert_eq!(a.numeric_cmp(&b), Some(Ordering::Greater));
    }

    #[test]
    fn numeric_cmp_mixed() {
        assert_eq!(
            Value::Int(2).numeric_cmp(&Value::Float(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Bool(true).numeric_cmp(&Value::Int(1)), None);
        assert_eq!(
            Value::Float(f64::NAN).numeric_cmp(&Value::Float(0.0)),
            None
        );
    }

    #[test]
    fn delta() {
        let d = Value::Float(0.15).numeric_delta(&Value::Float(0.05)).unwrap();
        assert!((d - 0.1).abs() < 1e-9);
        assert_eq!(Value::String("x".into()).numeric_delta(&Value::Int(1)), None);
    }
}
