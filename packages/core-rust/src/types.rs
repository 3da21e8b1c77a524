use std::collections::BTreeMap;

use serde::Serialize;

/// Structured arguments passed to a capability operation.
///
/// Keyed by `BTreeMap` so that iteration order is independent of the order in
/// which callers inserted the arguments. Fingerprinting relies on this.
pub type Arguments = BTreeMap<String, Value>;

/// Generic runtime value exchanged between the gateway and capability modules.
///
/// Supports all JSON-compatible types plus binary data. Results stored in the
/// result cache are fully materialized `Value`s, so a cached answer never needs
/// the producing module to be resident.
///
/// Serializes as plain JSON. Inbound JSON is converted with `From<serde_json::Value>`
/// rather than deserialized, since `Bytes` and `Array` are indistinguishable on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed map with deterministic iteration order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string slice if this is a `Value::String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is a `Value::Int`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns `true` for `Value::Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Cheap estimate of the heap bytes held by this value.
    ///
    /// Used for the memory-pressure estimate, so it favours speed over
    /// precision: container overhead is approximated by a fixed per-element
    /// cost.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        const SLOT: usize = std::mem::size_of::<Value>();
        match self {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => SLOT,
            Value::String(s) => SLOT + s.len(),
            Value::Bytes(b) => SLOT + b.len(),
            Value::Array(items) => SLOT + items.iter().map(Value::estimated_size).sum::<usize>(),
            Value::Map(map) => {
                SLOT + map
                    .iter()
                    .map(|(k, v)| k.len() + v.estimated_size())
                    .sum::<usize>()
            }
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

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Builds [`Arguments`] from key/value pairs.
///
/// ```
/// use capgate_core::types::{args, Value};
///
/// let a = args([("key", Value::from("user:1")), ("ttl", Value::Int(30))]);
/// assert_eq!(a.len(), 2);
/// ```
pub fn args<K, I>(pairs: I) -> Arguments
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Converts a JSON object into [`Arguments`]. Non-object JSON yields an empty
/// argument map.
#[must_use]
pub fn args_from_json(json: serde_json::Value) -> Arguments {
    match Value::from(json) {
        Value::Map(map) => map,
        _ => Arguments::new(),
    }
}
