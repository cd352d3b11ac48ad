//! Tagged-union payload type carried by every dispatched request.
//!
//! Control params and responses are ordered string-keyed mappings
//! ([`Dict`]). Handlers pull typed fields out with the [`DictExt`]
//! accessors, which turn a missing or mistyped field into
//! `InvalidParameter` naming the key.

use crate::errors::ReceiverError;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered string-keyed property mapping.
pub type Dict = IndexMap<String, Value>;

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Dict(Dict),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers are accepted where a float is expected.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Booleans also arrive as 0/1 integers from some controllers.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Consume the value as a mapping, treating anything else as an empty one.
    #[must_use]
    pub fn into_dict(self) -> Dict {
        match self {
            Value::Dict(d) => d,
            _ => Dict::new(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
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

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Dict> for Value {
    fn from(v: Dict) -> Self {
        Value::Dict(v)
    }
}

/// Typed field access on a [`Dict`].
pub trait DictExt {
    fn str_field(&self, key: &str) -> Option<&str>;
    fn int_field(&self, key: &str) -> Option<i64>;
    fn float_field(&self, key: &str) -> Option<f64>;
    fn bool_field(&self, key: &str) -> Option<bool>;
    fn array_field(&self, key: &str) -> Option<&[Value]>;
    fn dict_field(&self, key: &str) -> Option<&Dict>;

    /// # Errors
    ///
    /// `InvalidParameter` if the key is missing or not an integer.
    fn require_int(&self, key: &str) -> Result<i64, ReceiverError> {
        self.int_field(key)
            .ok_or_else(|| ReceiverError::InvalidParameter(format!("'{key}' must be an integer")))
    }

    /// # Errors
    ///
    /// `InvalidParameter` if the key is missing or not a string.
    fn require_str(&self, key: &str) -> Result<&str, ReceiverError> {
        self.str_field(key)
            .ok_or_else(|| ReceiverError::InvalidParameter(format!("'{key}' must be a string")))
    }
}

impl DictExt for Dict {
    fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn int_field(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    fn float_field(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn array_field(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    fn dict_field(&self, key: &str) -> Option<&Dict> {
        self.get(key).and_then(Value::as_dict)
    }
}
