//! Dynamic Values
//!
//! Streams, producers, and the query evaluator all traffic in `Value`, a
//! small self-describing enum. Keeping the value space closed buys three
//! things the runtime relies on:
//!
//! - Equality: a stream update is a no-op when the new value equals the
//!   old one, so `Value` must be `Eq`.
//! - Hashing and ordering: the query evaluator indexes attribution tables
//!   by composite keys built from sorted (key, value) pairs.
//! - Serialization: the diagnostics snapshot dumps current values as JSON.
//!
//! Floating-point values are deliberately absent; they would forfeit `Eq`
//! and `Hash` for every other variant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A dynamically typed value carried by streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// The absence of a value.
    Null,

    /// A boolean.
    Bool(bool),

    /// A signed integer.
    Int(i64),

    /// A string.
    Str(String),

    /// An ordered list of values.
    List(Vec<Value>),
}

impl Value {
    /// Check whether this value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the string contents, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer contents, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
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

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
