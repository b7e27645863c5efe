//! Documents and row keys.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::config::KeyType;
use crate::error::{TableError, TableResult};

/// A record stored in a table.
///
/// Implemented for every serde-serializable type that can cross threads.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Document for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Primary key of a stored row: the document key, or the row id when the
/// table has no key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl RowKey {
    pub(crate) fn to_param(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Read a key back from a result cell.
    pub(crate) fn from_cell(cell: &Value) -> Option<Self> {
        match cell {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) => None,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RowKey {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Follow a validated dot path (with `[n]` subscripts) into a JSON value.
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let mut parts = segment.split('[');
        let name = parts.next()?;
        current = current.get(name)?;
        for index in parts {
            let index: usize = index.trim_end_matches(']').parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Pull the key out of a serialized document.
pub(crate) fn extract_key(doc: &Value, path: &str, key_type: KeyType) -> TableResult<RowKey> {
    let value = match lookup(doc, path) {
        Some(Value::Null) | None => {
            return Err(TableError::MissingKey {
                path: path.to_string(),
            })
        }
        Some(value) => value,
    };
    let key = match key_type {
        KeyType::Text => value.as_str().map(|s| RowKey::Text(s.to_string())),
        KeyType::Integer => value.as_i64().map(RowKey::Int),
    };
    key.ok_or_else(|| TableError::InvalidKey {
        path: path.to_string(),
        expected: match key_type {
            KeyType::Text => "a string",
            KeyType::Integer => "an integer",
        },
        found: kind_of(value).to_string(),
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
