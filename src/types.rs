//! Core types used throughout the routing core.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a physical shard.
///
/// Cheap to clone; shared by the topology, results and ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(Arc<str>);

impl ShardId {
    /// Create a shard ID.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the ID is empty (never valid in a topology).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl AsRef<str> for ShardId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single column value exchanged with a shard connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as text, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read as an integer, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Read as a boolean. Integers are accepted since several providers
    /// report flags as 0/1.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            Value::Text(s) => match s.to_ascii_uppercase().as_str() {
                "YES" | "TRUE" | "1" => Some(true),
                "NO" | "FALSE" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row read from a shard, keyed by column name.
///
/// Column order is normalized by the map so two rows with the same content
/// compare and encode identically.
pub type Row = BTreeMap<String, Value>;

/// How bound parameters are written into statement text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterStyle {
    /// `?` placeholders (SQLite, MySQL).
    Positional,
    /// `$1`, `$2`, ... placeholders (PostgreSQL).
    #[default]
    Numbered,
    /// `@p0`, `@p1`, ... placeholders (SQL Server).
    Named,
}

impl ParameterStyle {
    /// Placeholder for the zero-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            ParameterStyle::Positional => "?".to_string(),
            ParameterStyle::Numbered => format!("${}", index + 1),
            ParameterStyle::Named => format!("@p{}", index),
        }
    }

    /// `count` comma-separated placeholders starting at `start`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A parameterized statement. Values never appear in `sql`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement text with placeholders.
    pub sql: String,
    /// Bound parameters, in placeholder order.
    pub params: Vec<Value>,
}

impl Statement {
    /// Create a statement with no parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Create a statement with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Quote a table or column name for statement text.
///
/// Only ASCII letters, digits, `_` and a single `.` schema separator are
/// accepted; anything else is rejected rather than escaped.
pub fn quote_identifier(name: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in name.split('.') {
        let valid = !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid || parts.len() == 2 {
            return Err(Error::Statement(format!("invalid identifier: {:?}", name)));
        }
        parts.push(format!("\"{}\"", part));
    }
    Ok(parts.join("."))
}

/// Milliseconds since the Unix epoch (UTC).
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
