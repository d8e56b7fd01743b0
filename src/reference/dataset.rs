//! Reference table definitions and order-independent content hashing.

use crate::error::{Error, Result};
use crate::types::{Row, Value};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Seed for content hashes. Changing it changes every digest.
const CONTENT_HASH_SEED: u64 = 0;

/// A small table replicated identically to every shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTable {
    /// Table name, optionally schema-qualified.
    pub name: String,
    /// Primary key columns.
    pub primary_key: Vec<String>,
    /// All columns, primary key included, in statement order.
    pub columns: Vec<String>,
}

impl ReferenceTable {
    /// Create a table definition. Primary key columns missing from `columns`
    /// are prepended.
    pub fn new<K, C, S>(name: impl Into<String>, primary_key: K, columns: C) -> Self
    where
        K: IntoIterator<Item = S>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let primary_key: Vec<String> = primary_key.into_iter().map(Into::into).collect();
        let mut all = primary_key.clone();
        for column in columns {
            let column = column.into();
            if !all.contains(&column) {
                all.push(column);
            }
        }
        Self {
            name: name.into(),
            primary_key,
            columns: all,
        }
    }

    /// Non-key columns.
    pub fn value_columns(&self) -> impl Iterator<Item = &String> {
        self.columns.iter().filter(|c| !self.primary_key.contains(c))
    }

    /// Check the definition for errors.
    pub fn validate(&self) -> Result<()> {
        if self.primary_key.is_empty() {
            return Err(Error::Config(format!(
                "reference table {} has no primary key",
                self.name
            )));
        }
        Ok(())
    }

    /// Primary key values of `row`, in key order.
    pub fn key_of(&self, row: &Row) -> Result<Vec<Value>> {
        self.primary_key
            .iter()
            .map(|column| match row.get(column) {
                Some(value) if !value.is_null() => Ok(value.clone()),
                _ => Err(Error::Statement(format!(
                    "row of {} has no value for key column {}",
                    self.name, column
                ))),
            })
            .collect()
    }
}

/// Rows of a reference table with their content hash.
#[derive(Debug, Clone)]
pub struct ReferenceDataset {
    /// Rows as read.
    pub rows: Vec<Row>,
    /// Digest from [`compute_hash`].
    pub hash: String,
}

impl ReferenceDataset {
    /// Hash `rows` and wrap them.
    pub fn from_rows(rows: Vec<Row>) -> Result<Self> {
        let hash = compute_hash(&rows)?;
        Ok(Self { rows, hash })
    }

    /// Row count.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Float values whose bit pattern differs between equal values.
fn canonical_float(value: &Value) -> Option<Value> {
    match value {
        Value::Float(f) if *f == 0.0 => Some(Value::Float(0.0)),
        Value::Float(f) if f.is_nan() => Some(Value::Float(f64::NAN)),
        _ => None,
    }
}

/// Encode a row with `-0.0` folded into `0.0` and every NaN into one NaN.
fn encode_row(row: &Row) -> Result<Vec<u8>> {
    if !row.values().any(|v| canonical_float(v).is_some()) {
        return Ok(bincode::serialize(row)?);
    }
    let normalized: Row = row
        .iter()
        .map(|(column, value)| {
            let value = canonical_float(value).unwrap_or_else(|| value.clone());
            (column.clone(), value)
        })
        .collect();
    Ok(bincode::serialize(&normalized)?)
}

/// Deterministic digest of a row set.
///
/// Each row is encoded with bincode (columns are already ordered by the
/// row map), the encodings are sorted, and the sorted sequence is hashed
/// with xxHash64. Physical row order therefore never affects the digest,
/// and neither does the sign of a zero or the payload of a NaN.
pub fn compute_hash(rows: &[Row]) -> Result<String> {
    let mut encoded = rows.iter().map(encode_row).collect::<Result<Vec<_>>>()?;
    encoded.sort_unstable();

    let mut hasher = XxHash64::with_seed(CONTENT_HASH_SEED);
    hasher.write_u64(encoded.len() as u64);
    for row in &encoded {
        hasher.write_u64(row.len() as u64);
        hasher.write(row);
    }
    Ok(format!("{:016x}", hasher.finish()))
}
