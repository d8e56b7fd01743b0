//! Reference table persistence per shard.

use super::dataset::{compute_hash, ReferenceTable};
use crate::config::StatementConfig;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::types::{quote_identifier, Row, ShardId, Statement, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Reads and writes reference table rows on a shard.
#[async_trait]
pub trait ReferenceTableStore: Send + Sync + fmt::Debug {
    /// Insert or replace `rows` by primary key. Returns the affected count.
    ///
    /// Applying the same rows twice leaves the shard unchanged.
    async fn upsert(&self, shard_id: &ShardId, table: &ReferenceTable, rows: &[Row]) -> Result<u64>;

    /// Read every row of `table`.
    async fn read_all(&self, shard_id: &ShardId, table: &ReferenceTable) -> Result<Vec<Row>>;

    /// Digest of the table's current content on a shard.
    async fn content_hash(&self, shard_id: &ShardId, table: &ReferenceTable) -> Result<String> {
        let rows = self.read_all(shard_id, table).await?;
        compute_hash(&rows)
    }
}

/// Reference table store issuing parameterized statements through a
/// [`ConnectionFactory`].
///
/// Upserts use `INSERT ... ON CONFLICT (key) DO UPDATE`, chunked so that no
/// statement binds more than `max_parameters_per_statement` values.
#[derive(Debug)]
pub struct SqlReferenceTableStore {
    factory: Arc<dyn ConnectionFactory>,
    config: StatementConfig,
}

impl SqlReferenceTableStore {
    /// Create a store.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: StatementConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { factory, config })
    }

    /// Rows bound per statement for `table`.
    pub fn rows_per_statement(&self, table: &ReferenceTable) -> Result<usize> {
        let columns = table.columns.len();
        if columns == 0 || columns > self.config.max_parameters_per_statement {
            return Err(Error::Config(format!(
                "table {} has {} columns, limit is {} parameters per statement",
                table.name, columns, self.config.max_parameters_per_statement
            )));
        }
        Ok(self.config.max_parameters_per_statement / columns)
    }

    /// Build the upsert statements for `rows`, one per chunk.
    pub fn upsert_statements(&self, table: &ReferenceTable, rows: &[Row]) -> Result<Vec<Statement>> {
        table.validate()?;
        let chunk_size = self.rows_per_statement(table)?;

        let name = quote_identifier(&table.name)?;
        let columns = table
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        let keys = table
            .primary_key
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        let updates = table
            .value_columns()
            .map(|c| quote_identifier(c).map(|q| format!("{q} = EXCLUDED.{q}")))
            .collect::<Result<Vec<_>>>()?;
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let rows = dedupe_by_key(table, rows)?;
        let style = self.config.parameter_style;
        let width = table.columns.len();
        let mut statements = Vec::new();
        for chunk in rows.chunks(chunk_size) {
            let mut params = Vec::with_capacity(chunk.len() * width);
            let mut tuples = Vec::with_capacity(chunk.len());
            for row in chunk {
                tuples.push(format!("({})", style.placeholders(params.len(), width)));
                params.extend(
                    table
                        .columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null)),
                );
            }
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
                name,
                columns.join(", "),
                tuples.join(", "),
                keys.join(", "),
                conflict
            );
            statements.push(Statement::with_params(sql, params));
        }
        Ok(statements)
    }

    /// Build the statement reading the whole table in key order.
    pub fn select_statement(&self, table: &ReferenceTable) -> Result<Statement> {
        let columns = table
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        let keys = table
            .primary_key
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote_identifier(&table.name)?);
        if !keys.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        Ok(Statement::new(sql))
    }
}

/// Keep one row per primary key, the last one given, in first-seen order.
///
/// A single `INSERT .. ON CONFLICT DO UPDATE` may not touch the same key twice.
fn dedupe_by_key<'a>(table: &ReferenceTable, rows: &'a [Row]) -> Result<Vec<&'a Row>> {
    let mut positions: HashMap<Vec<u8>, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<&Row> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = bincode::serialize(&table.key_of(row)?)?;
        match positions.get(&key) {
            Some(&index) => unique[index] = row,
            None => {
                positions.insert(key, unique.len());
                unique.push(row);
            }
        }
    }
    Ok(unique)
}

#[async_trait]
impl ReferenceTableStore for SqlReferenceTableStore {
    async fn upsert(&self, shard_id: &ShardId, table: &ReferenceTable, rows: &[Row]) -> Result<u64> {
        let statements = self.upsert_statements(table, rows)?;
        if statements.is_empty() {
            return Ok(0);
        }
        let connection = self.factory.get_connection(shard_id).await?;
        let affected = connection.execute_batch(&statements).await?;
        tracing::debug!(
            shard_id = %shard_id,
            table = %table.name,
            rows = rows.len(),
            statements = statements.len(),
            "Upserted reference rows"
        );
        Ok(affected)
    }

    async fn read_all(&self, shard_id: &ShardId, table: &ReferenceTable) -> Result<Vec<Row>> {
        let statement = self.select_statement(table)?;
        let connection = self.factory.get_connection(shard_id).await?;
        connection.execute_reader(&statement).await
    }
}

/// Reference table store held in process memory.
///
/// Rows are keyed by their bincode-encoded primary key.
#[derive(Debug, Default)]
pub struct InMemoryReferenceTableStore {
    tables: DashMap<(ShardId, String), BTreeMap<Vec<u8>, Row>>,
}

impl InMemoryReferenceTableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a row directly, bypassing replication.
    pub fn delete(&self, shard_id: &ShardId, table: &ReferenceTable, key: &[Value]) -> Result<bool> {
        let key = bincode::serialize(key)?;
        Ok(self
            .tables
            .get_mut(&(shard_id.clone(), table.name.clone()))
            .map(|mut rows| rows.remove(&key).is_some())
            .unwrap_or(false))
    }

    /// Row count of a table on a shard.
    pub fn row_count(&self, shard_id: &ShardId, table: &ReferenceTable) -> usize {
        self.tables
            .get(&(shard_id.clone(), table.name.clone()))
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ReferenceTableStore for InMemoryReferenceTableStore {
    async fn upsert(&self, shard_id: &ShardId, table: &ReferenceTable, rows: &[Row]) -> Result<u64> {
        table.validate()?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            keyed.push((bincode::serialize(&table.key_of(row)?)?, row.clone()));
        }

        let mut stored = self
            .tables
            .entry((shard_id.clone(), table.name.clone()))
            .or_default();
        for (key, row) in keyed {
            stored.insert(key, row);
        }
        Ok(rows.len() as u64)
    }

    async fn read_all(&self, shard_id: &ShardId, table: &ReferenceTable) -> Result<Vec<Row>> {
        Ok(self
            .tables
            .get(&(shard_id.clone(), table.name.clone()))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}
