//! Live schema snapshots read from shard catalogs.

use super::history::DEFAULT_HISTORY_TABLE;
use crate::config::StatementConfig;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::types::{now_ms, Row, ShardId, Statement, Value};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
}

impl ColumnSchema {
    /// Create a column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable,
            default_value: None,
        }
    }

    /// Set the default expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }
}

/// A table and its columns in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Create a table.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Point-in-time schema of one shard. Never persisted.
#[derive(Debug, Clone)]
pub struct ShardSchema {
    pub shard_id: ShardId,
    /// Tables sorted by name.
    pub tables: Vec<TableSchema>,
    /// Milliseconds since the Unix epoch (UTC).
    pub snapshot_at_ms: u64,
}

impl ShardSchema {
    /// Create a snapshot taken now. Tables are sorted by name.
    pub fn new(shard_id: ShardId, mut tables: Vec<TableSchema>) -> Self {
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            shard_id,
            tables,
            snapshot_at_ms: now_ms(),
        }
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Reads live table and column metadata from a shard.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync + fmt::Debug {
    async fn introspect(&self, shard_id: &ShardId) -> Result<ShardSchema>;
}

/// Introspector querying `information_schema.columns`.
///
/// The migration ledger table is excluded by default so it never shows up as
/// drift.
#[derive(Debug)]
pub struct SqlSchemaIntrospector {
    factory: Arc<dyn ConnectionFactory>,
    config: StatementConfig,
    schema_name: String,
    excluded_tables: Vec<String>,
}

impl SqlSchemaIntrospector {
    /// Introspect the `public` schema.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: StatementConfig) -> Self {
        Self {
            factory,
            config,
            schema_name: "public".to_string(),
            excluded_tables: vec![DEFAULT_HISTORY_TABLE.to_string()],
        }
    }

    /// Introspect a different catalog schema.
    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    /// Ignore a table.
    pub fn with_excluded_table(mut self, table: impl Into<String>) -> Self {
        self.excluded_tables.push(table.into());
        self
    }

    fn statement(&self) -> Statement {
        let sql = format!(
            "SELECT table_name, column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns WHERE table_schema = {} \
             ORDER BY table_name, ordinal_position",
            self.config.parameter_style.placeholder(0)
        );
        Statement::with_params(sql, vec![Value::from(self.schema_name.as_str())])
    }

    fn parse(&self, shard_id: &ShardId, rows: Vec<Row>) -> Result<ShardSchema> {
        let malformed = |reason: String| Error::SchemaComparisonFailed {
            shard_id: shard_id.clone(),
            reason,
        };
        let text = |row: &Row, column: &str| {
            row.get(column)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| malformed(format!("catalog row has no {}", column)))
        };

        let mut tables: BTreeMap<String, Vec<ColumnSchema>> = BTreeMap::new();
        for row in &rows {
            let table = text(row, "table_name")?;
            if self.excluded_tables.contains(&table) {
                continue;
            }
            let is_nullable = row
                .get("is_nullable")
                .and_then(Value::as_bool)
                .ok_or_else(|| malformed("catalog row has no is_nullable".into()))?;
            tables.entry(table).or_default().push(ColumnSchema {
                name: text(row, "column_name")?,
                data_type: text(row, "data_type")?,
                is_nullable,
                default_value: row.get("column_default").and_then(Value::as_str).map(str::to_string),
            });
        }

        Ok(ShardSchema::new(
            shard_id.clone(),
            tables
                .into_iter()
                .map(|(name, columns)| TableSchema::new(name, columns))
                .collect(),
        ))
    }
}

#[async_trait]
impl SchemaIntrospector for SqlSchemaIntrospector {
    async fn introspect(&self, shard_id: &ShardId) -> Result<ShardSchema> {
        let connection = self.factory.get_connection(shard_id).await?;
        let rows = connection.execute_reader(&self.statement()).await?;
        let schema = self.parse(shard_id, rows)?;
        tracing::debug!(shard_id = %shard_id, tables = schema.tables.len(), "Introspected shard schema");
        Ok(schema)
    }
}

/// Introspector serving schemas set directly.
#[derive(Debug, Default)]
pub struct InMemorySchemaIntrospector {
    schemas: RwLock<HashMap<ShardId, Vec<TableSchema>>>,
}

impl InMemorySchemaIntrospector {
    /// Create an introspector with no schemas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a shard's tables.
    pub fn set_tables(&self, shard_id: impl Into<ShardId>, tables: Vec<TableSchema>) {
        self.schemas.write().insert(shard_id.into(), tables);
    }
}

#[async_trait]
impl SchemaIntrospector for InMemorySchemaIntrospector {
    async fn introspect(&self, shard_id: &ShardId) -> Result<ShardSchema> {
        let tables = self
            .schemas
            .read()
            .get(shard_id)
            .cloned()
            .ok_or_else(|| Error::UnknownShard(shard_id.to_string()))?;
        Ok(ShardSchema::new(shard_id.clone(), tables))
    }
}
