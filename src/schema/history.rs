//! Per-shard migration ledger.
//!
//! The ledger is append-only: applying a migration adds a record, rolling it
//! back stamps `rolled_back_at_ms` on the active record. A migration is
//! active while that stamp is unset. Re-applying after a rollback appends a
//! fresh record, so the full history survives.

use crate::config::StatementConfig;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::types::{now_ms, quote_identifier, Row, ShardId, Statement, Value};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use twox_hash::XxHash64;

/// Default ledger table name.
pub const DEFAULT_HISTORY_TABLE: &str = "__shardwise_migrations";

/// A schema change with its reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Unique, ordered identifier (e.g. `20240101_001_create_users`).
    pub id: String,
    pub description: String,
    pub up_sql: String,
    pub down_sql: String,
    /// xxHash64 of `up_sql`, hex encoded.
    pub checksum: String,
}

impl Migration {
    /// Create a migration, computing its checksum.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        let up_sql = up_sql.into();
        let checksum = Self::checksum_of(&up_sql);
        Self {
            id: id.into(),
            description: description.into(),
            up_sql,
            down_sql: down_sql.into(),
            checksum,
        }
    }

    /// Checksum of a migration script.
    pub fn checksum_of(script: &str) -> String {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(script.as_bytes());
        format!("{:016x}", hasher.finish())
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: String,
    pub description: String,
    pub checksum: String,
    /// Milliseconds since the Unix epoch (UTC).
    pub applied_at_ms: u64,
    pub duration_ms: u64,
    /// Set once the migration is rolled back.
    pub rolled_back_at_ms: Option<u64>,
}

impl MigrationRecord {
    /// Whether the migration is still in effect.
    pub fn is_active(&self) -> bool {
        self.rolled_back_at_ms.is_none()
    }

    fn from_row(row: &Row) -> Result<Self> {
        let text = |column: &str| {
            row.get(column)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Statement(format!("history row has no text column {}", column)))
        };
        let int = |column: &str| {
            row.get(column)
                .and_then(Value::as_i64)
                .map(|v| v.max(0) as u64)
                .ok_or_else(|| Error::Statement(format!("history row has no integer column {}", column)))
        };
        Ok(Self {
            id: text("migration_id")?,
            description: text("description")?,
            checksum: text("checksum")?,
            applied_at_ms: int("applied_at_ms")?,
            duration_ms: int("duration_ms")?,
            rolled_back_at_ms: row
                .get("rolled_back_at_ms")
                .and_then(Value::as_i64)
                .map(|v| v.max(0) as u64),
        })
    }
}

/// Ids of active records, in first-applied order.
fn active_ids(records: &[MigrationRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| r.is_active() && seen.insert(r.id.clone()))
        .map(|r| r.id.clone())
        .collect()
}

/// Durable per-shard migration ledger.
#[async_trait]
pub trait MigrationHistoryStore: Send + Sync + fmt::Debug {
    /// Create the ledger on the shard if it does not exist.
    async fn ensure_history_table(&self, shard_id: &ShardId) -> Result<()>;

    /// Ids of active migrations, in the order they were applied.
    async fn get_applied(&self, shard_id: &ShardId) -> Result<Vec<String>>;

    /// Append a record for `migration`.
    async fn record_applied(&self, shard_id: &ShardId, migration: &Migration, duration: Duration) -> Result<()>;

    /// Stamp the active record of `migration_id` as rolled back.
    ///
    /// Fails with `RollbackFailed` when no active record exists.
    async fn record_rolled_back(&self, shard_id: &ShardId, migration_id: &str) -> Result<()>;

    /// Every record, oldest first.
    async fn history(&self, shard_id: &ShardId) -> Result<Vec<MigrationRecord>>;

    /// The active record of `migration_id`, if any.
    async fn active_record(&self, shard_id: &ShardId, migration_id: &str) -> Result<Option<MigrationRecord>> {
        Ok(self
            .history(shard_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.id == migration_id && r.is_active()))
    }
}

fn not_applied(shard_id: &ShardId, migration_id: &str) -> Error {
    Error::RollbackFailed {
        shard_id: shard_id.clone(),
        migration_id: migration_id.to_string(),
        reason: "migration is not applied".into(),
    }
}

/// Ledger stored in a table on each shard.
#[derive(Debug)]
pub struct SqlMigrationHistoryStore {
    factory: Arc<dyn ConnectionFactory>,
    config: StatementConfig,
    table: String,
}

impl SqlMigrationHistoryStore {
    /// Create a store using [`DEFAULT_HISTORY_TABLE`].
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: StatementConfig) -> Result<Self> {
        Self::with_table(factory, config, DEFAULT_HISTORY_TABLE)
    }

    /// Create a store using a custom ledger table.
    pub fn with_table(
        factory: Arc<dyn ConnectionFactory>,
        config: StatementConfig,
        table: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let table = quote_identifier(&table.into())?;
        Ok(Self { factory, config, table })
    }

    fn placeholder(&self, index: usize) -> String {
        self.config.parameter_style.placeholder(index)
    }
}

#[async_trait]
impl MigrationHistoryStore for SqlMigrationHistoryStore {
    async fn ensure_history_table(&self, shard_id: &ShardId) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             migration_id VARCHAR(255) NOT NULL, \
             description TEXT NOT NULL, \
             checksum VARCHAR(64) NOT NULL, \
             applied_at_ms BIGINT NOT NULL, \
             duration_ms BIGINT NOT NULL, \
             rolled_back_at_ms BIGINT NULL, \
             PRIMARY KEY (migration_id, applied_at_ms))",
            self.table
        );
        let connection = self.factory.get_connection(shard_id).await?;
        connection.execute_non_query(&Statement::new(sql)).await?;
        Ok(())
    }

    async fn get_applied(&self, shard_id: &ShardId) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT migration_id FROM {} WHERE rolled_back_at_ms IS NULL ORDER BY applied_at_ms, migration_id",
            self.table
        );
        let connection = self.factory.get_connection(shard_id).await?;
        let rows = connection.execute_reader(&Statement::new(sql)).await?;
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row
                .get("migration_id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Statement("history row has no migration_id".into()))?;
            if seen.insert(id.to_string()) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    async fn record_applied(&self, shard_id: &ShardId, migration: &Migration, duration: Duration) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (migration_id, description, checksum, applied_at_ms, duration_ms) VALUES ({})",
            self.table,
            self.config.parameter_style.placeholders(0, 5)
        );
        let params = vec![
            Value::from(migration.id.as_str()),
            Value::from(migration.description.as_str()),
            Value::from(migration.checksum.as_str()),
            Value::Int(now_ms() as i64),
            Value::Int(duration.as_millis() as i64),
        ];
        let connection = self.factory.get_connection(shard_id).await?;
        connection.execute_non_query(&Statement::with_params(sql, params)).await?;
        tracing::info!(shard_id = %shard_id, migration_id = %migration.id, "Recorded migration");
        Ok(())
    }

    async fn record_rolled_back(&self, shard_id: &ShardId, migration_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET rolled_back_at_ms = {} WHERE migration_id = {} AND rolled_back_at_ms IS NULL",
            self.table,
            self.placeholder(0),
            self.placeholder(1)
        );
        let params = vec![Value::Int(now_ms() as i64), Value::from(migration_id)];
        let connection = self.factory.get_connection(shard_id).await?;
        let affected = connection.execute_non_query(&Statement::with_params(sql, params)).await?;
        if affected == 0 {
            return Err(not_applied(shard_id, migration_id));
        }
        tracing::info!(shard_id = %shard_id, migration_id, "Recorded rollback");
        Ok(())
    }

    async fn history(&self, shard_id: &ShardId) -> Result<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT migration_id, description, checksum, applied_at_ms, duration_ms, rolled_back_at_ms \
             FROM {} ORDER BY applied_at_ms, migration_id",
            self.table
        );
        let connection = self.factory.get_connection(shard_id).await?;
        let rows = connection.execute_reader(&Statement::new(sql)).await?;
        rows.iter().map(MigrationRecord::from_row).collect()
    }
}

/// Ledger held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMigrationHistoryStore {
    records: RwLock<HashMap<ShardId, Vec<MigrationRecord>>>,
}

impl InMemoryMigrationHistoryStore {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MigrationHistoryStore for InMemoryMigrationHistoryStore {
    async fn ensure_history_table(&self, shard_id: &ShardId) -> Result<()> {
        self.records.write().entry(shard_id.clone()).or_default();
        Ok(())
    }

    async fn get_applied(&self, shard_id: &ShardId) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .get(shard_id)
            .map(|records| active_ids(records))
            .unwrap_or_default())
    }

    async fn record_applied(&self, shard_id: &ShardId, migration: &Migration, duration: Duration) -> Result<()> {
        self.records
            .write()
            .entry(shard_id.clone())
            .or_default()
            .push(MigrationRecord {
                id: migration.id.clone(),
                description: migration.description.clone(),
                checksum: migration.checksum.clone(),
                applied_at_ms: now_ms(),
                duration_ms: duration.as_millis() as u64,
                rolled_back_at_ms: None,
            });
        Ok(())
    }

    async fn record_rolled_back(&self, shard_id: &ShardId, migration_id: &str) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(shard_id)
            .and_then(|records| {
                records
                    .iter_mut()
                    .rev()
                    .find(|r| r.id == migration_id && r.is_active())
            })
            .ok_or_else(|| not_applied(shard_id, migration_id))?;
        record.rolled_back_at_ms = Some(now_ms());
        Ok(())
    }

    async fn history(&self, shard_id: &ShardId) -> Result<Vec<MigrationRecord>> {
        Ok(self.records.read().get(shard_id).cloned().unwrap_or_default())
    }
}
