//! In-memory shard connections for tests.
//!
//! A [`FakeShard`] records every statement it receives and answers queries
//! from scripted responses. Failures and latency are injected per shard.

use crate::connection::{ConnectionFactory, ShardConnection};
use crate::error::{Error, Result};
use crate::sharding::topology::{ShardInfo, ShardTopology};
use crate::types::{Row, ShardId, Statement};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Build a topology of shards with `mem://` endpoints.
pub fn memory_topology(ids: &[&str]) -> Result<Arc<ShardTopology>> {
    let shards = ids
        .iter()
        .map(|id| ShardInfo::new(*id, format!("mem://{}", id)))
        .collect();
    Ok(Arc::new(ShardTopology::new(shards)?))
}

/// Scripted state of one fake shard.
#[derive(Debug)]
pub struct FakeShard {
    shard_id: ShardId,

    /// Every statement executed, in order.
    statements: Mutex<Vec<Statement>>,

    /// (SQL fragment, rows) pairs; the first matching fragment answers a query.
    responses: RwLock<Vec<(String, Vec<Row>)>>,

    /// (SQL fragment, message) pairs; a match fails the statement.
    failures: RwLock<Vec<(String, String)>>,

    /// Affected row count reported by non-queries.
    affected_rows: AtomicU64,

    /// Delay before every statement.
    latency: RwLock<Duration>,

    connections_opened: AtomicU64,
    open_connections: AtomicUsize,
}

impl FakeShard {
    fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            statements: Mutex::new(Vec::new()),
            responses: RwLock::new(Vec::new()),
            failures: RwLock::new(Vec::new()),
            affected_rows: AtomicU64::new(1),
            latency: RwLock::new(Duration::ZERO),
            connections_opened: AtomicU64::new(0),
            open_connections: AtomicUsize::new(0),
        }
    }

    /// The shard ID.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Answer queries containing `fragment` with `rows`.
    pub fn respond_with(&self, fragment: impl Into<String>, rows: Vec<Row>) {
        self.responses.write().push((fragment.into(), rows));
    }

    /// Fail every statement.
    pub fn fail_statements(&self, message: impl Into<String>) {
        self.fail_matching("", message);
    }

    /// Fail statements containing `fragment`.
    pub fn fail_matching(&self, fragment: impl Into<String>, message: impl Into<String>) {
        self.failures.write().push((fragment.into(), message.into()));
    }

    /// Remove injected failures.
    pub fn clear_failures(&self) {
        self.failures.write().clear();
    }

    /// Set the affected row count reported by non-queries.
    pub fn set_affected_rows(&self, rows: u64) {
        self.affected_rows.store(rows, Ordering::SeqCst);
    }

    /// Delay every statement.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Statements executed so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().clone()
    }

    /// SQL text of statements executed so far.
    pub fn executed_sql(&self) -> Vec<String> {
        self.statements.lock().iter().map(|s| s.sql.clone()).collect()
    }

    /// Connections handed out over the shard's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::SeqCst)
    }

    /// Connections handed out and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    async fn run(&self, statement: &Statement) -> Result<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.statements.lock().push(statement.clone());

        let failure = self
            .failures
            .read()
            .iter()
            .find(|(fragment, _)| statement.sql.contains(fragment.as_str()))
            .map(|(_, message)| message.clone());
        match failure {
            Some(message) => Err(Error::Statement(message)),
            None => Ok(()),
        }
    }
}

/// Connection handed out by [`InMemoryConnectionFactory`].
#[derive(Debug)]
pub struct RecordingConnection {
    shard: Arc<FakeShard>,
}

impl RecordingConnection {
    fn open(shard: Arc<FakeShard>) -> Self {
        shard.connections_opened.fetch_add(1, Ordering::SeqCst);
        shard.open_connections.fetch_add(1, Ordering::SeqCst);
        Self { shard }
    }
}

impl Drop for RecordingConnection {
    fn drop(&mut self) {
        self.shard.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShardConnection for RecordingConnection {
    fn shard_id(&self) -> &ShardId {
        &self.shard.shard_id
    }

    async fn execute_non_query(&self, statement: &Statement) -> Result<u64> {
        self.shard.run(statement).await?;
        Ok(self.shard.affected_rows.load(Ordering::SeqCst))
    }

    async fn execute_reader(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.shard.run(statement).await?;
        let rows = self
            .shard
            .responses
            .read()
            .iter()
            .find(|(fragment, _)| statement.sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        Ok(rows)
    }
}

/// Connection factory over a set of [`FakeShard`]s.
#[derive(Debug, Default)]
pub struct InMemoryConnectionFactory {
    shards: DashMap<ShardId, Arc<FakeShard>>,
    unreachable: RwLock<HashSet<ShardId>>,
}

impl InMemoryConnectionFactory {
    /// Create a factory with one fake shard per topology entry.
    pub fn for_topology(topology: &ShardTopology) -> Self {
        let factory = Self::default();
        for shard in topology.shards() {
            factory.add_shard(shard.id.clone());
        }
        factory
    }

    /// Add a shard, returning its fake.
    pub fn add_shard(&self, shard_id: impl Into<ShardId>) -> Arc<FakeShard> {
        let shard_id = shard_id.into();
        Arc::clone(
            self.shards
                .entry(shard_id.clone())
                .or_insert_with(|| Arc::new(FakeShard::new(shard_id)))
                .value(),
        )
    }

    /// The fake behind a shard.
    pub fn shard(&self, shard_id: &ShardId) -> Option<Arc<FakeShard>> {
        self.shards.get(shard_id).map(|s| Arc::clone(s.value()))
    }

    /// Make `get_connection` fail for a shard.
    pub fn set_unreachable(&self, shard_id: impl Into<ShardId>, unreachable: bool) {
        let shard_id = shard_id.into();
        if unreachable {
            self.unreachable.write().insert(shard_id);
        } else {
            self.unreachable.write().remove(&shard_id);
        }
    }

    /// Total connections currently open across all shards.
    pub fn open_connections(&self) -> usize {
        self.shards.iter().map(|s| s.open_connections()).sum()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryConnectionFactory {
    async fn get_connection(&self, shard_id: &ShardId) -> Result<Box<dyn ShardConnection>> {
        if self.unreachable.read().contains(shard_id) {
            return Err(Error::ShardUnreachable {
                shard_id: shard_id.clone(),
                reason: "connection refused".into(),
            });
        }
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| Error::UnknownShard(shard_id.to_string()))?;
        Ok(Box::new(RecordingConnection::open(shard)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[tokio::test]
    async fn test_records_and_answers() {
        let topology = memory_topology(&["s0"]).unwrap();
        let factory = InMemoryConnectionFactory::for_topology(&topology);
        let shard = factory.shard(&"s0".into()).unwrap();
        shard.respond_with(
            "SELECT",
            vec![Row::from([("id".to_string(), Value::Int(1))])],
        );

        let conn = factory.get_connection(&"s0".into()).await.unwrap();
        assert_eq!(conn.execute_non_query(&Statement::new("DELETE FROM t")).await.unwrap(), 1);
        let rows = conn.execute_reader(&Statement::new("SELECT id FROM t")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(shard.executed_sql(), vec!["DELETE FROM t", "SELECT id FROM t"]);

        assert_eq!(factory.open_connections(), 1);
        drop(conn);
        assert_eq!(factory.open_connections(), 0);
        assert_eq!(shard.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let factory = InMemoryConnectionFactory::default();
        let shard = factory.add_shard("s0");
        factory.add_shard("s1");
        factory.set_unreachable("s1", true);

        assert!(matches!(
            factory.get_connection(&"s1".into()).await,
            Err(Error::ShardUnreachable { .. })
        ));
        assert!(matches!(
            factory.get_connection(&"s9".into()).await,
            Err(Error::UnknownShard(_))
        ));

        shard.fail_matching("DROP", "permission denied");
        let conn = factory.get_connection(&"s0".into()).await.unwrap();
        assert!(conn.execute_non_query(&Statement::new("DROP TABLE t")).await.is_err());
        assert!(conn.execute_non_query(&Statement::new("CREATE TABLE t (id INT)")).await.is_ok());

        shard.clear_failures();
        assert!(conn.execute_batch(&[Statement::new("DROP TABLE t")]).await.is_ok());
    }
}
