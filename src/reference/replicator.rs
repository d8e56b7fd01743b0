//! Replicating reference tables from a source shard and detecting drift.

use super::dataset::{compute_hash, ReferenceDataset, ReferenceTable};
use super::store::ReferenceTableStore;
use crate::error::{Error, Result, ShardFailure};
use crate::sharding::executor::{ShardResult, ShardTargets, ShardedQueryExecutor, ShardedQueryResult};
use crate::types::ShardId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one replication pass.
#[derive(Debug)]
pub struct ReplicationReport {
    /// Shard the rows were read from.
    pub source_shard: ShardId,
    /// Digest of the replicated dataset.
    pub dataset_hash: String,
    /// Rows replicated.
    pub rows: usize,
    /// Affected row counts per target shard.
    pub outcome: ShardedQueryResult<u64>,
}

impl ReplicationReport {
    /// Whether every target shard accepted the rows.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_complete()
    }
}

/// Content hashes of a reference table across shards.
#[derive(Debug)]
pub struct DriftReport {
    /// Table compared.
    pub table: String,
    /// Shard whose content is authoritative.
    pub source_shard: ShardId,
    /// Digest on the source shard.
    pub expected_hash: String,
    /// Digest per shard that could be read, source included.
    pub shard_hashes: BTreeMap<ShardId, String>,
    /// Shards whose digest differs from the source.
    pub drifted: Vec<ShardId>,
    /// Shards that could not be read.
    pub failures: Vec<ShardFailure>,
}

impl DriftReport {
    /// Whether every readable shard matches and none failed.
    pub fn is_consistent(&self) -> bool {
        self.drifted.is_empty() && self.failures.is_empty()
    }
}

/// Copies reference tables from a source shard to every other shard.
#[derive(Debug, Clone)]
pub struct ReferenceTableReplicator {
    executor: ShardedQueryExecutor,
    store: Arc<dyn ReferenceTableStore>,
    source_shard: ShardId,
}

impl ReferenceTableReplicator {
    /// Create a replicator. `source_shard` must be in the executor's topology.
    pub fn new(
        executor: ShardedQueryExecutor,
        store: Arc<dyn ReferenceTableStore>,
        source_shard: impl Into<ShardId>,
    ) -> Result<Self> {
        let source_shard = source_shard.into();
        executor.topology().get(&source_shard)?;
        Ok(Self {
            executor,
            store,
            source_shard,
        })
    }

    /// The authoritative shard.
    pub fn source_shard(&self) -> &ShardId {
        &self.source_shard
    }

    /// Read the table from the source shard.
    pub async fn read_source(&self, table: &ReferenceTable, cancel: &CancellationToken) -> Result<ReferenceDataset> {
        let store = Arc::clone(&self.store);
        let rows = self
            .executor
            .execute_on(
                &self.source_shard,
                |shard, _| async move { store.read_all(&shard.id, table).await },
                cancel,
            )
            .await?;
        ReferenceDataset::from_rows(rows)
    }

    /// Replicate `table` from the source shard to every other shard.
    ///
    /// Failing to read the source is an error; per-target failures are
    /// reported in the returned outcome.
    ///
    /// Rows are only upserted. A row deleted on the source stays on every
    /// target, and [`detect_drift`](Self::detect_drift) keeps reporting
    /// those targets until the row is removed there by hand.
    #[tracing::instrument(skip_all, fields(table = %table.name, source = %self.source_shard))]
    pub async fn replicate(&self, table: &ReferenceTable, cancel: &CancellationToken) -> Result<ReplicationReport> {
        table.validate()?;
        let dataset = self.read_source(table, cancel).await?;
        let targets: Vec<ShardId> = self
            .executor
            .topology()
            .shard_ids()
            .into_iter()
            .filter(|id| *id != self.source_shard)
            .collect();

        let rows = dataset.len();
        let store = Arc::clone(&self.store);
        let table = Arc::new(table.clone());
        let shared_rows = Arc::new(dataset.rows);
        let outcome = self
            .executor
            .execute_with_cancellation(
                ShardTargets::Shards(targets),
                move |shard, _| {
                    let store = Arc::clone(&store);
                    let table = Arc::clone(&table);
                    let rows = Arc::clone(&shared_rows);
                    async move { store.upsert(&shard.id, &table, &rows).await }
                },
                cancel,
            )
            .await;

        if outcome.is_complete() {
            info!(rows, hash = %dataset.hash, shards = outcome.success_count(), "Reference table replicated");
        } else {
            warn!(
                rows,
                failed = outcome.failure_count(),
                skipped = outcome.skipped.len() + outcome.cancelled.len(),
                "Reference table replication incomplete"
            );
        }

        Ok(ReplicationReport {
            source_shard: self.source_shard.clone(),
            dataset_hash: dataset.hash,
            rows,
            outcome,
        })
    }

    /// Compare the table's content hash on every shard with the source.
    ///
    /// Only hashes cross the executor; rows stay on their shards.
    #[tracing::instrument(skip_all, fields(table = %table.name, source = %self.source_shard))]
    pub async fn detect_drift(&self, table: &ReferenceTable, cancel: &CancellationToken) -> Result<DriftReport> {
        let store = Arc::clone(&self.store);
        let shared_table = Arc::new(table.clone());
        let mut outcome = self
            .executor
            .execute_with_cancellation(
                ShardTargets::All,
                move |shard, _| {
                    let store = Arc::clone(&store);
                    let table = Arc::clone(&shared_table);
                    async move {
                        let rows = store.read_all(&shard.id, &table).await?;
                        compute_hash(&rows)
                    }
                },
                cancel,
            )
            .await;
        outcome.sort_by_shard();

        if outcome.caller_cancelled {
            return Err(Error::Cancelled);
        }

        let mut shard_hashes = BTreeMap::new();
        let mut failures = Vec::new();
        for result in outcome.results {
            match result {
                ShardResult::Success { shard_id, value } => {
                    shard_hashes.insert(shard_id, value);
                }
                ShardResult::Failure { shard_id, error } => {
                    failures.push(ShardFailure::new(shard_id, error));
                }
            }
        }

        let Some(expected_hash) = shard_hashes.get(&self.source_shard).cloned() else {
            return Err(failures
                .into_iter()
                .find(|f| f.shard_id == self.source_shard)
                .map(|f| f.error)
                .unwrap_or(Error::Cancelled));
        };

        let drifted: Vec<ShardId> = shard_hashes
            .iter()
            .filter(|(_, hash)| **hash != expected_hash)
            .map(|(id, _)| id.clone())
            .collect();
        for shard_id in &drifted {
            warn!(shard_id = %shard_id, "Reference table drifted from source");
        }

        Ok(DriftReport {
            table: table.name.clone(),
            source_shard: self.source_shard.clone(),
            expected_hash,
            shard_hashes,
            drifted,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScatterGatherOptions, StatementConfig};
    use crate::reference::store::{InMemoryReferenceTableStore, SqlReferenceTableStore};
    use crate::testing::{memory_topology, InMemoryConnectionFactory};
    use crate::types::{Row, Value};

    fn countries() -> ReferenceTable {
        ReferenceTable::new("countries", ["code"], ["code", "name"])
    }

    fn country(code: &str, name: &str) -> Row {
        Row::from([
            ("code".to_string(), Value::from(code)),
            ("name".to_string(), Value::from(name)),
        ])
    }

    async fn seeded() -> (Arc<InMemoryReferenceTableStore>, ReferenceTableReplicator) {
        let topology = memory_topology(&["s0", "s1", "s2"]).unwrap();
        let executor = ShardedQueryExecutor::with_defaults(topology);
        let store = Arc::new(InMemoryReferenceTableStore::new());
        store
            .upsert(
                &"s0".into(),
                &countries(),
                &[country("DE", "Germany"), country("FR", "France")],
            )
            .await
            .unwrap();
        let replicator = ReferenceTableReplicator::new(executor, store.clone(), "s0").unwrap();
        (store, replicator)
    }

    #[tokio::test]
    async fn test_replicate_then_no_drift() {
        let (store, replicator) = seeded().await;
        let cancel = CancellationToken::new();

        let before = replicator.detect_drift(&countries(), &cancel).await.unwrap();
        assert_eq!(before.drifted, vec![ShardId::from("s1"), ShardId::from("s2")]);

        let report = replicator.replicate(&countries(), &cancel).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.rows, 2);
        assert_eq!(report.outcome.success_count(), 2);
        assert_eq!(store.row_count(&"s2".into(), &countries()), 2);

        let after = replicator.detect_drift(&countries(), &cancel).await.unwrap();
        assert!(after.is_consistent());
        assert_eq!(after.expected_hash, report.dataset_hash);
        assert_eq!(after.shard_hashes.len(), 3);
    }

    #[tokio::test]
    async fn test_drift_after_local_edit() {
        let (store, replicator) = seeded().await;
        let cancel = CancellationToken::new();
        replicator.replicate(&countries(), &cancel).await.unwrap();

        store
            .upsert(&"s1".into(), &countries(), &[country("FR", "Frankreich")])
            .await
            .unwrap();
        let report = replicator.detect_drift(&countries(), &cancel).await.unwrap();
        assert_eq!(report.drifted, vec![ShardId::from("s1")]);
        assert!(!report.is_consistent());
    }

    #[tokio::test]
    async fn test_source_deletion_is_not_replicated() {
        let (store, replicator) = seeded().await;
        let cancel = CancellationToken::new();
        replicator.replicate(&countries(), &cancel).await.unwrap();

        assert!(store
            .delete(&"s0".into(), &countries(), &[Value::from("FR")])
            .unwrap());
        let report = replicator.replicate(&countries(), &cancel).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.rows, 1);
        assert_eq!(store.row_count(&"s1".into(), &countries()), 2);

        let drift = replicator.detect_drift(&countries(), &cancel).await.unwrap();
        assert_eq!(drift.drifted, vec![ShardId::from("s1"), ShardId::from("s2")]);
    }

    #[tokio::test]
    async fn test_unknown_source_shard() {
        let topology = memory_topology(&["s0"]).unwrap();
        let executor = ShardedQueryExecutor::with_defaults(topology);
        let store = Arc::new(InMemoryReferenceTableStore::new());
        assert!(matches!(
            ReferenceTableReplicator::new(executor, store, "s9"),
            Err(Error::UnknownShard(_))
        ));
    }

    #[tokio::test]
    async fn test_replication_reports_unreachable_target() {
        let topology = memory_topology(&["s0", "s1", "s2"]).unwrap();
        let factory = Arc::new(InMemoryConnectionFactory::for_topology(&topology));
        factory
            .shard(&"s0".into())
            .unwrap()
            .respond_with("FROM \"countries\"", vec![country("DE", "Germany")]);
        factory.set_unreachable("s2", true);

        let store = Arc::new(SqlReferenceTableStore::new(factory.clone(), StatementConfig::default()).unwrap());
        let executor = ShardedQueryExecutor::new(topology, ScatterGatherOptions::default()).unwrap();
        let replicator = ReferenceTableReplicator::new(executor, store, "s0").unwrap();

        let report = replicator
            .replicate(&countries(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.outcome.success_count(), 1);
        let failed: Vec<_> = report.outcome.failures().map(|(id, _)| id.clone()).collect();
        assert_eq!(failed, vec![ShardId::from("s2")]);

        let drift = replicator
            .detect_drift(&countries(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(drift.failures.len(), 1);
        assert!(!drift.is_consistent());
    }

    #[tokio::test]
    async fn test_unreadable_source_fails_replication() {
        let topology = memory_topology(&["s0", "s1"]).unwrap();
        let factory = Arc::new(InMemoryConnectionFactory::for_topology(&topology));
        factory.set_unreachable("s0", true);
        let store = Arc::new(SqlReferenceTableStore::new(factory.clone(), StatementConfig::default()).unwrap());
        let replicator =
            ReferenceTableReplicator::new(ShardedQueryExecutor::with_defaults(topology), store, "s0").unwrap();

        let result = replicator.replicate(&countries(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::ShardUnreachable { .. })));
        assert_eq!(factory.shard(&"s1".into()).unwrap().connections_opened(), 0);
    }
}
