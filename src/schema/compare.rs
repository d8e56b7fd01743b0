//! Schema drift detection between shards.

use super::introspect::{ColumnSchema, SchemaIntrospector, ShardSchema};
use crate::error::{Error, Result, ShardFailure};
use crate::sharding::executor::{ShardResult, ShardTargets, ShardedQueryExecutor};
use crate::types::ShardId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A column present on both sides whose definition differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMismatch {
    pub table: String,
    pub column: String,
    /// Definition on the baseline shard.
    pub expected: ColumnSchema,
    /// Definition on the compared shard.
    pub actual: ColumnSchema,
}

/// Structural differences of a shard relative to a baseline shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDiff {
    pub shard_id: ShardId,
    pub baseline_shard_id: ShardId,
    /// Tables on the baseline but not on the shard.
    pub missing_tables: Vec<String>,
    /// Tables on the shard but not on the baseline.
    pub extra_tables: Vec<String>,
    /// (table, column) pairs on the baseline but not on the shard.
    pub missing_columns: Vec<(String, String)>,
    /// (table, column) pairs on the shard but not on the baseline.
    pub extra_columns: Vec<(String, String)>,
    /// Columns whose type or nullability differ.
    pub mismatched_columns: Vec<ColumnMismatch>,
}

impl SchemaDiff {
    /// Whether the schemas are structurally identical.
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty()
            && self.extra_tables.is_empty()
            && self.missing_columns.is_empty()
            && self.extra_columns.is_empty()
            && self.mismatched_columns.is_empty()
    }

    /// Diff `shard` against `baseline`. Pure; neither side is touched.
    ///
    /// Type names are compared case-insensitively. Default expressions are
    /// not compared.
    pub fn between(shard: &ShardSchema, baseline: &ShardSchema) -> Self {
        let mut diff = SchemaDiff {
            shard_id: shard.shard_id.clone(),
            baseline_shard_id: baseline.shard_id.clone(),
            missing_tables: Vec::new(),
            extra_tables: Vec::new(),
            missing_columns: Vec::new(),
            extra_columns: Vec::new(),
            mismatched_columns: Vec::new(),
        };

        for expected in &baseline.tables {
            let Some(actual) = shard.table(&expected.name) else {
                diff.missing_tables.push(expected.name.clone());
                continue;
            };
            for column in &expected.columns {
                match actual.column(&column.name) {
                    None => diff
                        .missing_columns
                        .push((expected.name.clone(), column.name.clone())),
                    Some(found)
                        if !found.data_type.eq_ignore_ascii_case(&column.data_type)
                            || found.is_nullable != column.is_nullable =>
                    {
                        diff.mismatched_columns.push(ColumnMismatch {
                            table: expected.name.clone(),
                            column: column.name.clone(),
                            expected: column.clone(),
                            actual: found.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            for column in &actual.columns {
                if expected.column(&column.name).is_none() {
                    diff.extra_columns
                        .push((actual.name.clone(), column.name.clone()));
                }
            }
        }
        for table in &shard.tables {
            if baseline.table(&table.name).is_none() {
                diff.extra_tables.push(table.name.clone());
            }
        }
        diff
    }
}

/// Result of comparing every shard with a baseline.
#[derive(Debug)]
pub struct SchemaDriftReport {
    pub baseline_shard_id: ShardId,
    /// Non-empty diffs, sorted by shard.
    pub drifted: Vec<SchemaDiff>,
    /// Shards compared without differences.
    pub consistent: Vec<ShardId>,
    /// Shards that could not be introspected.
    pub failures: Vec<ShardFailure>,
}

impl SchemaDriftReport {
    /// Whether every shard matched the baseline.
    pub fn is_consistent(&self) -> bool {
        self.drifted.is_empty() && self.failures.is_empty()
    }

    /// IDs of drifted shards.
    pub fn drifted_shards(&self) -> Vec<ShardId> {
        self.drifted.iter().map(|d| d.shard_id.clone()).collect()
    }
}

fn comparison_failed(shard_id: &ShardId, error: Error) -> Error {
    match error {
        Error::SchemaComparisonFailed { .. } | Error::Cancelled => error,
        other => Error::SchemaComparisonFailed {
            shard_id: shard_id.clone(),
            reason: other.to_string(),
        },
    }
}

/// Compares live shard schemas. Read-only.
#[derive(Debug, Clone)]
pub struct SchemaComparer {
    executor: ShardedQueryExecutor,
    introspector: Arc<dyn SchemaIntrospector>,
}

impl SchemaComparer {
    /// Create a comparer.
    pub fn new(executor: ShardedQueryExecutor, introspector: Arc<dyn SchemaIntrospector>) -> Self {
        Self {
            executor,
            introspector,
        }
    }

    async fn snapshot(&self, shard_id: &ShardId, cancel: &CancellationToken) -> Result<ShardSchema> {
        let introspector = Arc::clone(&self.introspector);
        self.executor
            .execute_on(
                shard_id,
                |shard, _| async move { introspector.introspect(&shard.id).await },
                cancel,
            )
            .await
            .map_err(|e| comparison_failed(shard_id, e))
    }

    /// Introspect both shards concurrently and diff them.
    pub async fn compare(
        &self,
        shard_id: &ShardId,
        baseline_shard_id: &ShardId,
        cancel: &CancellationToken,
    ) -> Result<SchemaDiff> {
        let (shard, baseline) = tokio::try_join!(
            self.snapshot(shard_id, cancel),
            self.snapshot(baseline_shard_id, cancel)
        )?;
        Ok(SchemaDiff::between(&shard, &baseline))
    }

    /// Compare every other shard with `baseline_shard_id`.
    ///
    /// Fails only if the baseline cannot be read; other shards' failures
    /// are reported.
    #[tracing::instrument(skip_all, fields(baseline = %baseline_shard_id))]
    pub async fn compare_all(
        &self,
        baseline_shard_id: &ShardId,
        cancel: &CancellationToken,
    ) -> Result<SchemaDriftReport> {
        let baseline = Arc::new(self.snapshot(baseline_shard_id, cancel).await?);
        let targets: Vec<ShardId> = self
            .executor
            .topology()
            .shard_ids()
            .into_iter()
            .filter(|id| id != baseline_shard_id)
            .collect();

        let introspector = Arc::clone(&self.introspector);
        let shared_baseline = Arc::clone(&baseline);
        let mut outcome = self
            .executor
            .execute_with_cancellation(
                ShardTargets::Shards(targets),
                move |shard, _| {
                    let introspector = Arc::clone(&introspector);
                    let baseline = Arc::clone(&shared_baseline);
                    async move {
                        let schema = introspector
                            .introspect(&shard.id)
                            .await
                            .map_err(|e| comparison_failed(&shard.id, e))?;
                        Ok::<_, Error>(SchemaDiff::between(&schema, &baseline))
                    }
                },
                cancel,
            )
            .await;
        outcome.sort_by_shard();
        if outcome.caller_cancelled {
            return Err(Error::Cancelled);
        }

        let mut report = SchemaDriftReport {
            baseline_shard_id: baseline_shard_id.clone(),
            drifted: Vec::new(),
            consistent: Vec::new(),
            failures: Vec::new(),
        };
        for result in outcome.results {
            match result {
                ShardResult::Success { value, .. } if value.is_empty() => {
                    report.consistent.push(value.shard_id)
                }
                ShardResult::Success { value, .. } => {
                    tracing::warn!(
                        shard_id = %value.shard_id,
                        missing_tables = value.missing_tables.len(),
                        extra_tables = value.extra_tables.len(),
                        mismatched_columns = value.mismatched_columns.len(),
                        "Schema drift detected"
                    );
                    report.drifted.push(value);
                }
                ShardResult::Failure { shard_id, error } => {
                    report.failures.push(ShardFailure::new(shard_id, error))
                }
            }
        }
        Ok(report)
    }
}
