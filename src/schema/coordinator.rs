//! Applying and rolling back migrations across every shard.
//!
//! Each shard is handled independently: a shard where the migration is
//! already active is skipped, a shard whose ledger records a different
//! checksum for the same id fails without running anything, and every
//! applied script is recorded with its duration.

use super::history::{Migration, MigrationHistoryStore};
use crate::config::FailureTolerance;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::sharding::executor::{ShardResult, ShardTargets, ShardedQueryExecutor, ShardedQueryResult};
use crate::sharding::topology::ShardInfo;
use crate::types::{ShardId, Statement};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How shards are visited.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MigrationStrategy {
    /// One shard at a time in topology order, stopping at the first failure.
    Sequential,
    /// All shards concurrently under the executor's options.
    #[default]
    Parallel,
    /// `canary_shard` first; the rest in parallel only if it succeeds.
    Canary { canary_shard: ShardId },
}

/// What happened on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied { duration: Duration },
    AlreadyApplied,
    RolledBack { duration: Duration },
    NotApplied,
}

/// Per-shard outcomes of one migration run.
#[derive(Debug)]
pub struct MigrationReport {
    pub migration_id: String,
    pub outcome: ShardedQueryResult<MigrationOutcome>,
}

impl MigrationReport {
    /// Whether every shard ended in a successful state.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_complete()
    }

    /// Shards where the script actually ran.
    pub fn changed_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .outcome
            .successes()
            .filter(|(_, outcome)| {
                matches!(
                    outcome,
                    MigrationOutcome::Applied { .. } | MigrationOutcome::RolledBack { .. }
                )
            })
            .map(|(id, _)| id.clone())
            .collect();
        shards.sort();
        shards
    }

    /// Fail with `PartialFailure` (or `Cancelled`) unless every shard succeeded.
    pub fn into_result(self) -> Result<Vec<(ShardId, MigrationOutcome)>> {
        self.outcome.into_result()
    }
}

type ShardFuture = Pin<Box<dyn Future<Output = Result<MigrationOutcome>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Keep typed shard-level errors; wrap everything else.
fn attribute(direction: Direction, shard_id: &ShardId, migration_id: &str, error: Error) -> Error {
    match error {
        Error::Cancelled
        | Error::UnknownShard(_)
        | Error::ShardUnreachable { .. }
        | Error::ShardTimeout { .. }
        | Error::MigrationFailed { .. }
        | Error::RollbackFailed { .. } => error,
        other => {
            let shard_id = shard_id.clone();
            let migration_id = migration_id.to_string();
            let reason = other.to_string();
            match direction {
                Direction::Up => Error::MigrationFailed {
                    shard_id,
                    migration_id,
                    reason,
                },
                Direction::Down => Error::RollbackFailed {
                    shard_id,
                    migration_id,
                    reason,
                },
            }
        }
    }
}

async fn apply_on_shard(
    factory: &dyn ConnectionFactory,
    history: &dyn MigrationHistoryStore,
    shard_id: &ShardId,
    migration: &Migration,
) -> Result<MigrationOutcome> {
    let fail = |e| attribute(Direction::Up, shard_id, &migration.id, e);

    history.ensure_history_table(shard_id).await.map_err(fail)?;
    if let Some(record) = history.active_record(shard_id, &migration.id).await.map_err(fail)? {
        if record.checksum != migration.checksum {
            return Err(fail(Error::ChecksumMismatch {
                migration_id: migration.id.clone(),
                recorded: record.checksum,
                expected: migration.checksum.clone(),
            }));
        }
        debug!(shard_id = %shard_id, migration_id = %migration.id, "Migration already applied");
        return Ok(MigrationOutcome::AlreadyApplied);
    }

    let connection = factory.get_connection(shard_id).await.map_err(fail)?;
    let started = Instant::now();
    connection
        .execute_non_query(&Statement::new(migration.up_sql.as_str()))
        .await
        .map_err(fail)?;
    let duration = started.elapsed();
    history
        .record_applied(shard_id, migration, duration)
        .await
        .map_err(fail)?;

    info!(
        shard_id = %shard_id,
        migration_id = %migration.id,
        duration_ms = duration.as_millis() as u64,
        "Migration applied"
    );
    Ok(MigrationOutcome::Applied { duration })
}

async fn rollback_on_shard(
    factory: &dyn ConnectionFactory,
    history: &dyn MigrationHistoryStore,
    shard_id: &ShardId,
    migration: &Migration,
) -> Result<MigrationOutcome> {
    let fail = |e| attribute(Direction::Down, shard_id, &migration.id, e);

    history.ensure_history_table(shard_id).await.map_err(fail)?;
    if history
        .active_record(shard_id, &migration.id)
        .await
        .map_err(fail)?
        .is_none()
    {
        debug!(shard_id = %shard_id, migration_id = %migration.id, "Migration not applied, nothing to roll back");
        return Ok(MigrationOutcome::NotApplied);
    }
    if migration.down_sql.trim().is_empty() {
        return Err(fail(Error::Statement("migration has no down script".into())));
    }

    let connection = factory.get_connection(shard_id).await.map_err(fail)?;
    let started = Instant::now();
    connection
        .execute_non_query(&Statement::new(migration.down_sql.as_str()))
        .await
        .map_err(fail)?;
    history
        .record_rolled_back(shard_id, &migration.id)
        .await
        .map_err(fail)?;
    let duration = started.elapsed();

    info!(
        shard_id = %shard_id,
        migration_id = %migration.id,
        duration_ms = duration.as_millis() as u64,
        "Migration rolled back"
    );
    Ok(MigrationOutcome::RolledBack { duration })
}

/// Runs migrations on every shard of a topology.
#[derive(Debug, Clone)]
pub struct ShardedMigrationCoordinator {
    executor: ShardedQueryExecutor,
    factory: Arc<dyn ConnectionFactory>,
    history: Arc<dyn MigrationHistoryStore>,
}

impl ShardedMigrationCoordinator {
    /// Create a coordinator.
    pub fn new(
        executor: ShardedQueryExecutor,
        factory: Arc<dyn ConnectionFactory>,
        history: Arc<dyn MigrationHistoryStore>,
    ) -> Self {
        Self {
            executor,
            factory,
            history,
        }
    }

    /// Apply `migration` to every shard.
    #[tracing::instrument(skip_all, fields(migration_id = %migration.id, strategy = ?strategy))]
    pub async fn apply(
        &self,
        migration: &Migration,
        strategy: &MigrationStrategy,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        self.run(Direction::Up, migration, strategy, cancel).await
    }

    /// Roll `migration` back on every shard where it is active.
    #[tracing::instrument(skip_all, fields(migration_id = %migration.id, strategy = ?strategy))]
    pub async fn rollback(
        &self,
        migration: &Migration,
        strategy: &MigrationStrategy,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        self.run(Direction::Down, migration, strategy, cancel).await
    }

    /// Apply migrations in id order, stopping after the first incomplete run.
    pub async fn apply_all(
        &self,
        migrations: &[Migration],
        strategy: &MigrationStrategy,
        cancel: &CancellationToken,
    ) -> Result<Vec<MigrationReport>> {
        let mut ordered: Vec<&Migration> = migrations.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut reports = Vec::with_capacity(ordered.len());
        for migration in ordered {
            let report = self.apply(migration, strategy, cancel).await?;
            let complete = report.is_complete();
            reports.push(report);
            if !complete {
                warn!(migration_id = %migration.id, "Stopping: migration incomplete");
                break;
            }
        }
        Ok(reports)
    }

    /// Active migration ids per shard.
    pub async fn applied(&self, cancel: &CancellationToken) -> ShardedQueryResult<Vec<String>> {
        let history = Arc::clone(&self.history);
        self.executor
            .execute_with_cancellation(
                ShardTargets::All,
                move |shard, _| {
                    let history = Arc::clone(&history);
                    async move { history.get_applied(&shard.id).await }
                },
                cancel,
            )
            .await
    }

    async fn run(
        &self,
        direction: Direction,
        migration: &Migration,
        strategy: &MigrationStrategy,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        let migration = Arc::new(migration.clone());
        let outcome = match strategy {
            MigrationStrategy::Sequential => {
                let options = self
                    .executor
                    .options()
                    .clone()
                    .with_max_concurrency(1)
                    .with_failure_tolerance(FailureTolerance::FailFast);
                self.executor
                    .execute_with(
                        ShardTargets::All,
                        self.shard_operation(direction, &migration),
                        &options,
                        cancel,
                    )
                    .await
            }
            MigrationStrategy::Parallel => {
                self.executor
                    .execute_with_cancellation(
                        ShardTargets::All,
                        self.shard_operation(direction, &migration),
                        cancel,
                    )
                    .await
            }
            MigrationStrategy::Canary { canary_shard } => {
                self.run_canary(direction, &migration, canary_shard, cancel)
                    .await?
            }
        };

        if !outcome.is_complete() {
            warn!(
                failed = outcome.failure_count(),
                skipped = outcome.skipped.len(),
                cancelled = outcome.cancelled.len(),
                "Migration run incomplete"
            );
        }
        Ok(MigrationReport {
            migration_id: migration.id.clone(),
            outcome,
        })
    }

    async fn run_canary(
        &self,
        direction: Direction,
        migration: &Arc<Migration>,
        canary_shard: &ShardId,
        cancel: &CancellationToken,
    ) -> Result<ShardedQueryResult<MigrationOutcome>> {
        let topology = self.executor.topology();
        topology.get(canary_shard)?;
        let rest: Vec<ShardId> = topology
            .shard_ids()
            .into_iter()
            .filter(|id| id != canary_shard)
            .collect();

        let operation = self.shard_operation(direction, migration);
        let canary = self
            .executor
            .execute_on(canary_shard, |shard, token| operation(shard, token), cancel)
            .await;

        match canary {
            Ok(value) => {
                info!(shard_id = %canary_shard, "Canary succeeded, continuing");
                let mut outcome = self
                    .executor
                    .execute_with_cancellation(ShardTargets::Shards(rest), operation, cancel)
                    .await;
                outcome.results.insert(
                    0,
                    ShardResult::Success {
                        shard_id: canary_shard.clone(),
                        value,
                    },
                );
                Ok(outcome)
            }
            Err(error) => {
                warn!(shard_id = %canary_shard, error = %error, "Canary failed, remaining shards skipped");
                let mut outcome = ShardedQueryResult::default();
                if error.is_cancelled() {
                    outcome.caller_cancelled = true;
                    outcome.cancelled.push(canary_shard.clone());
                } else {
                    outcome.results.push(ShardResult::Failure {
                        shard_id: canary_shard.clone(),
                        error,
                    });
                }
                outcome.skipped = rest;
                Ok(outcome)
            }
        }
    }

    fn shard_operation(
        &self,
        direction: Direction,
        migration: &Arc<Migration>,
    ) -> impl Fn(ShardInfo, CancellationToken) -> ShardFuture + Send + Sync + 'static {
        let factory = Arc::clone(&self.factory);
        let history = Arc::clone(&self.history);
        let migration = Arc::clone(migration);
        move |shard: ShardInfo, _: CancellationToken| -> ShardFuture {
            let factory = Arc::clone(&factory);
            let history = Arc::clone(&history);
            let migration = Arc::clone(&migration);
            Box::pin(async move {
                match direction {
                    Direction::Up => {
                        apply_on_shard(factory.as_ref(), history.as_ref(), &shard.id, &migration).await
                    }
                    Direction::Down => {
                        rollback_on_shard(factory.as_ref(), history.as_ref(), &shard.id, &migration).await
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::history::InMemoryMigrationHistoryStore;
    use crate::testing::{memory_topology, InMemoryConnectionFactory};

    struct Fixture {
        factory: Arc<InMemoryConnectionFactory>,
        history: Arc<InMemoryMigrationHistoryStore>,
        coordinator: ShardedMigrationCoordinator,
    }

    fn fixture() -> Fixture {
        let topology = memory_topology(&["s0", "s1", "s2"]).unwrap();
        let factory = Arc::new(InMemoryConnectionFactory::for_topology(&topology));
        let history = Arc::new(InMemoryMigrationHistoryStore::new());
        let coordinator = ShardedMigrationCoordinator::new(
            ShardedQueryExecutor::with_defaults(topology),
            factory.clone(),
            history.clone(),
        );
        Fixture {
            factory,
            history,
            coordinator,
        }
    }

    fn create_users() -> Migration {
        Migration::new(
            "001_create_users",
            "create users",
            "CREATE TABLE users (id BIGINT)",
            "DROP TABLE users",
        )
    }

    fn sql_on(fixture: &Fixture, shard: &str) -> Vec<String> {
        fixture.factory.shard(&shard.into()).unwrap().executed_sql()
    }

    #[tokio::test]
    async fn test_parallel_apply_then_skip() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let migration = create_users();

        let report = f
            .coordinator
            .apply(&migration, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.changed_shards().len(), 3);
        for shard in ["s0", "s1", "s2"] {
            assert_eq!(sql_on(&f, shard), vec!["CREATE TABLE users (id BIGINT)"]);
            assert_eq!(
                f.history.get_applied(&shard.into()).await.unwrap(),
                vec![migration.id.clone()]
            );
        }

        let again = f
            .coordinator
            .apply(&migration, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();
        assert!(again.changed_shards().is_empty());
        assert!(again
            .outcome
            .successes()
            .all(|(_, o)| *o == MigrationOutcome::AlreadyApplied));
        assert_eq!(sql_on(&f, "s0").len(), 1);
        assert_eq!(f.factory.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_shard() {
        let f = fixture();
        let edited = Migration::new("001_create_users", "", "CREATE TABLE users (id INT)", "");
        f.history
            .record_applied(&"s1".into(), &edited, Duration::ZERO)
            .await
            .unwrap();

        let report = f
            .coordinator
            .apply(&create_users(), &MigrationStrategy::Parallel, &CancellationToken::new())
            .await
            .unwrap();
        let failures: Vec<_> = report.outcome.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, &ShardId::from("s1"));
        assert!(matches!(failures[0].1, Error::MigrationFailed { reason, .. } if reason.contains("checksum mismatch")));
        assert!(sql_on(&f, "s1").is_empty());
        assert!(matches!(report.into_result(), Err(Error::PartialFailure { .. })));
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_failure() {
        let f = fixture();
        f.factory
            .shard(&"s1".into())
            .unwrap()
            .fail_statements("syntax error");

        let report = f
            .coordinator
            .apply(&create_users(), &MigrationStrategy::Sequential, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.changed_shards(), vec![ShardId::from("s0")]);
        assert_eq!(report.outcome.failure_count(), 1);
        assert_eq!(report.outcome.skipped, vec![ShardId::from("s2")]);
        assert!(sql_on(&f, "s2").is_empty());
        assert!(f.history.get_applied(&"s1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_canary_skips_the_rest() {
        let f = fixture();
        f.factory.set_unreachable("s2", true);

        let strategy = MigrationStrategy::Canary {
            canary_shard: "s2".into(),
        };
        let report = f
            .coordinator
            .apply(&create_users(), &strategy, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome.failure_count(), 1);
        assert_eq!(report.outcome.skipped, vec![ShardId::from("s0"), ShardId::from("s1")]);
        assert!(sql_on(&f, "s0").is_empty());
        assert!(matches!(
            report.outcome.results[0].error(),
            Some(Error::ShardUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_successful_canary_continues() {
        let f = fixture();
        let strategy = MigrationStrategy::Canary {
            canary_shard: "s1".into(),
        };
        let report = f
            .coordinator
            .apply(&create_users(), &strategy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.outcome.results[0].shard_id(), &ShardId::from("s1"));
        assert_eq!(report.changed_shards().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_canary() {
        let f = fixture();
        let strategy = MigrationStrategy::Canary {
            canary_shard: "s9".into(),
        };
        let result = f
            .coordinator
            .apply(&create_users(), &strategy, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::UnknownShard(_))));
    }

    #[tokio::test]
    async fn test_rollback() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let migration = create_users();
        f.coordinator
            .apply(&migration, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();

        let report = f
            .coordinator
            .rollback(&migration, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();
        assert_eq!(report.changed_shards().len(), 3);
        assert_eq!(sql_on(&f, "s0").last().unwrap(), "DROP TABLE users");

        let applied = f.coordinator.applied(&cancel).await;
        assert!(applied.successes().all(|(_, ids)| ids.is_empty()));
        assert_eq!(f.history.history(&"s0".into()).await.unwrap().len(), 1);

        let again = f
            .coordinator
            .rollback(&migration, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();
        assert!(again
            .outcome
            .successes()
            .all(|(_, o)| *o == MigrationOutcome::NotApplied));
    }

    #[tokio::test]
    async fn test_rollback_failures() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let no_down = Migration::new("002_add_index", "", "CREATE INDEX i ON users (id)", "");
        f.coordinator
            .apply(&no_down, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();

        let report = f
            .coordinator
            .rollback(&no_down, &MigrationStrategy::Parallel, &cancel)
            .await
            .unwrap();
        assert_eq!(report.outcome.failure_count(), 3);
        assert!(report
            .outcome
            .failures()
            .all(|(_, e)| matches!(e, Error::RollbackFailed { .. })));
        assert_eq!(
            f.history.get_applied(&"s0".into()).await.unwrap(),
            vec!["002_add_index".to_string()]
        );
    }

    #[tokio::test]
    async fn test_apply_all_in_order() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let second = Migration::new("002_add_email", "", "ALTER TABLE users ADD email TEXT", "");
        f.factory
            .shard(&"s2".into())
            .unwrap()
            .fail_matching("ALTER TABLE", "column exists");
        let third = Migration::new("003_add_name", "", "ALTER TABLE users ADD name TEXT", "");

        let reports = f
            .coordinator
            .apply_all(
                &[third, create_users(), second],
                &MigrationStrategy::Parallel,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].migration_id, "001_create_users");
        assert!(reports[0].is_complete());
        assert!(!reports[1].is_complete());
        assert_eq!(
            f.history.get_applied(&"s0".into()).await.unwrap(),
            vec!["001_create_users".to_string(), "002_add_email".to_string()]
        );
    }
}
