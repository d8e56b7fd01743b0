//! Scatter-gather execution across shards.
//!
//! The executor runs one operation per target shard as independent tokio
//! tasks, never more than `max_concurrency` at once. Each invocation has its
//! own timeout; a slow shard only fails itself. Per-shard outcomes are
//! collected into a [`ShardedQueryResult`] instead of being raised, so callers
//! can decide whether partial success is acceptable.
//!
//! # Failure tolerance
//!
//! - `BestEffort`: every target runs to completion and reports an outcome.
//! - `FailFast`: the first failure stops dispatch and cancels in-flight
//!   invocations; completed outcomes are still returned.
//!
//! Caller cancellation (via the token passed in) reaches every in-flight
//! invocation and stops dispatch. Results gathered before the cancellation
//! are kept.

use super::router::{ShardKey, ShardRouter};
use super::topology::{ShardInfo, ShardTopology};
use crate::config::{FailureTolerance, ScatterGatherOptions};
use crate::error::{Error, Result, ShardFailure};
use crate::types::ShardId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which shards a scatter-gather call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardTargets {
    /// Every shard in the topology.
    All,
    /// A subset of shards. Duplicates are ignored.
    Shards(Vec<ShardId>),
}

impl ShardTargets {
    /// Target the shards owning the given keys.
    pub fn for_keys(router: &dyn ShardRouter, keys: &[ShardKey]) -> Result<Self> {
        let groups = router.group_by_shard(keys)?;
        Ok(ShardTargets::Shards(groups.into_keys().collect()))
    }
}

impl From<Vec<ShardId>> for ShardTargets {
    fn from(ids: Vec<ShardId>) -> Self {
        ShardTargets::Shards(ids)
    }
}

/// Outcome of one shard invocation.
#[derive(Debug)]
pub enum ShardResult<T> {
    Success { shard_id: ShardId, value: T },
    Failure { shard_id: ShardId, error: Error },
}

impl<T> ShardResult<T> {
    /// The shard this outcome belongs to.
    pub fn shard_id(&self) -> &ShardId {
        match self {
            ShardResult::Success { shard_id, .. } | ShardResult::Failure { shard_id, .. } => shard_id,
        }
    }

    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, ShardResult::Success { .. })
    }

    /// The value, if the invocation succeeded.
    pub fn value(&self) -> Option<&T> {
        match self {
            ShardResult::Success { value, .. } => Some(value),
            ShardResult::Failure { .. } => None,
        }
    }

    /// The error, if the invocation failed.
    pub fn error(&self) -> Option<&Error> {
        match self {
            ShardResult::Success { .. } => None,
            ShardResult::Failure { error, .. } => Some(error),
        }
    }

    /// Convert into a plain result.
    pub fn into_result(self) -> Result<T> {
        match self {
            ShardResult::Success { value, .. } => Ok(value),
            ShardResult::Failure { error, .. } => Err(error),
        }
    }
}

/// Aggregated outcome of a scatter-gather call.
///
/// `results` holds one entry per shard invocation that ran to an outcome, in
/// completion order. Sort with [`ShardedQueryResult::sort_by_shard`] when
/// determinism matters.
#[derive(Debug)]
pub struct ShardedQueryResult<T> {
    /// Completed outcomes.
    pub results: Vec<ShardResult<T>>,

    /// Shards whose in-flight invocation was cancelled (fail-fast or caller
    /// cancellation).
    pub cancelled: Vec<ShardId>,

    /// Shards that were never started.
    pub skipped: Vec<ShardId>,

    /// Whether the caller's cancellation token fired during the call.
    pub caller_cancelled: bool,
}

impl<T> Default for ShardedQueryResult<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            cancelled: Vec::new(),
            skipped: Vec::new(),
            caller_cancelled: false,
        }
    }
}

impl<T> ShardedQueryResult<T> {
    /// Successful outcomes.
    pub fn successes(&self) -> impl Iterator<Item = (&ShardId, &T)> {
        self.results.iter().filter_map(|r| match r {
            ShardResult::Success { shard_id, value } => Some((shard_id, value)),
            ShardResult::Failure { .. } => None,
        })
    }

    /// Failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = (&ShardId, &Error)> {
        self.results.iter().filter_map(|r| match r {
            ShardResult::Success { .. } => None,
            ShardResult::Failure { shard_id, error } => Some((shard_id, error)),
        })
    }

    /// Number of successful shards.
    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    /// Number of failed shards.
    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// Every targeted shard ran and succeeded.
    pub fn is_complete(&self) -> bool {
        self.failure_count() == 0 && self.cancelled.is_empty() && self.skipped.is_empty()
    }

    /// Some shards succeeded and some failed.
    pub fn has_partial_failure(&self) -> bool {
        self.success_count() > 0 && self.failure_count() > 0
    }

    /// Sort outcomes by shard ID.
    pub fn sort_by_shard(&mut self) {
        self.results.sort_by(|a, b| a.shard_id().cmp(b.shard_id()));
        self.cancelled.sort();
        self.skipped.sort();
    }

    /// Values of the successful shards, discarding failures.
    pub fn into_values(self) -> Vec<T> {
        self.results
            .into_iter()
            .filter_map(|r| match r {
                ShardResult::Success { value, .. } => Some(value),
                ShardResult::Failure { .. } => None,
            })
            .collect()
    }

    /// All values if every shard succeeded, otherwise `PartialFailure` (or
    /// `Cancelled` if the caller cancelled and nothing failed).
    pub fn into_result(self) -> Result<Vec<(ShardId, T)>> {
        let mut values = Vec::with_capacity(self.results.len());
        let mut failures = Vec::new();
        for result in self.results {
            match result {
                ShardResult::Success { shard_id, value } => values.push((shard_id, value)),
                ShardResult::Failure { shard_id, error } => {
                    failures.push(ShardFailure::new(shard_id, error))
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::PartialFailure {
                succeeded: values.len(),
                failures,
            });
        }
        if self.caller_cancelled || !self.cancelled.is_empty() || !self.skipped.is_empty() {
            return Err(Error::Cancelled);
        }
        Ok(values)
    }
}

/// Runs operations against one, several or all shards.
///
/// Stateless per call; clone freely.
#[derive(Debug, Clone)]
pub struct ShardedQueryExecutor {
    topology: Arc<ShardTopology>,
    options: ScatterGatherOptions,
}

impl ShardedQueryExecutor {
    /// Create an executor.
    pub fn new(topology: Arc<ShardTopology>, options: ScatterGatherOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { topology, options })
    }

    /// Default options.
    pub fn with_defaults(topology: Arc<ShardTopology>) -> Self {
        Self {
            topology,
            options: ScatterGatherOptions::default(),
        }
    }

    /// The topology.
    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    /// The default options.
    pub fn options(&self) -> &ScatterGatherOptions {
        &self.options
    }

    /// Scatter-gather with the executor's options and no external cancellation.
    pub async fn execute<T, F, Fut>(&self, targets: ShardTargets, operation: F) -> ShardedQueryResult<T>
    where
        T: Send + 'static,
        F: Fn(ShardInfo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute_with(targets, operation, &self.options, &CancellationToken::new())
            .await
    }

    /// Scatter-gather with the executor's options, observing `cancel`.
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        targets: ShardTargets,
        operation: F,
        cancel: &CancellationToken,
    ) -> ShardedQueryResult<T>
    where
        T: Send + 'static,
        F: Fn(ShardInfo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute_with(targets, operation, &self.options, cancel).await
    }

    /// Scatter-gather with explicit options.
    ///
    /// `operation` receives the shard and a token that fires when the
    /// invocation should stop (fail-fast or caller cancellation).
    #[tracing::instrument(skip_all, fields(targets = ?targets, tolerance = ?options.failure_tolerance))]
    pub async fn execute_with<T, F, Fut>(
        &self,
        targets: ShardTargets,
        operation: F,
        options: &ScatterGatherOptions,
        cancel: &CancellationToken,
    ) -> ShardedQueryResult<T>
    where
        T: Send + 'static,
        F: Fn(ShardInfo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fail_fast = options.failure_tolerance == FailureTolerance::FailFast;
        let max_concurrency = options.max_concurrency.max(1);
        let timeout = options.per_shard_timeout;

        let mut outcome = ShardedQueryResult::default();
        let mut pending = self.resolve_targets(targets, &mut outcome);
        let mut halted = fail_fast && outcome.failure_count() > 0;

        if cancel.is_cancelled() {
            outcome.caller_cancelled = true;
            halted = true;
        }

        let operation = Arc::new(operation);
        let shard_token = cancel.child_token();
        let mut in_flight: HashMap<tokio::task::Id, ShardId> = HashMap::new();
        let mut tasks = JoinSet::new();

        loop {
            while !halted && tasks.len() < max_concurrency {
                let Some(shard) = pending.pop_front() else {
                    break;
                };
                let shard_id = shard.id.clone();
                debug!(shard_id = %shard_id, "Dispatching shard invocation");
                let handle = tasks.spawn(invoke_shard(
                    shard,
                    Arc::clone(&operation),
                    shard_token.clone(),
                    timeout,
                ));
                in_flight.insert(handle.id(), shard_id);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !outcome.caller_cancelled => {
                    debug!(in_flight = tasks.len(), "Scatter-gather cancelled by caller");
                    outcome.caller_cancelled = true;
                    halted = true;
                    shard_token.cancel();
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let (task_id, result) = match joined {
                        Ok((task_id, result)) => (task_id, result),
                        Err(e) => {
                            let message = if e.is_panic() {
                                "shard invocation panicked".to_string()
                            } else {
                                format!("shard invocation aborted: {}", e)
                            };
                            (e.id(), Err(Error::Internal(message)))
                        }
                    };
                    let Some(shard_id) = in_flight.remove(&task_id) else {
                        warn!(?task_id, "Completed task has no shard attribution");
                        continue;
                    };

                    match result {
                        Ok(value) => {
                            debug!(shard_id = %shard_id, "Shard invocation succeeded");
                            outcome.results.push(ShardResult::Success { shard_id, value });
                        }
                        Err(Error::Cancelled) => {
                            debug!(shard_id = %shard_id, "Shard invocation cancelled");
                            outcome.cancelled.push(shard_id);
                        }
                        Err(error) => {
                            warn!(shard_id = %shard_id, error = %error, "Shard invocation failed");
                            outcome.results.push(ShardResult::Failure { shard_id, error });
                            if fail_fast && !halted {
                                halted = true;
                                shard_token.cancel();
                            }
                        }
                    }
                }
            }
        }

        outcome.skipped.extend(pending.into_iter().map(|s| s.id));

        debug!(
            succeeded = outcome.success_count(),
            failed = outcome.failure_count(),
            cancelled = outcome.cancelled.len(),
            skipped = outcome.skipped.len(),
            "Scatter-gather finished"
        );
        outcome
    }

    /// Run an operation against a single shard with the per-shard timeout.
    pub async fn execute_on<T, F, Fut>(
        &self,
        shard_id: &ShardId,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnOnce(ShardInfo, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let shard = self.topology.get(shard_id)?.clone();
        let token = cancel.child_token();
        let timeout = self.options.per_shard_timeout;
        let shard_id = shard.id.clone();

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, operation(shard, token.clone())) => {
                result.unwrap_or(Err(Error::ShardTimeout { shard_id, timeout }))
            }
        }
    }

    /// Expand targets into shards. Unknown IDs are recorded as failures.
    fn resolve_targets<T>(
        &self,
        targets: ShardTargets,
        outcome: &mut ShardedQueryResult<T>,
    ) -> VecDeque<ShardInfo> {
        match targets {
            ShardTargets::All => self.topology.shards().iter().cloned().collect(),
            ShardTargets::Shards(ids) => {
                let mut seen = HashSet::new();
                let mut shards = VecDeque::with_capacity(ids.len());
                for id in ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    match self.topology.get(&id) {
                        Ok(shard) => shards.push_back(shard.clone()),
                        Err(error) => outcome.results.push(ShardResult::Failure { shard_id: id, error }),
                    }
                }
                shards
            }
        }
    }
}

async fn invoke_shard<T, F, Fut>(
    shard: ShardInfo,
    operation: Arc<F>,
    token: CancellationToken,
    timeout: Duration,
) -> Result<T>
where
    F: Fn(ShardInfo, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let shard_id = shard.id.clone();
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, operation(shard, token.clone())) => {
            result.unwrap_or(Err(Error::ShardTimeout { shard_id, timeout }))
        }
    }
}
