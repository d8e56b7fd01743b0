//! Configuration types for the routing core.
//!
//! All options are in-process structs; nothing here is read from a file.

use crate::error::{Error, Result};
use crate::sharding::hashring::DEFAULT_VNODES_PER_SHARD;
use crate::sharding::router::{KeyRange, ShardKey, DEFAULT_HASH_SEED};
use crate::sharding::topology::{ShardInfo, ShardTopology};
use crate::types::{ParameterStyle, ShardId};
use std::collections::HashSet;
use std::time::Duration;

/// Main configuration for a sharded deployment.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Shards in enumeration order.
    pub shards: Vec<ShardConfig>,

    /// How keys are mapped to shards.
    pub routing: RoutingStrategy,

    /// Seed for hash-based routing.
    pub hash_seed: u64,

    /// Keys pinned to explicit shards, checked before the routing strategy.
    pub key_overrides: Vec<(ShardKey, ShardId)>,

    /// Scatter-gather behavior.
    pub scatter_gather: ScatterGatherOptions,

    /// Replica selection behavior.
    pub replica: ReplicaConfig,

    /// Statement generation for reference tables and migration history.
    pub statements: StatementConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            routing: RoutingStrategy::Hash,
            hash_seed: DEFAULT_HASH_SEED,
            key_overrides: Vec::new(),
            scatter_gather: ScatterGatherOptions::default(),
            replica: ReplicaConfig::default(),
            statements: StatementConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Create a configuration for the given shards.
    pub fn new(shards: Vec<ShardConfig>) -> Self {
        Self {
            shards,
            ..Default::default()
        }
    }

    /// Add a shard.
    pub fn with_shard(mut self, shard: ShardConfig) -> Self {
        self.shards.push(shard);
        self
    }

    /// Set the routing strategy.
    pub fn with_routing(mut self, routing: RoutingStrategy) -> Self {
        self.routing = routing;
        self
    }

    /// Set the hash seed.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Pin a key to a shard.
    pub fn with_key_override(mut self, key: impl Into<ShardKey>, shard_id: impl Into<ShardId>) -> Self {
        self.key_overrides.push((key.into(), shard_id.into()));
        self
    }

    /// Set scatter-gather options.
    pub fn with_scatter_gather(mut self, options: ScatterGatherOptions) -> Self {
        self.scatter_gather = options;
        self
    }

    /// Set replica options.
    pub fn with_replica_config(mut self, replica: ReplicaConfig) -> Self {
        self.replica = replica;
        self
    }

    /// Set statement options.
    pub fn with_statement_config(mut self, statements: StatementConfig) -> Self {
        self.statements = statements;
        self
    }

    /// Check the configuration for errors.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.id.is_empty() {
                return Err(Error::Config("shard id must not be empty".into()));
            }
            if shard.endpoint.is_empty() {
                return Err(Error::Config(format!("shard {} has no endpoint", shard.id)));
            }
            if !seen.insert(shard.id.as_str()) {
                return Err(Error::Config(format!("duplicate shard id: {}", shard.id)));
            }
        }
        for (key, shard_id) in &self.key_overrides {
            if !seen.contains(shard_id.as_str()) {
                return Err(Error::Config(format!(
                    "override for key {} targets unknown shard {}",
                    key, shard_id
                )));
            }
        }
        if let RoutingStrategy::ConsistentHash { virtual_nodes: 0 } = self.routing {
            return Err(Error::Config("virtual_nodes must be > 0".into()));
        }
        self.scatter_gather.validate()?;
        self.replica.validate()?;
        self.statements.validate()?;
        Ok(())
    }

    /// Validate and build the shard topology.
    pub fn build_topology(&self) -> Result<ShardTopology> {
        self.validate()?;
        if self.shards.is_empty() {
            tracing::warn!("Building an empty shard topology; every key will fail to resolve");
        }
        ShardTopology::new(self.shards.iter().map(ShardConfig::to_shard_info).collect())
    }
}

/// Configuration for a single shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Unique shard identifier.
    pub id: ShardId,

    /// Primary endpoint connection descriptor.
    pub endpoint: String,

    /// Read replica endpoints.
    pub replicas: Vec<String>,
}

impl ShardConfig {
    /// Create a shard config.
    pub fn new(id: impl Into<ShardId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            replicas: Vec::new(),
        }
    }

    /// Add a read replica.
    pub fn with_replica(mut self, endpoint: impl Into<String>) -> Self {
        self.replicas.push(endpoint.into());
        self
    }

    fn to_shard_info(&self) -> ShardInfo {
        ShardInfo::new(self.id.clone(), self.endpoint.clone()).with_replicas(self.replicas.iter().cloned())
    }
}

/// How keys are mapped to shards.
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    /// Stable hash of the key modulo the shard count.
    Hash,
    /// Hash ring with virtual nodes.
    ConsistentHash { virtual_nodes: usize },
    /// Ordered key ranges.
    Range { ranges: Vec<KeyRange> },
    /// Explicit lookup table with an optional fallback shard.
    Directory {
        entries: Vec<(ShardKey, ShardId)>,
        default_shard: Option<ShardId>,
    },
}

impl RoutingStrategy {
    /// Consistent hashing with the default virtual node count.
    pub fn consistent_hash() -> Self {
        RoutingStrategy::ConsistentHash {
            virtual_nodes: DEFAULT_VNODES_PER_SHARD,
        }
    }
}

/// What a scatter-gather call does when a shard fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureTolerance {
    /// Stop dispatching and cancel in-flight shards on the first failure.
    FailFast,
    /// Let every shard finish and report all outcomes.
    #[default]
    BestEffort,
}

/// Options for a scatter-gather call.
#[derive(Debug, Clone)]
pub struct ScatterGatherOptions {
    /// Maximum number of shards invoked at once. Must be > 0.
    pub max_concurrency: usize,

    /// Timeout applied to each shard invocation separately.
    pub per_shard_timeout: Duration,

    /// Failure policy.
    pub failure_tolerance: FailureTolerance,
}

impl Default for ScatterGatherOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            per_shard_timeout: Duration::from_secs(30),
            failure_tolerance: FailureTolerance::BestEffort,
        }
    }
}

impl ScatterGatherOptions {
    /// Set the concurrency limit.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the per-shard timeout.
    pub fn with_per_shard_timeout(mut self, timeout: Duration) -> Self {
        self.per_shard_timeout = timeout;
        self
    }

    /// Set the failure policy.
    pub fn with_failure_tolerance(mut self, tolerance: FailureTolerance) -> Self {
        self.failure_tolerance = tolerance;
        self
    }

    /// Check the options for errors.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be > 0".into()));
        }
        if self.per_shard_timeout.is_zero() {
            return Err(Error::Config("per_shard_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Replica selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaSelectionStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

/// Replica selection and health configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Strategy used to pick a replica for reads.
    pub strategy: ReplicaSelectionStrategy,

    /// How long an endpoint stays excluded after a failure.
    pub recovery_delay: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            strategy: ReplicaSelectionStrategy::RoundRobin,
            recovery_delay: Duration::from_secs(30),
        }
    }
}

impl ReplicaConfig {
    /// Set the selection strategy.
    pub fn with_strategy(mut self, strategy: ReplicaSelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the recovery delay.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    /// Check the options for errors.
    pub fn validate(&self) -> Result<()> {
        if self.recovery_delay.is_zero() {
            return Err(Error::Config("recovery_delay must be > 0".into()));
        }
        Ok(())
    }
}

/// Statement generation options used by the SQL-backed stores.
#[derive(Debug, Clone)]
pub struct StatementConfig {
    /// Placeholder style of the target provider.
    pub parameter_style: ParameterStyle,

    /// Maximum bound parameters in one statement; larger batches are chunked.
    pub max_parameters_per_statement: usize,
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            parameter_style: ParameterStyle::Numbered,
            max_parameters_per_statement: 2000,
        }
    }
}

impl StatementConfig {
    /// Set the placeholder style.
    pub fn with_parameter_style(mut self, style: ParameterStyle) -> Self {
        self.parameter_style = style;
        self
    }

    /// Set the parameter limit.
    pub fn with_max_parameters(mut self, max: usize) -> Self {
        self.max_parameters_per_statement = max;
        self
    }

    /// Check the options for errors.
    pub fn validate(&self) -> Result<()> {
        if self.max_parameters_per_statement == 0 {
            return Err(Error::Config("max_parameters_per_statement must be > 0".into()));
        }
        Ok(())
    }
}
