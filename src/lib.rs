//! Data-access routing core for horizontally sharded relational databases.
//!
//! This crate sits between an application and a set of shards and provides:
//! - **Key routing** via hash, consistent-hash ring, range or directory strategies
//! - **Scatter-gather** execution with bounded fan-out and per-shard timeouts
//! - **Read/write splitting** over primaries and health-tracked replicas
//! - **Reference tables** replicated from a source shard to every shard
//! - **Schema management** with a per-shard migration ledger and drift checks
//!
//! Connections are abstracted behind [`ConnectionFactory`]; the crate never
//! speaks a wire protocol itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardwise::{build_router, ShardConfig, ShardKey, ShardTargets, ShardedQueryExecutor, ShardingConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ShardingConfig::new(vec![
//!         ShardConfig::new("s0", "postgres://db0").with_replica("postgres://db0-r0"),
//!         ShardConfig::new("s1", "postgres://db1"),
//!     ]);
//!
//!     let topology = Arc::new(config.build_topology()?);
//!     let router = build_router(
//!         &config.routing,
//!         Arc::clone(&topology),
//!         config.hash_seed,
//!         &config.key_overrides,
//!     )?;
//!
//!     // Single-shard routing
//!     let owner = router.resolve(&ShardKey::from("tenant-42"))?;
//!     println!("tenant-42 lives on {}", owner.id);
//!
//!     // Fan out to every shard
//!     let executor = ShardedQueryExecutor::new(topology, config.scatter_gather.clone())?;
//!     let outcome = executor
//!         .execute(ShardTargets::All, |shard, _cancel| async move { Ok(shard.id) })
//!         .await;
//!     println!("{} shards answered", outcome.success_count());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Application Layer               │
//! └─────────────────────────────────────────────┘
//!          │                    │
//!          ▼                    ▼
//! ┌─────────────────┐  ┌──────────────────────┐
//! │  ShardRouter    │  │ ShardedQueryExecutor │
//! │  key -> shard   │  │ scatter / gather     │
//! └─────────────────┘  └──────────────────────┘
//!          │                    │
//!          │      ┌─────────────┼──────────────┐
//!          │      ▼             ▼              ▼
//!          │ ┌──────────┐ ┌────────────┐ ┌───────────┐
//!          │ │Reference │ │ Migration  │ │  Schema   │
//!          │ │ tables   │ │coordinator │ │ comparer  │
//!          │ └──────────┘ └────────────┘ └───────────┘
//!          ▼
//! ┌─────────────────────────────────────────────┐
//! │ ReadWriteRouter: RoutingContext + selectors │
//! │ + ReplicaHealthTracker                      │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//!            ConnectionFactory (caller)
//! ```
//!
//! # Routing context
//!
//! Writes go to the primary by default. Reads may be sent to replicas by
//! entering a [`ConnectionIntent::Read`] scope; a `ForceWrite` scope anywhere
//! on the stack pins the flow to the primary:
//!
//! ```rust,ignore
//! let endpoint = with_intent(ConnectionIntent::Read, async {
//!     router.route_ambient(&shard_id)
//! })
//! .await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod reference;
pub mod replica;
pub mod schema;
pub mod sharding;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{
    FailureTolerance, ReplicaConfig, ReplicaSelectionStrategy, RoutingStrategy,
    ScatterGatherOptions, ShardConfig, ShardingConfig, StatementConfig,
};
pub use connection::{ConnectionFactory, ShardConnection};
pub use error::{Error, Result, ShardFailure};
pub use types::{ParameterStyle, Row, ShardId, Statement, Value};

// Re-export sharding types
pub use sharding::{
    build_router, HashRing, ShardInfo, ShardKey, ShardResult, ShardRouter, ShardTargets,
    ShardTopology, Sharded, ShardedQueryExecutor, ShardedQueryResult,
};

// Re-export replica types
pub use replica::{
    with_intent, ConnectionIntent, ReadWriteRouter, ReplicaHealthTracker, ReplicaSelector,
    ReplicaSet, RoutedEndpoint, RoutingContext,
};

// Re-export reference table types
pub use reference::{
    ReferenceTable, ReferenceTableReplicator, ReferenceTableStore, SqlReferenceTableStore,
};

// Re-export schema types
pub use schema::{
    Migration, MigrationHistoryStore, MigrationStrategy, SchemaComparer, SchemaIntrospector,
    ShardedMigrationCoordinator, SqlMigrationHistoryStore, SqlSchemaIntrospector,
};
