//! Shard topology, key routing and scatter-gather execution.
//!
//! ```text
//!            key                         ShardTargets
//!             │                               │
//!             ▼                               ▼
//!   ┌───────────────────┐          ┌──────────────────────┐
//!   │    ShardRouter    │          │ ShardedQueryExecutor │
//!   │ hash / ring /     │          │ bounded fan-out,     │
//!   │ range / directory │          │ per-shard timeouts   │
//!   └───────────────────┘          └──────────────────────┘
//!             │                               │
//!             └──────────────┬────────────────┘
//!                            ▼
//!                  ┌──────────────────┐
//!                  │  ShardTopology   │
//!                  │ (immutable, Arc) │
//!                  └──────────────────┘
//! ```

pub mod executor;
pub mod hashring;
pub mod router;
pub mod topology;

pub use executor::{ShardResult, ShardTargets, ShardedQueryExecutor, ShardedQueryResult};
pub use hashring::{HashRing, DEFAULT_VNODES_PER_SHARD};
pub use router::{
    build_router, ConsistentHashRouter, DirectoryShardRouter, HashShardRouter, KeyRange,
    RangeShardRouter, ShardKey, ShardRouter, Sharded, DEFAULT_HASH_SEED,
};
pub use topology::{ShardInfo, ShardTopology};
