//! Connection collaborator contracts.
//!
//! The routing core never opens sockets itself. It asks a
//! [`ConnectionFactory`] for a handle per shard and issues parameterized
//! [`Statement`]s through it. Pooling and connection lifecycle belong to the
//! factory; the caller owns the returned handle and releases it by dropping
//! it.

use crate::error::Result;
use crate::types::{Row, ShardId, Statement};
use async_trait::async_trait;
use std::fmt;

/// A live connection to one shard.
#[async_trait]
pub trait ShardConnection: Send + Sync {
    /// The shard this connection targets.
    fn shard_id(&self) -> &ShardId;

    /// Execute a statement that returns no rows. Returns the affected row count.
    async fn execute_non_query(&self, statement: &Statement) -> Result<u64>;

    /// Execute a query and collect its rows.
    async fn execute_reader(&self, statement: &Statement) -> Result<Vec<Row>>;

    /// Execute statements in order, stopping at the first error.
    async fn execute_batch(&self, statements: &[Statement]) -> Result<u64> {
        let mut affected = 0;
        for statement in statements {
            affected += self.execute_non_query(statement).await?;
        }
        Ok(affected)
    }
}

/// Opens connections by shard ID.
///
/// Fails with `UnknownShard` or `ShardUnreachable` rather than panicking.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Open a connection to `shard_id`.
    async fn get_connection(&self, shard_id: &ShardId) -> Result<Box<dyn ShardConnection>>;
}
