//! Reference tables: small datasets replicated identically to every shard.
//!
//! A [`ReferenceTableReplicator`] reads a table from its source shard and
//! upserts it everywhere else through the scatter-gather executor. Drift is
//! detected by comparing order-independent content hashes, so shards never
//! exchange full datasets to check consistency.

mod dataset;
mod replicator;
mod store;

pub use dataset::{compute_hash, ReferenceDataset, ReferenceTable};
pub use replicator::{DriftReport, ReferenceTableReplicator, ReplicationReport};
pub use store::{InMemoryReferenceTableStore, ReferenceTableStore, SqlReferenceTableStore};
