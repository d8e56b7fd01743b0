//! Immutable registry of shards and their endpoints.

use crate::error::{Error, Result};
use crate::types::ShardId;
use std::collections::HashMap;

/// A shard and its connection endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Unique shard identifier.
    pub id: ShardId,

    /// Connection descriptor of the primary (read-write) endpoint.
    pub endpoint: String,

    /// Connection descriptors of read replicas, in preference order.
    pub replicas: Vec<String>,
}

impl ShardInfo {
    /// Create a shard with a primary endpoint and no replicas.
    pub fn new(id: impl Into<ShardId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            replicas: Vec::new(),
        }
    }

    /// Add read replicas.
    pub fn with_replicas<I, S>(mut self, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replicas = replicas.into_iter().map(Into::into).collect();
        self
    }
}

/// Ordered, immutable mapping from [`ShardId`] to [`ShardInfo`].
///
/// Enumeration order is the construction order and never changes for the
/// lifetime of the value. Share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ShardTopology {
    shards: Vec<ShardInfo>,
    index: HashMap<ShardId, usize>,
}

impl ShardTopology {
    /// Build a topology, rejecting empty or duplicate shard IDs.
    pub fn new(shards: Vec<ShardInfo>) -> Result<Self> {
        let mut index = HashMap::with_capacity(shards.len());
        for (position, shard) in shards.iter().enumerate() {
            if shard.id.is_empty() {
                return Err(Error::Config(format!(
                    "shard at position {} has an empty id",
                    position
                )));
            }
            if index.insert(shard.id.clone(), position).is_some() {
                return Err(Error::Config(format!("duplicate shard id: {}", shard.id)));
            }
        }
        Ok(Self { shards, index })
    }

    /// A topology with no shards.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the topology has no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Look up a shard by ID.
    pub fn get(&self, shard_id: &ShardId) -> Result<&ShardInfo> {
        self.index
            .get(shard_id)
            .map(|&i| &self.shards[i])
            .ok_or_else(|| Error::UnknownShard(shard_id.to_string()))
    }

    /// Whether the topology contains a shard.
    pub fn contains(&self, shard_id: &ShardId) -> bool {
        self.index.contains_key(shard_id)
    }

    /// Shard at a position in enumeration order.
    pub fn by_position(&self, position: usize) -> Option<&ShardInfo> {
        self.shards.get(position)
    }

    /// Position of a shard in enumeration order.
    pub fn position(&self, shard_id: &ShardId) -> Option<usize> {
        self.index.get(shard_id).copied()
    }

    /// All shards in enumeration order.
    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    /// All shard IDs in enumeration order.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_shards() -> ShardTopology {
        ShardTopology::new(vec![
            ShardInfo::new("s0", "db0:5432"),
            ShardInfo::new("s1", "db1:5432").with_replicas(["db1-r1:5432"]),
            ShardInfo::new("s2", "db2:5432"),
        ])
        .unwrap()
    }

    #[test]
    fn test_topology_lookup() {
        let topology = three_shards();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.get(&"s1".into()).unwrap().endpoint, "db1:5432");
        assert_eq!(topology.get(&"s1".into()).unwrap().replicas.len(), 1);
        assert!(matches!(
            topology.get(&"s9".into()),
            Err(Error::UnknownShard(_))
        ));
    }

    #[test]
    fn test_topology_order_is_stable() {
        let topology = three_shards();
        let ids: Vec<String> = topology.shard_ids().iter().map(|s| s.to_string()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
        assert_eq!(topology.position(&"s2".into()), Some(2));
        assert_eq!(topology.by_position(0).unwrap().id, ShardId::from("s0"));
    }

    #[test]
    fn test_topology_rejects_duplicates_and_empty_ids() {
        let dup = ShardTopology::new(vec![
            ShardInfo::new("s0", "a"),
            ShardInfo::new("s0", "b"),
        ]);
        assert!(matches!(dup, Err(Error::Config(_))));

        let empty_id = ShardTopology::new(vec![ShardInfo::new("", "a")]);
        assert!(matches!(empty_id, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_topology() {
        let topology = ShardTopology::empty();
        assert!(topology.is_empty());
        assert!(topology.shard_ids().is_empty());
    }
}
