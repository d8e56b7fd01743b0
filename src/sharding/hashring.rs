//! Consistent hash ring with virtual nodes.
//!
//! Each shard is placed on the ring `vnodes_per_shard` times so keys spread
//! evenly, and adding or removing a shard only moves the keys adjacent to its
//! virtual nodes instead of reshuffling everything as modulo hashing does.

use crate::types::ShardId;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Default number of virtual nodes per shard.
pub const DEFAULT_VNODES_PER_SHARD: usize = 150;

/// A consistent hash ring mapping hash positions to shards.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position -> owning shard.
    vnodes: BTreeMap<u64, ShardId>,

    /// Number of virtual nodes per shard.
    vnodes_per_shard: usize,

    /// Shards on the ring, sorted.
    shards: Vec<ShardId>,

    /// Seed used for both vnode placement and key hashing.
    seed: u64,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(vnodes_per_shard: usize, seed: u64) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_shard: vnodes_per_shard.max(1),
            shards: Vec::new(),
            seed,
        }
    }

    /// Create a ring holding the given shards.
    pub fn with_shards<'a, I>(shards: I, vnodes_per_shard: usize, seed: u64) -> Self
    where
        I: IntoIterator<Item = &'a ShardId>,
    {
        let mut ring = Self::new(vnodes_per_shard, seed);
        for shard in shards {
            ring.add_shard(shard.clone());
        }
        ring
    }

    /// Number of shards on the ring.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shards on the ring, sorted.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Whether a shard is on the ring.
    pub fn contains_shard(&self, shard_id: &ShardId) -> bool {
        self.shards.contains(shard_id)
    }

    /// Place a shard on the ring. No-op if already present.
    pub fn add_shard(&mut self, shard_id: ShardId) {
        if self.shards.contains(&shard_id) {
            return;
        }

        for i in 0..self.vnodes_per_shard {
            let position = self.vnode_position(&shard_id, i);
            self.vnodes.insert(position, shard_id.clone());
        }
        self.shards.push(shard_id);
        self.shards.sort();
    }

    /// Remove a shard and its virtual nodes.
    pub fn remove_shard(&mut self, shard_id: &ShardId) {
        if !self.shards.contains(shard_id) {
            return;
        }

        self.shards.retain(|s| s != shard_id);
        self.vnodes.retain(|_, owner| owner != shard_id);
    }

    /// Shard owning a key. `None` only when the ring is empty.
    pub fn shard_for_key(&self, key: &[u8]) -> Option<&ShardId> {
        self.shard_at(self.hash(key))
    }

    /// Shard owning a ring position: the first vnode at or after `hash`,
    /// wrapping around to the start.
    pub fn shard_at(&self, hash: u64) -> Option<&ShardId> {
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, shard)| shard)
    }

    /// Hash a key with the ring's seed.
    pub fn hash(&self, key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(self.seed);
        hasher.write(key);
        hasher.finish()
    }

    /// Count how a sample of synthetic keys spreads over the shards.
    pub fn distribution(&self, sample_size: usize) -> HashMap<ShardId, usize> {
        let mut distribution = HashMap::new();
        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.shard_for_key(key.as_bytes()) {
                *distribution.entry(owner.clone()).or_insert(0) += 1;
            }
        }
        distribution
    }

    fn vnode_position(&self, shard_id: &ShardId, index: usize) -> u64 {
        let vnode_key = format!("{}#{}", shard_id, index);
        self.hash(vnode_key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ShardId> {
        names.iter().map(|n| ShardId::from(*n)).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(16, 0);
        assert_eq!(ring.shard_count(), 0);
        assert!(ring.shard_for_key(b"key").is_none());
    }

    #[test]
    fn test_single_shard_owns_everything() {
        let ring = HashRing::with_shards(&ids(&["s0"]), 16, 0);
        assert_eq!(ring.shard_for_key(b"a"), Some(&ShardId::from("s0")));
        assert_eq!(ring.shard_for_key(b"zzz"), Some(&ShardId::from("s0")));
    }

    #[test]
    fn test_distribution() {
        let ring = HashRing::with_shards(&ids(&["s0", "s1", "s2"]), DEFAULT_VNODES_PER_SHARD, 7);
        let distribution = ring.distribution(9000);

        for shard in ring.shards() {
            let count = distribution.get(shard).copied().unwrap_or(0);
            assert!(count > 2000 && count < 4000, "{} has {} keys", shard, count);
        }
    }

    #[test]
    fn test_adding_shard_moves_minority_of_keys() {
        let before = HashRing::with_shards(&ids(&["s0", "s1", "s2"]), DEFAULT_VNODES_PER_SHARD, 7);
        let mut after = before.clone();
        after.add_shard(ShardId::from("s3"));

        let moved = (0..4000)
            .filter(|i| {
                let key = format!("k{}", i);
                before.shard_for_key(key.as_bytes()) != after.shard_for_key(key.as_bytes())
            })
            .count();

        // Ideal is 1/4 of keys; modulo hashing would move ~3/4.
        assert!(moved < 1800, "moved {} keys", moved);
        assert!(moved > 0);
    }

    #[test]
    fn test_add_remove_shard() {
        let mut ring = HashRing::with_shards(&ids(&["s0", "s1"]), 32, 0);
        ring.add_shard(ShardId::from("s1"));
        assert_eq!(ring.shard_count(), 2);

        ring.remove_shard(&ShardId::from("s0"));
        assert!(!ring.contains_shard(&ShardId::from("s0")));
        assert_eq!(ring.shard_for_key(b"key"), Some(&ShardId::from("s1")));

        ring.remove_shard(&ShardId::from("missing"));
        assert_eq!(ring.shard_count(), 1);
    }
}
