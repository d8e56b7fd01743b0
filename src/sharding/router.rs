//! Key-to-shard routing.
//!
//! Every router is a pure function of (topology, key): resolving the same key
//! against the same topology always yields the same shard. Topology changes
//! are not handled here; build a new router from the new topology.

use super::hashring::HashRing;
use super::topology::{ShardInfo, ShardTopology};
use crate::config::RoutingStrategy;
use crate::error::{Error, Result};
use crate::types::ShardId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Default seed for key hashing.
pub const DEFAULT_HASH_SEED: u64 = 0x5AFE_CAFE_DEAD_BEEF;

/// Separator written between the parts of a compound key.
const COMPOUND_SEPARATOR: u8 = 0x1F;

/// The value used to compute a shard assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardKey {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    /// Ordered parts, e.g. `(tenant_id, region)`.
    Compound(Vec<ShardKey>),
}

impl ShardKey {
    /// Build a compound key from its parts.
    pub fn compound<I, K>(parts: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ShardKey>,
    {
        ShardKey::Compound(parts.into_iter().map(Into::into).collect())
    }

    /// Canonical byte encoding fed to the hash functions.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_bytes(&mut out);
        out
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        match self {
            ShardKey::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            ShardKey::Text(s) => out.extend_from_slice(s.as_bytes()),
            ShardKey::Bytes(b) => out.extend_from_slice(b),
            ShardKey::Compound(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push(COMPOUND_SEPARATOR);
                    }
                    part.write_bytes(out);
                }
            }
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Int(v) => write!(f, "{}", v),
            ShardKey::Text(s) => f.write_str(s),
            ShardKey::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ShardKey::Compound(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<&str> for ShardKey {
    fn from(v: &str) -> Self {
        ShardKey::Text(v.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(v: String) -> Self {
        ShardKey::Text(v)
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        ShardKey::Int(v)
    }
}

impl From<Vec<u8>> for ShardKey {
    fn from(v: Vec<u8>) -> Self {
        ShardKey::Bytes(v)
    }
}

/// An entity that knows its own shard key.
pub trait Sharded {
    /// The key this entity is partitioned by.
    fn shard_key(&self) -> ShardKey;
}

/// Maps keys to shards.
pub trait ShardRouter: Send + Sync + fmt::Debug {
    /// Resolve the shard owning `key`.
    fn resolve(&self, key: &ShardKey) -> Result<&ShardInfo>;

    /// The topology this router resolves against.
    fn topology(&self) -> &ShardTopology;

    /// Resolve the shard owning an entity.
    fn resolve_entity(&self, entity: &dyn Sharded) -> Result<&ShardInfo> {
        self.resolve(&entity.shard_key())
    }

    /// Group key indices by owning shard, for batched single-shard work.
    fn group_by_shard(&self, keys: &[ShardKey]) -> Result<BTreeMap<ShardId, Vec<usize>>> {
        let mut groups: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
        for (idx, key) in keys.iter().enumerate() {
            let shard = self.resolve(key)?;
            groups.entry(shard.id.clone()).or_default().push(idx);
        }
        Ok(groups)
    }
}

fn empty_topology(key: &ShardKey) -> Error {
    Error::UnknownShard(format!("no shards configured to route key {}", key))
}

fn validate_overrides(
    topology: &ShardTopology,
    overrides: impl IntoIterator<Item = (ShardKey, ShardId)>,
) -> Result<HashMap<ShardKey, ShardId>> {
    let mut table = HashMap::new();
    for (key, shard_id) in overrides {
        if !topology.contains(&shard_id) {
            return Err(Error::Config(format!(
                "override for key {} targets unknown shard {}",
                key, shard_id
            )));
        }
        table.insert(key, shard_id);
    }
    Ok(table)
}

/// Hash of the key modulo the shard count, with an override table checked
/// first.
#[derive(Debug)]
pub struct HashShardRouter {
    topology: Arc<ShardTopology>,
    seed: u64,
    overrides: HashMap<ShardKey, ShardId>,
}

impl HashShardRouter {
    /// Create a hash router with the default seed and no overrides.
    pub fn new(topology: Arc<ShardTopology>) -> Self {
        Self {
            topology,
            seed: DEFAULT_HASH_SEED,
            overrides: HashMap::new(),
        }
    }

    /// Set the hash seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Pin keys to explicit shards. Fails if a target shard is unknown.
    pub fn with_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (ShardKey, ShardId)>,
    ) -> Result<Self> {
        self.overrides = validate_overrides(&self.topology, overrides)?;
        Ok(self)
    }

    /// Hash a key with this router's seed.
    pub fn hash_key(&self, key: &ShardKey) -> u64 {
        let mut hasher = XxHash64::with_seed(self.seed);
        hasher.write(&key.to_bytes());
        hasher.finish()
    }
}

impl ShardRouter for HashShardRouter {
    fn resolve(&self, key: &ShardKey) -> Result<&ShardInfo> {
        if self.topology.is_empty() {
            return Err(empty_topology(key));
        }
        if let Some(shard_id) = self.overrides.get(key) {
            return self.topology.get(shard_id);
        }

        let position = (self.hash_key(key) % self.topology.len() as u64) as usize;
        self.topology
            .by_position(position)
            .ok_or_else(|| empty_topology(key))
    }

    fn topology(&self) -> &ShardTopology {
        &self.topology
    }
}

/// Consistent hashing over a ring of virtual nodes.
#[derive(Debug)]
pub struct ConsistentHashRouter {
    topology: Arc<ShardTopology>,
    ring: HashRing,
    overrides: HashMap<ShardKey, ShardId>,
}

impl ConsistentHashRouter {
    /// Create a router placing every shard `virtual_nodes` times on the ring.
    pub fn new(topology: Arc<ShardTopology>, virtual_nodes: usize, seed: u64) -> Self {
        let ids = topology.shard_ids();
        let ring = HashRing::with_shards(&ids, virtual_nodes, seed);
        Self {
            topology,
            ring,
            overrides: HashMap::new(),
        }
    }

    /// Pin keys to explicit shards. Fails if a target shard is unknown.
    pub fn with_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (ShardKey, ShardId)>,
    ) -> Result<Self> {
        self.overrides = validate_overrides(&self.topology, overrides)?;
        Ok(self)
    }

    /// The underlying ring.
    pub fn ring(&self) -> &HashRing {
        &self.ring
    }
}

impl ShardRouter for ConsistentHashRouter {
    fn resolve(&self, key: &ShardKey) -> Result<&ShardInfo> {
        if let Some(shard_id) = self.overrides.get(key) {
            return self.topology.get(shard_id);
        }
        let shard_id = self
            .ring
            .shard_for_key(&key.to_bytes())
            .ok_or_else(|| empty_topology(key))?;
        self.topology.get(shard_id)
    }

    fn topology(&self) -> &ShardTopology {
        &self.topology
    }
}

/// A half-open key range `[start, end)` owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: ShardKey,
    /// Exclusive upper bound; `None` is unbounded.
    pub end: Option<ShardKey>,
    /// Owning shard.
    pub shard_id: ShardId,
}

impl KeyRange {
    /// Create a range.
    pub fn new(start: impl Into<ShardKey>, end: Option<ShardKey>, shard_id: impl Into<ShardId>) -> Self {
        Self {
            start: start.into(),
            end,
            shard_id: shard_id.into(),
        }
    }

    /// Whether the range holds `key`.
    pub fn contains(&self, key: &ShardKey) -> bool {
        key >= &self.start && self.end.as_ref().map_or(true, |end| key < end)
    }
}

/// Routes by ordered, non-overlapping key ranges.
#[derive(Debug)]
pub struct RangeShardRouter {
    topology: Arc<ShardTopology>,
    /// Sorted by `start`.
    ranges: Vec<KeyRange>,
}

impl RangeShardRouter {
    /// Create a range router. Ranges must not overlap and must target known
    /// shards.
    pub fn new(topology: Arc<ShardTopology>, mut ranges: Vec<KeyRange>) -> Result<Self> {
        ranges.sort_by(|a, b| a.start.cmp(&b.start));

        for range in &ranges {
            if !topology.contains(&range.shard_id) {
                return Err(Error::Config(format!(
                    "range starting at {} targets unknown shard {}",
                    range.start, range.shard_id
                )));
            }
            if let Some(end) = &range.end {
                if end <= &range.start {
                    return Err(Error::Config(format!(
                        "range starting at {} is empty",
                        range.start
                    )));
                }
            }
        }
        for pair in ranges.windows(2) {
            let overlaps = match &pair[0].end {
                Some(end) => end > &pair[1].start,
                None => true,
            };
            if overlaps {
                return Err(Error::Config(format!(
                    "ranges starting at {} and {} overlap",
                    pair[0].start, pair[1].start
                )));
            }
        }

        Ok(Self { topology, ranges })
    }

    /// Configured ranges in key order.
    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }
}

impl ShardRouter for RangeShardRouter {
    fn resolve(&self, key: &ShardKey) -> Result<&ShardInfo> {
        if self.topology.is_empty() {
            return Err(empty_topology(key));
        }
        let candidate = self.ranges.partition_point(|r| &r.start <= key);
        let range = candidate
            .checked_sub(1)
            .map(|i| &self.ranges[i])
            .filter(|r| r.contains(key))
            .ok_or_else(|| Error::UnknownShard(format!("no range contains key {}", key)))?;
        self.topology.get(&range.shard_id)
    }

    fn topology(&self) -> &ShardTopology {
        &self.topology
    }
}

/// Explicit key -> shard lookup with an optional default shard.
///
/// The table is fixed at construction; a new assignment needs a new router.
#[derive(Debug)]
pub struct DirectoryShardRouter {
    topology: Arc<ShardTopology>,
    entries: HashMap<ShardKey, ShardId>,
    default_shard: Option<ShardId>,
}

impl DirectoryShardRouter {
    /// Create a directory router.
    pub fn new(
        topology: Arc<ShardTopology>,
        entries: impl IntoIterator<Item = (ShardKey, ShardId)>,
        default_shard: Option<ShardId>,
    ) -> Result<Self> {
        let entries = validate_overrides(&topology, entries)?;
        if let Some(default) = &default_shard {
            if !topology.contains(default) {
                return Err(Error::Config(format!("default shard {} is unknown", default)));
            }
        }
        Ok(Self {
            topology,
            entries,
            default_shard,
        })
    }

    /// Number of explicit assignments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no explicit assignments.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ShardRouter for DirectoryShardRouter {
    fn resolve(&self, key: &ShardKey) -> Result<&ShardInfo> {
        if self.topology.is_empty() {
            return Err(empty_topology(key));
        }
        let shard_id = self
            .entries
            .get(key)
            .or(self.default_shard.as_ref())
            .ok_or_else(|| Error::UnknownShard(format!("no directory entry for key {}", key)))?;
        self.topology.get(shard_id)
    }

    fn topology(&self) -> &ShardTopology {
        &self.topology
    }
}

/// Build the router selected by `strategy`.
pub fn build_router(
    strategy: &RoutingStrategy,
    topology: Arc<ShardTopology>,
    hash_seed: u64,
    overrides: &[(ShardKey, ShardId)],
) -> Result<Arc<dyn ShardRouter>> {
    let router: Arc<dyn ShardRouter> = match strategy {
        RoutingStrategy::Hash => Arc::new(
            HashShardRouter::new(topology)
                .with_seed(hash_seed)
                .with_overrides(overrides.iter().cloned())?,
        ),
        RoutingStrategy::ConsistentHash { virtual_nodes } => Arc::new(
            ConsistentHashRouter::new(topology, *virtual_nodes, hash_seed)
                .with_overrides(overrides.iter().cloned())?,
        ),
        RoutingStrategy::Range { ranges } => {
            Arc::new(RangeShardRouter::new(topology, ranges.clone())?)
        }
        RoutingStrategy::Directory {
            entries,
            default_shard,
        } => {
            let all = entries.iter().chain(overrides.iter()).cloned();
            Arc::new(DirectoryShardRouter::new(topology, all, default_shard.clone())?)
        }
    };
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(n: usize) -> Arc<ShardTopology> {
        Arc::new(
            ShardTopology::new(
                (0..n)
                    .map(|i| ShardInfo::new(format!("s{}", i), format!("db{}", i)))
                    .collect(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_hash_routing_is_deterministic() {
        let router = HashShardRouter::new(topology(4));
        for i in 0..200 {
            let key = ShardKey::from(format!("customer-{}", i));
            let first = router.resolve(&key).unwrap().id.clone();
            for _ in 0..5 {
                assert_eq!(router.resolve(&key).unwrap().id, first);
            }
        }

        // A second router over an equal topology agrees.
        let other = HashShardRouter::new(topology(4));
        let key = ShardKey::from("order-42");
        assert_eq!(router.resolve(&key).unwrap(), other.resolve(&key).unwrap());
    }

    #[test]
    fn test_hash_routing_distribution() {
        let router = HashShardRouter::new(topology(4));
        let mut distribution: HashMap<ShardId, usize> = HashMap::new();
        for i in 0..4000 {
            let shard = router.resolve(&ShardKey::Int(i)).unwrap();
            *distribution.entry(shard.id.clone()).or_insert(0) += 1;
        }
        assert_eq!(distribution.len(), 4);
        for &count in distribution.values() {
            assert!(count > 700 && count < 1300, "skewed: {}", count);
        }
    }

    #[test]
    fn test_empty_topology_is_unknown_shard() {
        let router = HashShardRouter::new(Arc::new(ShardTopology::empty()));
        assert!(matches!(
            router.resolve(&ShardKey::from("k")),
            Err(Error::UnknownShard(_))
        ));

        let ring = ConsistentHashRouter::new(Arc::new(ShardTopology::empty()), 10, 0);
        assert!(matches!(
            ring.resolve(&ShardKey::from("k")),
            Err(Error::UnknownShard(_))
        ));
    }

    #[test]
    fn test_overrides_checked_first() {
        let router = HashShardRouter::new(topology(3))
            .with_overrides([(ShardKey::from("vip"), ShardId::from("s2"))])
            .unwrap();
        assert_eq!(router.resolve(&ShardKey::from("vip")).unwrap().id, ShardId::from("s2"));

        let bad = HashShardRouter::new(topology(3))
            .with_overrides([(ShardKey::from("vip"), ShardId::from("s9"))]);
        assert!(matches!(bad, Err(Error::Config(_))));
    }

    #[test]
    fn test_compound_keys_hash_by_parts() {
        let a = ShardKey::compound(["tenant-1", "eu"]);
        let b = ShardKey::compound(["tenant-1e", "u"]);
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.to_string(), "(tenant-1, eu)");
    }

    #[test]
    fn test_range_routing() {
        let router = RangeShardRouter::new(
            topology(3),
            vec![
                KeyRange::new(ShardKey::Int(100), Some(ShardKey::Int(200)), "s1"),
                KeyRange::new(ShardKey::Int(0), Some(ShardKey::Int(100)), "s0"),
                KeyRange::new(ShardKey::Int(200), None, "s2"),
            ],
        )
        .unwrap();

        assert_eq!(router.resolve(&ShardKey::Int(0)).unwrap().id, ShardId::from("s0"));
        assert_eq!(router.resolve(&ShardKey::Int(99)).unwrap().id, ShardId::from("s0"));
        assert_eq!(router.resolve(&ShardKey::Int(100)).unwrap().id, ShardId::from("s1"));
        assert_eq!(router.resolve(&ShardKey::Int(5000)).unwrap().id, ShardId::from("s2"));
        assert!(matches!(
            router.resolve(&ShardKey::Int(-1)),
            Err(Error::UnknownShard(_))
        ));
    }

    #[test]
    fn test_range_overlap_rejected() {
        let result = RangeShardRouter::new(
            topology(2),
            vec![
                KeyRange::new(ShardKey::Int(0), Some(ShardKey::Int(150)), "s0"),
                KeyRange::new(ShardKey::Int(100), None, "s1"),
            ],
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_directory_routing() {
        let router = DirectoryShardRouter::new(
            topology(3),
            [(ShardKey::from("acme"), ShardId::from("s1"))],
            Some(ShardId::from("s0")),
        )
        .unwrap();

        assert_eq!(router.resolve(&ShardKey::from("acme")).unwrap().id, ShardId::from("s1"));
        assert_eq!(router.resolve(&ShardKey::from("other")).unwrap().id, ShardId::from("s0"));

        assert_eq!(router.len(), 1);

        // Resolution never changes for the lifetime of the router.
        for _ in 0..5 {
            assert_eq!(router.resolve(&ShardKey::from("acme")).unwrap().id, ShardId::from("s1"));
        }

        let unknown = DirectoryShardRouter::new(
            topology(3),
            [(ShardKey::from("x"), ShardId::from("nope"))],
            None,
        );
        assert!(unknown.is_err());

        let strict = DirectoryShardRouter::new(topology(3), std::iter::empty(), None).unwrap();
        assert!(strict.is_empty());
        assert!(matches!(
            strict.resolve(&ShardKey::from("acme")),
            Err(Error::UnknownShard(_))
        ));
    }

    #[test]
    fn test_group_by_shard() {
        struct Order {
            customer: String,
        }
        impl Sharded for Order {
            fn shard_key(&self) -> ShardKey {
                ShardKey::from(self.customer.as_str())
            }
        }

        let router = HashShardRouter::new(topology(4));
        let keys: Vec<ShardKey> = (0..20).map(|i| ShardKey::Int(i)).collect();
        let groups = router.group_by_shard(&keys).unwrap();
        assert_eq!(groups.values().map(Vec::len).sum::<usize>(), 20);

        let order = Order {
            customer: "c-17".into(),
        };
        assert_eq!(
            router.resolve_entity(&order).unwrap(),
            router.resolve(&ShardKey::from("c-17")).unwrap()
        );
    }

    #[test]
    fn test_build_router_from_strategy() {
        let router = build_router(
            &RoutingStrategy::ConsistentHash { virtual_nodes: 64 },
            topology(3),
            DEFAULT_HASH_SEED,
            &[],
        )
        .unwrap();
        assert_eq!(router.topology().len(), 3);
        assert!(router.resolve(&ShardKey::from("k")).is_ok());
    }
}
