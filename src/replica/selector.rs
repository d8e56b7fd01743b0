//! Replica selection strategies and connection leases.
//!
//! A strategy is chosen once from configuration and held as a single
//! `Arc<dyn ReplicaSelector>`. Every strategy skips unhealthy replicas and
//! falls back to the shard's primary when no replica is usable, so a
//! [`ReplicaSet`] always yields an endpoint.

use super::health::ReplicaHealthTracker;
use crate::config::ReplicaSelectionStrategy;
use crate::sharding::topology::ShardInfo;
use crate::types::ShardId;
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A connectable endpoint (primary or replica).
#[derive(Debug)]
pub struct ReplicaEndpoint {
    address: String,
    active_leases: AtomicUsize,
}

impl ReplicaEndpoint {
    /// Create an endpoint with no active leases.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            active_leases: AtomicUsize::new(0),
        }
    }

    /// Connection descriptor.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Leases currently held against this endpoint.
    pub fn active_leases(&self) -> usize {
        self.active_leases.load(Ordering::SeqCst)
    }
}

/// A shard's primary plus its read replicas.
#[derive(Debug)]
pub struct ReplicaSet {
    shard_id: ShardId,
    primary: Arc<ReplicaEndpoint>,
    replicas: Vec<Arc<ReplicaEndpoint>>,

    /// Round-robin cursor.
    cursor: AtomicUsize,

    /// Guards the scan-and-increment of least-connections selection.
    lease_lock: Mutex<()>,
}

impl ReplicaSet {
    /// Create a replica set.
    pub fn new<I, S>(shard_id: impl Into<ShardId>, primary: impl Into<String>, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shard_id: shard_id.into(),
            primary: Arc::new(ReplicaEndpoint::new(primary)),
            replicas: replicas
                .into_iter()
                .map(|r| Arc::new(ReplicaEndpoint::new(r)))
                .collect(),
            cursor: AtomicUsize::new(0),
            lease_lock: Mutex::new(()),
        }
    }

    /// Build the replica set of a shard.
    pub fn from_shard(shard: &ShardInfo) -> Self {
        Self::new(shard.id.clone(), shard.endpoint.clone(), shard.replicas.iter().cloned())
    }

    /// Owning shard.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// The primary endpoint, always selectable.
    pub fn primary(&self) -> &Arc<ReplicaEndpoint> {
        &self.primary
    }

    /// Read replicas in configuration order.
    pub fn replicas(&self) -> &[Arc<ReplicaEndpoint>] {
        &self.replicas
    }

    /// Replicas the tracker currently considers healthy.
    pub fn healthy_replicas(&self, health: &ReplicaHealthTracker) -> Vec<&Arc<ReplicaEndpoint>> {
        self.replicas
            .iter()
            .filter(|r| health.is_healthy(r.address()))
            .collect()
    }

    fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

/// A claim on an endpoint's connection budget.
///
/// The lease count is decremented exactly once: on [`ReplicaLease::release`]
/// or on drop, whichever comes first. Dropping covers early returns, errors
/// and cancelled futures.
#[derive(Debug)]
pub struct ReplicaLease {
    endpoint: Arc<ReplicaEndpoint>,
    is_primary: bool,
    held: bool,
}

impl ReplicaLease {
    fn acquire(endpoint: Arc<ReplicaEndpoint>, is_primary: bool) -> Self {
        endpoint.active_leases.fetch_add(1, Ordering::SeqCst);
        Self {
            endpoint,
            is_primary,
            held: true,
        }
    }

    /// Lease the primary of a replica set.
    pub fn primary(set: &ReplicaSet) -> Self {
        Self::acquire(Arc::clone(set.primary()), true)
    }

    /// The leased endpoint.
    pub fn endpoint(&self) -> &Arc<ReplicaEndpoint> {
        &self.endpoint
    }

    /// The leased endpoint's address.
    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    /// Whether the lease fell back to (or targets) the primary.
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Whether the lease is still counted against the endpoint.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Give the lease back. Further calls are no-ops.
    pub fn release(&mut self) {
        if self.held {
            self.held = false;
            self.endpoint.active_leases.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ReplicaLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Picks one endpoint from a replica set.
pub trait ReplicaSelector: Send + Sync + fmt::Debug {
    /// The strategy this selector implements.
    fn strategy(&self) -> ReplicaSelectionStrategy;

    /// Pick an endpoint without taking a lease.
    fn select_replica(&self, set: &ReplicaSet) -> Arc<ReplicaEndpoint>;

    /// Pick an endpoint and take a lease on it.
    fn acquire_lease(&self, set: &ReplicaSet) -> ReplicaLease {
        let endpoint = self.select_replica(set);
        let is_primary = Arc::ptr_eq(&endpoint, set.primary());
        ReplicaLease::acquire(endpoint, is_primary)
    }
}

fn fall_back_to_primary(set: &ReplicaSet) -> Arc<ReplicaEndpoint> {
    if !set.replicas().is_empty() {
        tracing::debug!(shard_id = %set.shard_id(), "No healthy replica, using primary");
    }
    Arc::clone(set.primary())
}

/// Cycles through replicas with a lock-free per-set cursor.
#[derive(Debug)]
pub struct RoundRobinSelector {
    health: Arc<ReplicaHealthTracker>,
}

impl RoundRobinSelector {
    /// Create a round-robin selector.
    pub fn new(health: Arc<ReplicaHealthTracker>) -> Self {
        Self { health }
    }
}

impl ReplicaSelector for RoundRobinSelector {
    fn strategy(&self) -> ReplicaSelectionStrategy {
        ReplicaSelectionStrategy::RoundRobin
    }

    fn select_replica(&self, set: &ReplicaSet) -> Arc<ReplicaEndpoint> {
        let healthy = set.healthy_replicas(&self.health);
        if healthy.is_empty() {
            return fall_back_to_primary(set);
        }
        // Index the healthy list, not all replicas: turns stay even.
        Arc::clone(healthy[set.next_cursor() % healthy.len()])
    }
}

/// Samples uniformly among healthy replicas. No shared counter.
#[derive(Debug)]
pub struct RandomSelector {
    health: Arc<ReplicaHealthTracker>,
}

impl RandomSelector {
    /// Create a random selector.
    pub fn new(health: Arc<ReplicaHealthTracker>) -> Self {
        Self { health }
    }
}

impl ReplicaSelector for RandomSelector {
    fn strategy(&self) -> ReplicaSelectionStrategy {
        ReplicaSelectionStrategy::Random
    }

    fn select_replica(&self, set: &ReplicaSet) -> Arc<ReplicaEndpoint> {
        let healthy = set.healthy_replicas(&self.health);
        if healthy.is_empty() {
            return fall_back_to_primary(set);
        }
        let index = rand::rng().random_range(0..healthy.len());
        Arc::clone(healthy[index])
    }
}

/// Picks the healthy replica with the fewest active leases.
///
/// Lease acquisition scans and increments under the set's lock, so two
/// concurrent callers never both see the same minimum.
#[derive(Debug)]
pub struct LeastConnectionsSelector {
    health: Arc<ReplicaHealthTracker>,
}

impl LeastConnectionsSelector {
    /// Create a least-connections selector.
    pub fn new(health: Arc<ReplicaHealthTracker>) -> Self {
        Self { health }
    }

    fn least_loaded(&self, set: &ReplicaSet) -> Arc<ReplicaEndpoint> {
        set.healthy_replicas(&self.health)
            .into_iter()
            .min_by_key(|r| r.active_leases())
            .map(Arc::clone)
            .unwrap_or_else(|| fall_back_to_primary(set))
    }
}

impl ReplicaSelector for LeastConnectionsSelector {
    fn strategy(&self) -> ReplicaSelectionStrategy {
        ReplicaSelectionStrategy::LeastConnections
    }

    fn select_replica(&self, set: &ReplicaSet) -> Arc<ReplicaEndpoint> {
        let _guard = set.lease_lock.lock();
        self.least_loaded(set)
    }

    fn acquire_lease(&self, set: &ReplicaSet) -> ReplicaLease {
        let _guard = set.lease_lock.lock();
        let endpoint = self.least_loaded(set);
        let is_primary = Arc::ptr_eq(&endpoint, set.primary());
        ReplicaLease::acquire(endpoint, is_primary)
    }
}

/// Build the selector for a strategy.
pub fn build_selector(
    strategy: ReplicaSelectionStrategy,
    health: Arc<ReplicaHealthTracker>,
) -> Arc<dyn ReplicaSelector> {
    match strategy {
        ReplicaSelectionStrategy::RoundRobin => Arc::new(RoundRobinSelector::new(health)),
        ReplicaSelectionStrategy::Random => Arc::new(RandomSelector::new(health)),
        ReplicaSelectionStrategy::LeastConnections => Arc::new(LeastConnectionsSelector::new(health)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::collections::HashMap;
    use std::time::Duration;

    fn tracker() -> Arc<ReplicaHealthTracker> {
        Arc::new(ReplicaHealthTracker::new(Duration::from_secs(30)))
    }

    fn set(replicas: usize) -> ReplicaSet {
        ReplicaSet::new("s0", "primary", (0..replicas).map(|i| format!("r{}", i)))
    }

    #[test]
    fn test_round_robin_fairness() {
        let selector = RoundRobinSelector::new(tracker());
        let set = set(3);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let endpoint = selector.select_replica(&set);
            *counts.entry(endpoint.address().to_string()).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 10), "{:?}", counts);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let health = tracker();
        let selector = RoundRobinSelector::new(Arc::clone(&health));
        let set = set(3);
        health.report_failure("r1");

        for _ in 0..12 {
            assert_ne!(selector.select_replica(&set).address(), "r1");
        }
    }

    #[test]
    fn test_round_robin_fairness_with_unhealthy_replica() {
        let health = tracker();
        let selector = RoundRobinSelector::new(Arc::clone(&health));
        let set = set(3);
        health.report_failure("r1");

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let endpoint = selector.select_replica(&set);
            *counts.entry(endpoint.address().to_string()).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 2, "{:?}", counts);
        assert_eq!(counts.get("r0"), Some(&15));
        assert_eq!(counts.get("r2"), Some(&15));
    }

    #[test]
    fn test_all_strategies_fall_back_to_primary() {
        let health = tracker();
        let set = set(2);
        health.report_failure("r0");
        health.report_failure("r1");

        for strategy in [
            ReplicaSelectionStrategy::RoundRobin,
            ReplicaSelectionStrategy::Random,
            ReplicaSelectionStrategy::LeastConnections,
        ] {
            let selector = build_selector(strategy, Arc::clone(&health));
            assert_eq!(selector.strategy(), strategy);
            let lease = selector.acquire_lease(&set);
            assert!(lease.is_primary(), "{:?} did not fall back", strategy);
            assert_eq!(lease.address(), "primary");
        }

        // No replicas at all behaves the same.
        let bare = ReplicaSet::new("s1", "p1", Vec::<String>::new());
        assert_eq!(RoundRobinSelector::new(tracker()).select_replica(&bare).address(), "p1");
    }

    #[test]
    fn test_random_only_picks_healthy() {
        let health = tracker();
        let selector = RandomSelector::new(Arc::clone(&health));
        let set = set(4);
        health.report_failure("r2");

        for _ in 0..200 {
            let endpoint = selector.select_replica(&set);
            assert_ne!(endpoint.address(), "r2");
            assert_ne!(endpoint.address(), "primary");
        }
    }

    #[test]
    fn test_least_connections_prefers_fewer_leases() {
        let selector = LeastConnectionsSelector::new(tracker());
        let set = set(3);

        let a = selector.acquire_lease(&set);
        let b = selector.acquire_lease(&set);
        let c = selector.acquire_lease(&set);
        let mut addresses = vec![a.address(), b.address(), c.address()];
        addresses.sort();
        assert_eq!(addresses, vec!["r0", "r1", "r2"]);

        // Pile leases onto r0 only.
        let r0 = Arc::clone(&set.replicas()[0]);
        let extra: Vec<_> = (0..3).map(|_| ReplicaLease::acquire(Arc::clone(&r0), false)).collect();
        assert_eq!(r0.active_leases(), 4);

        let next = selector.acquire_lease(&set);
        assert_ne!(next.address(), "r0");
        drop(extra);
    }

    #[test]
    fn test_lease_released_exactly_once() {
        let selector = LeastConnectionsSelector::new(tracker());
        let set = set(1);

        let mut lease = selector.acquire_lease(&set);
        assert_eq!(set.replicas()[0].active_leases(), 1);
        lease.release();
        lease.release();
        assert!(!lease.is_held());
        drop(lease);
        assert_eq!(set.replicas()[0].active_leases(), 0);
    }

    #[test]
    fn test_lease_released_on_error_path() {
        fn query(selector: &dyn ReplicaSelector, set: &ReplicaSet, fail: bool) -> Result<usize> {
            let lease = selector.acquire_lease(set);
            if fail {
                return Err(Error::Statement("syntax error".into()));
            }
            Ok(lease.endpoint().active_leases())
        }

        let selector = LeastConnectionsSelector::new(tracker());
        let set = set(2);
        assert!(query(&selector, &set, true).is_err());
        assert!(set.replicas().iter().all(|r| r.active_leases() == 0));
        assert_eq!(query(&selector, &set, false).unwrap(), 1);
        assert!(set.replicas().iter().all(|r| r.active_leases() == 0));
    }

    #[tokio::test]
    async fn test_lease_released_on_cancellation() {
        let selector = Arc::new(LeastConnectionsSelector::new(tracker()));
        let set = Arc::new(set(1));

        let (s, rs) = (Arc::clone(&selector), Arc::clone(&set));
        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let _lease = s.acquire_lease(&rs);
            let _ = acquired_tx.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        acquired_rx.await.unwrap();
        assert_eq!(set.replicas()[0].active_leases(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(set.replicas()[0].active_leases(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_least_connections_under_contention() {
        let selector = Arc::new(LeastConnectionsSelector::new(tracker()));
        let set = Arc::new(set(4));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let (s, rs) = (Arc::clone(&selector), Arc::clone(&set));
            handles.push(tokio::spawn(async move { s.acquire_lease(&rs) }));
        }
        let mut leases = Vec::new();
        for handle in handles {
            leases.push(handle.await.unwrap());
        }

        let counts: Vec<usize> = set.replicas().iter().map(|r| r.active_leases()).collect();
        assert_eq!(counts.iter().sum::<usize>(), 64);
        assert!(counts.iter().all(|&c| c == 16), "{:?}", counts);

        drop(leases);
        assert!(set.replicas().iter().all(|r| r.active_leases() == 0));
    }
}
