//! Read/write separation on top of shard routing.
//!
//! Writes (and unknown intent) go to the shard's primary; reads take a lease
//! on a replica chosen by the configured selector.

use super::context::{ConnectionIntent, RoutingContext};
use super::health::ReplicaHealthTracker;
use super::selector::{build_selector, ReplicaLease, ReplicaSelector, ReplicaSet};
use crate::config::ReplicaConfig;
use crate::error::{Error, Result};
use crate::sharding::topology::ShardTopology;
use crate::types::ShardId;
use std::collections::HashMap;
use std::sync::Arc;

/// An endpoint chosen for one unit of work.
///
/// Holds the lease; dropping it gives the lease back.
#[derive(Debug)]
pub struct RoutedEndpoint {
    /// Target shard.
    pub shard_id: ShardId,
    /// Intent the endpoint was chosen for.
    pub intent: ConnectionIntent,
    /// Lease on the chosen endpoint.
    pub lease: ReplicaLease,
}

impl RoutedEndpoint {
    /// Address of the chosen endpoint.
    pub fn address(&self) -> &str {
        self.lease.address()
    }

    /// Whether the primary was chosen.
    pub fn is_primary(&self) -> bool {
        self.lease.is_primary()
    }
}

/// Picks primary or replica endpoints per shard based on intent.
#[derive(Debug)]
pub struct ReadWriteRouter {
    topology: Arc<ShardTopology>,
    replica_sets: HashMap<ShardId, ReplicaSet>,
    selector: Arc<dyn ReplicaSelector>,
    health: Arc<ReplicaHealthTracker>,
}

impl ReadWriteRouter {
    /// Create a router with an explicit selector and tracker.
    pub fn new(
        topology: Arc<ShardTopology>,
        selector: Arc<dyn ReplicaSelector>,
        health: Arc<ReplicaHealthTracker>,
    ) -> Self {
        let replica_sets = topology
            .shards()
            .iter()
            .map(|shard| (shard.id.clone(), ReplicaSet::from_shard(shard)))
            .collect();
        Self {
            topology,
            replica_sets,
            selector,
            health,
        }
    }

    /// Create a router from replica configuration.
    pub fn from_config(topology: Arc<ShardTopology>, config: &ReplicaConfig) -> Result<Self> {
        config.validate()?;
        let health = Arc::new(ReplicaHealthTracker::from_config(config));
        let selector = build_selector(config.strategy, Arc::clone(&health));
        Ok(Self::new(topology, selector, health))
    }

    /// The topology.
    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    /// The selector in use.
    pub fn selector(&self) -> &Arc<dyn ReplicaSelector> {
        &self.selector
    }

    /// The health tracker shared with the selector.
    pub fn health(&self) -> &Arc<ReplicaHealthTracker> {
        &self.health
    }

    /// The replica set of a shard.
    pub fn replica_set(&self, shard_id: &ShardId) -> Result<&ReplicaSet> {
        self.replica_sets
            .get(shard_id)
            .ok_or_else(|| Error::UnknownShard(shard_id.to_string()))
    }

    /// Choose an endpoint of `shard_id` for `intent`.
    pub fn route(&self, shard_id: &ShardId, intent: ConnectionIntent) -> Result<RoutedEndpoint> {
        let set = self.replica_set(shard_id)?;
        let lease = if intent.requires_primary() {
            ReplicaLease::primary(set)
        } else {
            self.selector.acquire_lease(set)
        };
        tracing::trace!(
            shard_id = %shard_id,
            ?intent,
            endpoint = lease.address(),
            "Routed connection"
        );
        Ok(RoutedEndpoint {
            shard_id: shard_id.clone(),
            intent,
            lease,
        })
    }

    /// Route using the effective intent of `context`.
    pub fn route_with(&self, shard_id: &ShardId, context: &RoutingContext) -> Result<RoutedEndpoint> {
        self.route(shard_id, context.effective_intent())
    }

    /// Route using the task's ambient intent (`Write` when none is set).
    pub fn route_ambient(&self, shard_id: &ShardId) -> Result<RoutedEndpoint> {
        self.route(shard_id, RoutingContext::ambient_intent())
    }

    /// Report that the routed endpoint failed.
    pub fn report_failure(&self, endpoint: &RoutedEndpoint) {
        self.health.report_failure(endpoint.address());
    }

    /// Report that the routed endpoint served a request.
    pub fn report_success(&self, endpoint: &RoutedEndpoint) {
        self.health.report_success(endpoint.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaSelectionStrategy;
    use crate::replica::context::with_intent;
    use crate::sharding::topology::ShardInfo;
    use std::time::Duration;

    fn router(strategy: ReplicaSelectionStrategy) -> ReadWriteRouter {
        let topology = ShardTopology::new(vec![
            ShardInfo::new("s0", "db0").with_replicas(["db0-r0", "db0-r1"]),
            ShardInfo::new("s1", "db1"),
        ])
        .unwrap();
        let config = ReplicaConfig::default()
            .with_strategy(strategy)
            .with_recovery_delay(Duration::from_secs(30));
        ReadWriteRouter::from_config(Arc::new(topology), &config).unwrap()
    }

    #[test]
    fn test_write_goes_to_primary() {
        let router = router(ReplicaSelectionStrategy::RoundRobin);
        let endpoint = router.route(&"s0".into(), ConnectionIntent::Write).unwrap();
        assert!(endpoint.is_primary());
        assert_eq!(endpoint.address(), "db0");

        let forced = router.route(&"s0".into(), ConnectionIntent::ForceWrite).unwrap();
        assert_eq!(forced.address(), "db0");
    }

    #[test]
    fn test_read_goes_to_replica() {
        let router = router(ReplicaSelectionStrategy::RoundRobin);
        let first = router.route(&"s0".into(), ConnectionIntent::Read).unwrap();
        let second = router.route(&"s0".into(), ConnectionIntent::Read).unwrap();
        assert!(!first.is_primary());
        assert_ne!(first.address(), second.address());
    }

    #[test]
    fn test_read_without_replicas_uses_primary() {
        let router = router(ReplicaSelectionStrategy::LeastConnections);
        let endpoint = router.route(&"s1".into(), ConnectionIntent::Read).unwrap();
        assert!(endpoint.is_primary());
        assert_eq!(endpoint.address(), "db1");
    }

    #[test]
    fn test_unknown_shard() {
        let router = router(ReplicaSelectionStrategy::Random);
        assert!(matches!(
            router.route(&"s9".into(), ConnectionIntent::Read),
            Err(Error::UnknownShard(_))
        ));
    }

    #[test]
    fn test_context_routing_defaults_to_primary() {
        let router = router(ReplicaSelectionStrategy::RoundRobin);
        let ctx = RoutingContext::new();
        assert!(router.route_with(&"s0".into(), &ctx).unwrap().is_primary());

        let scope = ctx.push_scope(ConnectionIntent::Read);
        assert!(!router.route_with(&"s0".into(), &ctx).unwrap().is_primary());
        drop(scope);
        assert!(router.route_with(&"s0".into(), &ctx).unwrap().is_primary());
    }

    #[tokio::test]
    async fn test_ambient_routing() {
        let router = router(ReplicaSelectionStrategy::RoundRobin);
        let read = with_intent(ConnectionIntent::Read, async {
            router.route_ambient(&"s0".into()).map(|e| e.is_primary())
        })
        .await
        .unwrap();
        assert!(!read);
        assert!(router.route_ambient(&"s0".into()).unwrap().is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_report_excludes_replica() {
        let router = router(ReplicaSelectionStrategy::RoundRobin);
        let endpoint = router.route(&"s0".into(), ConnectionIntent::Read).unwrap();
        let failed = endpoint.address().to_string();
        router.report_failure(&endpoint);
        drop(endpoint);

        for _ in 0..4 {
            let next = router.route(&"s0".into(), ConnectionIntent::Read).unwrap();
            assert_ne!(next.address(), failed);
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        let recovered: Vec<String> = (0..2)
            .map(|_| {
                router
                    .route(&"s0".into(), ConnectionIntent::Read)
                    .unwrap()
                    .address()
                    .to_string()
            })
            .collect();
        assert!(recovered.contains(&failed));
    }

    #[test]
    fn test_lease_released_when_endpoint_dropped() {
        let router = router(ReplicaSelectionStrategy::LeastConnections);
        let endpoint = router.route(&"s0".into(), ConnectionIntent::Read).unwrap();
        let leased = Arc::clone(endpoint.lease.endpoint());
        assert_eq!(leased.active_leases(), 1);
        drop(endpoint);
        assert_eq!(leased.active_leases(), 0);
    }
}
