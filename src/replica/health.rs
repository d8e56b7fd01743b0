//! Per-endpoint health tracking with timed recovery.
//!
//! ```text
//! Healthy ──failure──▶ Unhealthy ──recovery_delay elapsed──▶ Healthy (tentative)
//!    ▲                    ▲                                      │
//!    │                    └──────────────failure─────────────────┤
//!    └───────────────────────────success─────────────────────────┘
//! ```
//!
//! There is no active probing: an endpoint becomes selectable again once the
//! delay has passed since its last failure, and the next use either confirms
//! it (`report_success`) or excludes it again (`report_failure`).

use super::selector::ReplicaEndpoint;
use crate::config::ReplicaConfig;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Health of a replica endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Point-in-time view of an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    /// Connection descriptor.
    pub address: String,
    /// Leases currently held.
    pub active_leases: usize,
    /// Health as seen by selectors right now.
    pub state: HealthState,
    /// Time of the most recent unconfirmed failure.
    pub last_failure_at: Option<Instant>,
}

/// Tracks endpoint health. The only component that changes health state.
#[derive(Debug)]
pub struct ReplicaHealthTracker {
    recovery_delay: Duration,

    /// Endpoint address -> time of last failure. Absent means healthy.
    failures: DashMap<String, Instant>,
}

impl ReplicaHealthTracker {
    /// Create a tracker with the given recovery delay.
    pub fn new(recovery_delay: Duration) -> Self {
        Self {
            recovery_delay,
            failures: DashMap::new(),
        }
    }

    /// Create a tracker from replica configuration.
    pub fn from_config(config: &ReplicaConfig) -> Self {
        Self::new(config.recovery_delay)
    }

    /// The configured recovery delay.
    pub fn recovery_delay(&self) -> Duration {
        self.recovery_delay
    }

    /// Mark an endpoint unhealthy as of now.
    pub fn report_failure(&self, address: &str) {
        let now = Instant::now();
        if self.failures.insert(address.to_string(), now).is_none() {
            tracing::warn!(
                endpoint = address,
                recovery_delay_ms = self.recovery_delay.as_millis() as u64,
                "Replica marked unhealthy"
            );
        } else {
            tracing::debug!(endpoint = address, "Replica failure refreshed");
        }
    }

    /// Confirm an endpoint works, clearing any failure record.
    pub fn report_success(&self, address: &str) {
        if self.failures.remove(address).is_some() {
            tracing::info!(endpoint = address, "Replica recovered");
        }
    }

    /// Whether selectors may use the endpoint.
    pub fn is_healthy(&self, address: &str) -> bool {
        match self.failures.get(address) {
            Some(failed_at) => failed_at.elapsed() >= self.recovery_delay,
            None => true,
        }
    }

    /// Current health state.
    pub fn state(&self, address: &str) -> HealthState {
        if self.is_healthy(address) {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }

    /// Time of the most recent unconfirmed failure.
    pub fn last_failure_at(&self, address: &str) -> Option<Instant> {
        self.failures.get(address).map(|at| *at)
    }

    /// Snapshot of an endpoint's lease count and health.
    pub fn status(&self, endpoint: &ReplicaEndpoint) -> EndpointStatus {
        EndpointStatus {
            address: endpoint.address().to_string(),
            active_leases: endpoint.active_leases(),
            state: self.state(endpoint.address()),
            last_failure_at: self.last_failure_at(endpoint.address()),
        }
    }

    /// Endpoints currently excluded from selection.
    pub fn unhealthy_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .failures
            .iter()
            .filter(|entry| entry.value().elapsed() < self.recovery_delay)
            .map(|entry| entry.key().clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// Forget all failures.
    pub fn reset(&self) {
        self.failures.clear();
    }
}
