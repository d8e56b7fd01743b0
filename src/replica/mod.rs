//! Replica selection, health tracking and read/write routing.
//!
//! ```text
//!   RoutingContext ──intent──▶ ReadWriteRouter
//!                                 │
//!                Write/ForceWrite │ Read
//!                    ┌────────────┴────────────┐
//!                    ▼                         ▼
//!               primary lease          ReplicaSelector
//!                                  (round-robin / random /
//!                                    least-connections)
//!                                              │
//!                                              ▼
//!                                   ReplicaHealthTracker
//! ```

pub mod context;
pub mod health;
pub mod read_write;
pub mod selector;

pub use context::{with_intent, ConnectionIntent, RoutingContext, RoutingScope};
pub use health::{EndpointStatus, HealthState, ReplicaHealthTracker};
pub use read_write::{ReadWriteRouter, RoutedEndpoint};
pub use selector::{
    build_selector, LeastConnectionsSelector, RandomSelector, ReplicaEndpoint, ReplicaLease,
    ReplicaSelector, ReplicaSet, RoundRobinSelector,
};
