//! Test doubles for the connection collaborator.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          InMemoryConnectionFactory           │
//! │  shard id ──▶ FakeShard                      │
//! │    - records statements                      │
//! │    - scripted reader responses               │
//! │    - injected failures, latency, outages     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use shardwise::testing::{memory_topology, InMemoryConnectionFactory};
//!
//! let topology = memory_topology(&["s0", "s1", "s2"])?;
//! let factory = InMemoryConnectionFactory::for_topology(&topology);
//! factory.set_unreachable("s1", true);
//! ```

mod connections;


pub use connections::{memory_topology, FakeShard, InMemoryConnectionFactory, RecordingConnection};
