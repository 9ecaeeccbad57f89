//! pulsebridge_broker
//!
//! An in-process broker model the client core can run against. It keeps
//! topics, partitions, subscription cursors, flow-control permits, scheduled
//! delivery and redelivery in memory; there is no storage layer and no
//! cluster coordination.
//!
//! Public types:
//! - `Broker`: the synchronous engine (sessions, topics, producers, consumers)
//! - `BrokerHandle`: shared `Arc<Mutex<Broker>>` handle plus the dispatch loop
//! - `BrokerConfig` / `AuthPolicy`: what the broker accepts
//!
//! The loopback transport in `pulsebridge_client` talks to a `BrokerHandle`
//! directly; nothing here performs network I/O.

pub mod auth;
pub mod engine;
pub mod subscription;
pub mod topic;

pub use auth::{AuthPolicy, Claims, issue_token};
pub use engine::{Broker, BrokerConfig, BrokerHandle};
pub use subscription::SubscriptionStats;
