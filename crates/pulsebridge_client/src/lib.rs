//! pulsebridge_client
//!
//! Client core for a Pulsar-style broker:
//!
//! - `ConnectionManager` / `Connection`: pooled, cancellable broker sessions
//!   with reconnect backoff
//! - `Producer`: ordered publishing with retries, optional batching and
//!   partition routing
//! - `Consumer`: subscriptions (exclusive, shared, failover, key-shared)
//!   with flow control, ack timeouts and negative acks
//! - `DeliveryTracker`: bookkeeping for messages awaiting acknowledgment
//!
//! Broker I/O goes through the `Transport` trait. `LoopbackConnector` serves
//! endpoints from in-process `pulsebridge_broker` instances.

pub mod auth;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod router;
pub mod tracker;
pub mod transport;

pub use auth::Authentication;
pub use connection::{Connection, ConnectionManager, ConnectionOptions, ReconnectPolicy, parse_endpoint};
pub use consumer::{
    Consumer, ConsumerConfig, ConsumerState, Disposition, ListenerHandle, MessageHandler,
};
pub use error::{
    ConnectionError, DeliveryError, Error, Result, SerializationError, SubscriptionError,
    TopicResolutionError,
};
pub use producer::{BatchingConfig, Producer, ProducerConfig, SendReceipt};
pub use router::{MessageRouter, RoutingMode};
pub use tracker::DeliveryTracker;
pub use transport::{Connector, LoopbackConnector, LoopbackTransport, Transport};

pub use pulsebridge_message::{
    DeliverySchedule, Envelope, InitialPosition, Message, MessageId, SubscriptionType,
};

#[cfg(test)]
mod tests;
