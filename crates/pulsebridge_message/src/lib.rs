//! pulsebridge_message
//!
//! Types shared by the client core and the loopback broker:
//!
//! - `Envelope` / `Message`: the outbound and received forms of a message
//! - `MessageId`: broker-assigned, totally ordered identifier
//! - `TopicName`, `TopicPattern`, `TopicSelector`: topic addressing
//! - `SubscriptionType`, `InitialPosition`: subscription semantics
//! - `protocol`: request/response shapes exchanged with a broker session
//! - `ServerError`: error codes a broker answers with

pub mod envelope;
pub mod error;
pub mod id;
pub mod protocol;
pub mod routing;
pub mod subscription;
pub mod topic;

pub use envelope::{DeliverySchedule, Envelope, Message};
pub use error::ServerError;
pub use id::MessageId;
pub use protocol::{
    AuthData, ConsumerId, ProducerId, ProducerRegistration, RoutedMessage, SessionId,
    SessionInfo, SubscribeRequest,
};
pub use subscription::{InitialPosition, SubscriptionType};
pub use topic::{TopicDomain, TopicError, TopicName, TopicPattern, TopicSelector};

#[cfg(test)]
mod tests;
