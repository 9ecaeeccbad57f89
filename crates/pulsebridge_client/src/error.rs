//! Client error taxonomy.
//!
//! Broker answers arrive as `ServerError` codes and are folded into these
//! variants; callers match on the outer `Error` to decide whether a failure is
//! per message (serialization, delivery) or aborts the operation.

use std::time::Duration;

use pulsebridge_message::{ServerError, TopicError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    TopicResolution(#[from] TopicResolutionError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("operation cancelled: connection closed")]
    Cancelled,
    #[error("{0} is closed")]
    Closed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid service url '{0}'")]
    InvalidUrl(String),
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("session lost")]
    Disconnected,
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicResolutionError {
    #[error("invalid topic: {0}")]
    Invalid(String),
    #[error("topic not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("producer name '{0}' is already in use on the topic")]
    ProducerBusy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializationError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("broker rejected the message: {0}")]
    Rejected(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("send failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("incompatible subscription type: {0}")]
    IncompatibleType(String),
    #[error("exclusive subscription '{0}' already has a consumer")]
    ConsumerBusy(String),
    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::AuthenticationFailed(reason) => ConnectionError::AuthRejected(reason).into(),
            ServerError::AuthorizationFailed(reason) => {
                TopicResolutionError::Unauthorized(reason).into()
            }
            ServerError::TopicNotFound(topic) => TopicResolutionError::NotFound(topic).into(),
            ServerError::InvalidTopic(reason) => TopicResolutionError::Invalid(reason).into(),
            ServerError::ProducerBusy(name) => TopicResolutionError::ProducerBusy(name).into(),
            ServerError::ConsumerBusy(subscription) => {
                SubscriptionError::ConsumerBusy(subscription).into()
            }
            e @ ServerError::IncompatibleSubscription { .. } => {
                SubscriptionError::IncompatibleType(e.to_string()).into()
            }
            ServerError::InvalidConfiguration(reason) => {
                SubscriptionError::InvalidConfig(reason).into()
            }
            ServerError::MessageTooLarge { size, max } => {
                SerializationError::PayloadTooLarge { size, max }.into()
            }
            ServerError::UnknownProducer(_)
            | ServerError::UnknownConsumer(_)
            | ServerError::SessionClosed => ConnectionError::Disconnected.into(),
            ServerError::ServiceUnavailable => {
                ConnectionError::Unreachable("service unavailable".to_string()).into()
            }
        }
    }
}

impl From<TopicError> for Error {
    fn from(err: TopicError) -> Self {
        match err {
            TopicError::NoTopic => SubscriptionError::InvalidConfig(err.to_string()).into(),
            other => TopicResolutionError::Invalid(other.to_string()).into(),
        }
    }
}

/// Outcome of a transport call raced against cancellation and a timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum CallError {
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl From<CallError> for Error {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Cancelled => Error::Cancelled,
            CallError::TimedOut(after) => ConnectionError::Timeout(after).into(),
            CallError::Server(e) => e.into(),
        }
    }
}
