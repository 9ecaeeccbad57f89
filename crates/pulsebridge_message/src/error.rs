//! Error codes a broker session answers with.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("not authorized: {0}")]
    AuthorizationFailed(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("producer '{0}' is already connected to the topic")]
    ProducerBusy(String),
    #[error("exclusive subscription '{0}' already has a consumer")]
    ConsumerBusy(String),
    #[error("subscription '{subscription}' is {existing}, cannot attach as {requested}")]
    IncompatibleSubscription {
        subscription: String,
        existing: String,
        requested: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("unknown producer {0}")]
    UnknownProducer(u64),
    #[error("unknown consumer {0}")]
    UnknownConsumer(u64),
    #[error("session closed")]
    SessionClosed,
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl ServerError {
    /// Errors that a fresh session (and re-registration) may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::SessionClosed
                | ServerError::ServiceUnavailable
                | ServerError::UnknownProducer(_)
                | ServerError::UnknownConsumer(_)
        )
    }
}
