//! Requests and responses exchanged with a broker session.
//!
//! These mirror the commands of a broker wire protocol (connect, producer,
//! send, subscribe, flow, ack, redeliver) without fixing an encoding; a
//! transport decides how they travel.

use std::collections::HashMap;

use crate::envelope::Envelope;
use crate::subscription::{InitialPosition, SubscriptionType};
use crate::topic::TopicSelector;

pub type SessionId = u64;
pub type ProducerId = u64;
pub type ConsumerId = u64;

/// Credentials presented during the connect handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthData {
    /// Provider name: `none`, `token`, `basic`, `tls`, `oauth2`.
    pub method: String,
    pub data: String,
}

impl AuthData {
    pub fn anonymous() -> Self {
        Self {
            method: "none".to_string(),
            data: String::new(),
        }
    }
}

impl std::fmt::Debug for AuthData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthData")
            .field("method", &self.method)
            .field("data", &"<redacted>")
            .finish()
    }
}

/// Handshake result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub role: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRegistration {
    pub producer_id: ProducerId,
    pub producer_name: String,
    /// `0` for a non-partitioned topic.
    pub partitions: u32,
    /// Set when the producer was created on a `-partition-N` name; every
    /// message it sends goes to that partition.
    pub partition: Option<u32>,
    pub max_message_size: usize,
}

/// An envelope plus the partition the producer routed it to.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub partition: Option<u32>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub selector: TopicSelector,
    pub subscription: String,
    pub kind: SubscriptionType,
    pub initial_position: InitialPosition,
    pub read_compacted: bool,
    pub consumer_name: Option<String>,
    pub properties: HashMap<String, String>,
}
