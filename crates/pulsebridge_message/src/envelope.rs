//! Message envelopes
//!
//! `Envelope` is what an application hands to a producer. `Message` is what a
//! consumer receives back: the envelope plus everything the broker stamped on
//! it (id, topic, publish time, resolved delivery time, redelivery count).
//!
//! Notes on fields:
//! - `properties`: free-form string metadata; insertion order is irrelevant
//! - `partition_key`: decides the partition on partitioned topics when no
//!   ordering key is set
//! - `ordering_key`: groups messages whose relative order must be kept; when
//!   present it decides both the partition and the Key_Shared routing, so all
//!   messages sharing it stay on one partition
//! - `delivery`: scheduled delivery, passed through to the broker untouched
//! - `sequence_id`: assigned by the producer, monotonically increasing

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// When a message becomes visible to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliverySchedule {
    /// Absolute time, epoch milliseconds.
    At(i64),
    /// Relative to the broker's publish time, milliseconds.
    After(u64),
}

impl DeliverySchedule {
    /// Resolve to an absolute epoch-millisecond timestamp.
    pub fn resolve(&self, publish_time: i64) -> i64 {
        match *self {
            DeliverySchedule::At(at) => at,
            DeliverySchedule::After(delay) => {
                publish_time.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<String>,
    pub event_time: Option<i64>,
    pub delivery: Option<DeliverySchedule>,
    pub sequence_id: Option<u64>,
}

impl Envelope {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.properties
            .extend(properties.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_event_time(mut self, millis: i64) -> Self {
        self.event_time = Some(millis);
        self
    }

    /// Hold the message until the given epoch-millisecond timestamp.
    pub fn deliver_at(mut self, millis: i64) -> Self {
        self.delivery = Some(DeliverySchedule::At(millis));
        self
    }

    /// Hold the message for `delay` after the broker accepts it.
    pub fn deliver_after(mut self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delivery = Some(DeliverySchedule::After(millis));
        self
    }

    /// Key used for partition routing: the ordering key, else the partition
    /// key. Matches `Message::key` so a key's partition and its Key_Shared
    /// consumer agree.
    pub fn routing_key(&self) -> Option<&str> {
        self.ordering_key
            .as_deref()
            .or(self.partition_key.as_deref())
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<String>,
    pub event_time: Option<i64>,
    pub publish_time: i64,
    pub deliver_at: Option<i64>,
    pub sequence_id: u64,
    pub producer_name: String,
    pub redelivery_count: u32,
}

impl Message {
    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Key used for Key_Shared routing: the ordering key, else the partition key.
    pub fn key(&self) -> Option<&str> {
        self.ordering_key
            .as_deref()
            .or(self.partition_key.as_deref())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
