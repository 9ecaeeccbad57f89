use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pulsebridge_message::Message;
use pulsebridge_utils::clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a trigger emits for each consumed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    pub message: Value,
    #[serde(alias = "headers", default)]
    pub properties: HashMap<String, String>,
    pub topic: String,
    pub message_id: String,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub publish_timestamp: Option<DateTime<Utc>>,
    pub redelivery_count: u32,
}

impl TriggerRecord {
    pub fn from_message(message: &Message, json_parse: bool) -> Self {
        Self {
            message: decode_body(&message.payload, json_parse),
            properties: message.properties.clone(),
            topic: message.topic.clone(),
            message_id: message.id.to_string(),
            event_timestamp: message.event_time.and_then(clock::to_datetime),
            publish_timestamp: clock::to_datetime(message.publish_time),
            redelivery_count: message.redelivery_count,
        }
    }
}

/// Decode a payload for a record. With `json_parse` a JSON body becomes the
/// parsed value; anything else (or no parsing) stays a string.
pub fn decode_body(payload: &[u8], json_parse: bool) -> Value {
    let text = String::from_utf8_lossy(payload);
    if json_parse {
        if let Ok(value) = serde_json::from_str(&text) {
            return value;
        }
    }
    Value::String(text.into_owned())
}
