//! Publish entry point.

use std::collections::HashMap;
use std::time::Duration;

use pulsebridge_client::{
    Connection, Envelope, Error, ProducerConfig, Result, SerializationError, TopicResolutionError,
};
use pulsebridge_message::TopicName;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Payload bytes are the message text as given.
    #[default]
    Raw,
    /// The message text must be JSON; it is re-serialized compactly.
    Json,
}

/// One message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishItem {
    pub topic: String,
    pub producer_name: Option<String>,
    pub format: MessageFormat,
    pub message: String,
    pub properties: HashMap<String, String>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<String>,
    pub delivery_delay_ms: Option<u64>,
}

impl PublishItem {
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        match self.format {
            MessageFormat::Raw => Ok(self.message.clone().into_bytes()),
            MessageFormat::Json => {
                let value: serde_json::Value = serde_json::from_str(&self.message)
                    .map_err(|e| SerializationError::InvalidJson(e.to_string()))?;
                serde_json::to_vec(&value)
                    .map_err(|e| SerializationError::InvalidJson(e.to_string()).into())
            }
        }
    }

    fn envelope(&self) -> Result<Envelope> {
        let mut envelope = Envelope::new(self.payload()?).with_properties(self.properties.clone());
        if let Some(key) = &self.partition_key {
            envelope = envelope.with_partition_key(key.clone());
        }
        if let Some(key) = &self.ordering_key {
            envelope = envelope.with_ordering_key(key.clone());
        }
        if let Some(delay) = self.delivery_delay_ms.filter(|d| *d > 0) {
            envelope = envelope.deliver_after(Duration::from_millis(delay));
        }
        Ok(envelope)
    }
}

/// Result for one item, serialized as `{"success":true,"messageId":…}` or
/// `{"success":false,"error":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl PublishOutcome {
    fn sent(id: impl ToString) -> Self {
        Self {
            success: true,
            message_id: Some(id.to_string()),
            error: None,
        }
    }

    fn failed(err: &Error) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(err.to_string()),
        }
    }
}

/// Errors that end the whole call instead of a single item.
fn aborts(err: &Error) -> bool {
    matches!(err, Error::Connection(_) | Error::Cancelled | Error::Closed(_))
}

fn same_topic(target: &TopicName, topic: &str) -> Result<()> {
    if TopicName::parse(topic).is_ok_and(|name| name == *target) {
        Ok(())
    } else {
        Err(TopicResolutionError::Invalid(format!(
            "'{topic}' differs from the producer's topic {target}"
        ))
        .into())
    }
}

/// Producer name with a random suffix so repeated runs do not collide.
fn unique_name(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{name}-{}", &suffix[..5])
}

#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Connection,
    config: ProducerConfig,
}

impl Publisher {
    pub fn new(connection: Connection, config: ProducerConfig) -> Self {
        Self { connection, config }
    }

    /// Publish `items` through one producer on the first item's topic. Items
    /// naming another topic fail on their own without being sent.
    pub async fn publish(&self, items: &[PublishItem]) -> Result<Vec<PublishOutcome>> {
        let Some(first) = items.first() else {
            return Ok(Vec::new());
        };
        let target = TopicName::parse(&first.topic)?;

        let mut config = self.config.clone();
        config.name = first
            .producer_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(unique_name);
        let producer = self.connection.create_producer(&first.topic, config).await?;
        info!(topic = %first.topic, producer = %producer.name(), items = items.len(), "publishing");

        let mut outcomes = Vec::with_capacity(items.len());
        let mut aborted = None;
        for (index, item) in items.iter().enumerate() {
            let sent = match same_topic(&target, &item.topic).and_then(|()| item.envelope()) {
                Ok(envelope) => producer.send(envelope).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(id) => {
                    debug!(index, message_id = %id, "item published");
                    outcomes.push(PublishOutcome::sent(id));
                }
                Err(e) if aborts(&e) => {
                    aborted = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(index, error = %e, "item not published");
                    outcomes.push(PublishOutcome::failed(&e));
                }
            }
        }

        producer.close().await;
        match aborted {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}
