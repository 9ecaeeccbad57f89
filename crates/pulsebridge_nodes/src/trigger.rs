//! Trigger entry point
//!
//! A `Trigger` owns one consumer and its listener. Every message becomes a
//! `TriggerRecord` handed to the `RecordSink`; the message is acknowledged
//! when the sink accepts it and negatively acknowledged otherwise.
//!
//! If the consumer gives up (reconnecting failed, connection closed) the sink
//! is told through `RecordSink::on_error` and the trigger stops counting as
//! running; `start()` subscribes again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulsebridge_client::{
    Connection, Consumer, ConsumerConfig, Disposition, Error, ListenerHandle, MessageHandler,
    Result,
};
use pulsebridge_message::{InitialPosition, Message, SubscriptionType};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::record::TriggerRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConfig {
    pub subscription_name: String,
    pub topic: Option<String>,
    pub topics: Vec<String>,
    pub topic_pattern: Option<String>,
    pub subscription_type: SubscriptionType,
    pub receiver_queue_size: u32,
    /// Cap on the total receiver queue across partitions and topics.
    pub receiver_queue_size_across_partitions: u32,
    /// `0` disables ack-timeout redelivery.
    pub ack_timeout_ms: u64,
    pub initial_position: InitialPosition,
    pub read_compacted: bool,
    pub json_parse_message: bool,
    pub consumer_name: Option<String>,
    pub nack_redeliver_timeout_ms: u64,
    pub properties: HashMap<String, String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            subscription_name: String::new(),
            topic: None,
            topics: Vec::new(),
            topic_pattern: None,
            subscription_type: SubscriptionType::Exclusive,
            receiver_queue_size: 1000,
            receiver_queue_size_across_partitions: 50_000,
            ack_timeout_ms: 1000,
            initial_position: InitialPosition::Earliest,
            read_compacted: false,
            json_parse_message: true,
            consumer_name: None,
            nack_redeliver_timeout_ms: 0,
            properties: HashMap::new(),
        }
    }
}

impl TriggerConfig {
    pub fn new(topic: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            subscription_name: subscription_name.into(),
            ..Self::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.topic.clone(),
            topics: self.topics.clone(),
            topic_pattern: self.topic_pattern.clone(),
            subscription: self.subscription_name.clone(),
            kind: self.subscription_type,
            initial_position: self.initial_position,
            read_compacted: self.read_compacted,
            consumer_name: self.consumer_name.clone(),
            receiver_queue_size: self.receiver_queue_size,
            max_total_receiver_queue_size_across_partitions: self
                .receiver_queue_size_across_partitions,
            ack_timeout: (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms)),
            nack_redelivery_delay: Duration::from_millis(self.nack_redeliver_timeout_ms),
            properties: self.properties.clone(),
            ..ConsumerConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("emit failed: {0}")]
pub struct EmitError(pub String);

/// Destination for trigger records.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn emit(&self, record: TriggerRecord) -> Result<(), EmitError>;

    /// The trigger stopped receiving because of `error`.
    async fn on_error(&self, error: Error) {
        let _ = error;
    }
}

struct SinkHandler<S> {
    sink: Arc<S>,
    json_parse: bool,
}

#[async_trait]
impl<S: RecordSink> MessageHandler for SinkHandler<S> {
    async fn handle(&self, message: Message) -> Disposition {
        let record = TriggerRecord::from_message(&message, self.json_parse);
        match self.sink.emit(record).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "record rejected by sink");
                Disposition::Nack
            }
        }
    }

    async fn on_error(&self, error: Error) {
        self.sink.on_error(error).await;
    }
}

struct Running {
    consumer: Consumer,
    listener: ListenerHandle,
}

pub struct Trigger<S> {
    connection: Connection,
    config: TriggerConfig,
    sink: Arc<S>,
    running: Mutex<Option<Running>>,
}

impl<S: RecordSink> Trigger<S> {
    pub fn new(connection: Connection, config: TriggerConfig, sink: Arc<S>) -> Self {
        Self {
            connection,
            config,
            sink,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Subscribe and start emitting. Calling it again while running is a
    /// no-op; after the listener ended on an error it subscribes again.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(current) if !current.listener.is_finished() => {
                *running = Some(current);
                return Ok(());
            }
            Some(Running { consumer, .. }) => consumer.close().await,
            None => {}
        }

        let consumer = self.connection.subscribe(self.config.consumer_config()).await?;
        let handler = SinkHandler {
            sink: self.sink.clone(),
            json_parse: self.config.json_parse_message,
        };
        let listener = match consumer.listen(handler) {
            Ok(listener) => listener,
            Err(e) => {
                consumer.close().await;
                return Err(e);
            }
        };
        info!(subscription = %self.config.subscription_name, "trigger started");
        *running = Some(Running { consumer, listener });
        Ok(())
    }

    /// Stop the listener and close the consumer. A no-op when not running.
    pub async fn stop(&self) {
        let Some(Running { consumer, listener }) = self.running.lock().await.take() else {
            return;
        };
        listener.stop().await;
        consumer.close().await;
        info!(subscription = %self.config.subscription_name, "trigger stopped");
    }

    /// Whether the listener is still delivering records.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.listener.is_finished())
    }
}
