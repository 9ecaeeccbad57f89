//! Producer sessions
//!
//! A `Producer` publishes to one topic. Sends on one producer are serialized
//! by its send lock, so with batching disabled every message reaches the
//! broker in call order, and with batching enabled batches are flushed in
//! order. Each message gets the next sequence id (starting at 0).
//!
//! A send is retried up to `max_send_retries` times. Errors that a fresh
//! session may cure (lost session, unknown producer) trigger a reconnect and
//! re-registration under the same producer name before the next attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use pulsebridge_config::ProducerSettings;
use pulsebridge_message::{Envelope, MessageId, ProducerRegistration, RoutedMessage, ServerError, TopicName};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{CallError, DeliveryError, Error, Result, SerializationError};
use crate::router::{MessageRouter, RoutingMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    pub max_messages: usize,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Broker-side producer name; generated when `None`.
    pub name: Option<String>,
    /// Per-attempt timeout.
    pub send_timeout: Duration,
    pub max_send_retries: u32,
    pub routing: RoutingMode,
    pub batching: Option<BatchingConfig>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            name: None,
            send_timeout: Duration::from_secs(30),
            max_send_retries: 3,
            routing: RoutingMode::RoundRobin,
            batching: None,
        }
    }
}

impl From<&ProducerSettings> for ProducerConfig {
    fn from(settings: &ProducerSettings) -> Self {
        Self {
            send_timeout: Duration::from_millis(settings.send_timeout_ms),
            max_send_retries: settings.max_send_retries,
            batching: settings.batching_enabled.then(|| BatchingConfig {
                max_messages: settings.batching_max_messages.max(1),
                max_delay: Duration::from_millis(settings.batching_max_publish_delay_ms.max(1)),
            }),
            ..Self::default()
        }
    }
}

impl ProducerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Resolves to the broker-assigned id once the message is stored.
#[derive(Debug)]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<MessageId>>,
}

impl SendReceipt {
    pub async fn wait(self) -> Result<MessageId> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

struct PendingSend {
    message: RoutedMessage,
    reply: oneshot::Sender<Result<MessageId>>,
}

struct SendState {
    router: MessageRouter,
    batch: Vec<PendingSend>,
}

struct ProducerInner {
    connection: Connection,
    topic: String,
    config: ProducerConfig,
    registration: Mutex<ProducerRegistration>,
    sequence: AtomicU64,
    send_lock: AsyncMutex<SendState>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.inner.topic)
            .field("registration", &*self.inner.registration())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Producer {
    pub(crate) async fn create(
        connection: Connection,
        topic: &str,
        config: ProducerConfig,
    ) -> Result<Producer> {
        TopicName::parse(topic)?;
        connection.ensure_connected().await?;
        let registration = connection
            .call(
                connection
                    .transport()
                    .create_producer(topic, config.name.as_deref()),
            )
            .await?;

        info!(
            topic,
            producer = %registration.producer_name,
            partitions = registration.partitions,
            "producer created"
        );

        let cancel = connection.cancel_token().child_token();
        let router = MessageRouter::new(config.routing, &registration.producer_name);
        let inner = Arc::new(ProducerInner {
            connection,
            topic: topic.to_string(),
            config,
            registration: Mutex::new(registration),
            sequence: AtomicU64::new(0),
            send_lock: AsyncMutex::new(SendState {
                router,
                batch: Vec::new(),
            }),
            cancel,
            closed: AtomicBool::new(false),
        });

        if let Some(batching) = &inner.config.batching {
            tokio::spawn(run_batch_timer(
                Arc::downgrade(&inner),
                batching.max_delay,
                inner.cancel.clone(),
            ));
        }

        Ok(Producer { inner })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn name(&self) -> String {
        self.inner.registration().producer_name.clone()
    }

    /// Partition count of the topic; `0` when not partitioned.
    pub fn partitions(&self) -> u32 {
        self.inner.registration().partitions
    }

    /// The partition this producer is bound to when it was created on a
    /// `-partition-N` name.
    pub fn partition(&self) -> Option<u32> {
        self.inner.registration().partition
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Publish and wait for the broker-assigned id.
    pub async fn send(&self, envelope: Envelope) -> Result<MessageId> {
        self.send_async(envelope).await?.wait().await
    }

    /// Publish without waiting for a batch to flush. Returns once the message
    /// is buffered (batching) or stored (no batching).
    pub async fn send_async(&self, mut envelope: Envelope) -> Result<SendReceipt> {
        self.inner.ensure_open()?;

        let max = self.inner.registration().max_message_size;
        if envelope.payload.len() > max {
            return Err(SerializationError::PayloadTooLarge {
                size: envelope.payload.len(),
                max,
            }
            .into());
        }

        let mut state = self.inner.send_lock.lock().await;
        self.inner.ensure_open()?;

        let sequence_id = self.inner.sequence.fetch_add(1, Ordering::AcqRel);
        envelope.sequence_id = Some(sequence_id);
        let (partitions, bound) = {
            let registration = self.inner.registration();
            (registration.partitions, registration.partition)
        };
        let partition = bound.or_else(|| state.router.route(envelope.routing_key(), partitions));
        let message = RoutedMessage {
            partition,
            envelope,
        };

        let (reply, rx) = oneshot::channel();
        match &self.inner.config.batching {
            Some(batching) => {
                state.batch.push(PendingSend { message, reply });
                if state.batch.len() >= batching.max_messages {
                    self.inner.flush_batch(&mut state).await;
                }
            }
            None => {
                let result = self
                    .inner
                    .deliver(vec![message])
                    .await
                    .and_then(|ids| {
                        ids.into_iter()
                            .next()
                            .ok_or_else(|| DeliveryError::Rejected("no id returned".to_string()).into())
                    });
                let _ = reply.send(result);
            }
        }
        debug!(topic = %self.inner.topic, sequence_id, ?partition, "message queued");
        Ok(SendReceipt { rx })
    }

    /// Send everything currently buffered.
    pub async fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.send_lock.lock().await;
        self.inner.flush_batch(&mut state).await;
        Ok(())
    }

    /// Flush, then unregister broker-side. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.inner.send_lock.lock().await;
            self.inner.flush_batch(&mut state).await;
        }
        self.inner.cancel.cancel();

        let (producer_id, name) = {
            let registration = self.inner.registration();
            (registration.producer_id, registration.producer_name.clone())
        };
        let connection = &self.inner.connection;
        match connection
            .call(connection.transport().close_producer(producer_id))
            .await
        {
            Ok(()) | Err(CallError::Cancelled) => {}
            Err(e) => warn!(producer = %name, error = %e, "failed to unregister producer"),
        }
        info!(producer = %name, topic = %self.inner.topic, "producer closed");
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let (producer_id, name) = {
            let registration = self.inner.registration();
            (registration.producer_id, registration.producer_name.clone())
        };
        warn!(producer = %name, "producer dropped without close");

        let connection = self.inner.connection.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = connection
                    .call(connection.transport().close_producer(producer_id))
                    .await;
            });
        }
    }
}

impl ProducerInner {
    fn registration(&self) -> MutexGuard<'_, ProducerRegistration> {
        self.registration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connection.is_closed() {
            return Err(Error::Cancelled);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("producer"));
        }
        Ok(())
    }

    async fn flush_batch(&self, state: &mut SendState) {
        if state.batch.is_empty() {
            return;
        }
        let (messages, replies): (Vec<RoutedMessage>, Vec<_>) = std::mem::take(&mut state.batch)
            .into_iter()
            .map(|pending| (pending.message, pending.reply))
            .unzip();
        debug!(topic = %self.topic, size = messages.len(), "flushing batch");

        match self.deliver(messages).await {
            Ok(ids) => {
                for (reply, id) in replies.into_iter().zip(ids) {
                    let _ = reply.send(Ok(id));
                }
            }
            Err(e) => {
                for reply in replies {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }

    /// Send with retries. The caller holds the send lock.
    async fn deliver(&self, messages: Vec<RoutedMessage>) -> Result<Vec<MessageId>> {
        let attempts = self.config.max_send_retries.saturating_add(1);
        let mut last = String::new();
        let mut timed_out = false;

        for attempt in 1..=attempts {
            let producer_id = self.registration().producer_id;
            let transport = self.connection.transport();
            let result = self
                .connection
                .call_with_timeout(
                    self.config.send_timeout,
                    transport.send(producer_id, messages.clone()),
                )
                .await;

            match result {
                Ok(ids) => return Ok(ids),
                Err(CallError::Cancelled) => return Err(Error::Cancelled),
                Err(CallError::Server(ServerError::MessageTooLarge { size, max })) => {
                    return Err(SerializationError::PayloadTooLarge { size, max }.into());
                }
                Err(CallError::Server(e)) if e.is_retryable() => {
                    warn!(topic = %self.topic, attempt, error = %e, "send failed, re-registering");
                    timed_out = false;
                    last = e.to_string();
                    if attempt < attempts {
                        self.reregister().await?;
                    }
                }
                Err(CallError::Server(e)) => {
                    return Err(DeliveryError::Rejected(e.to_string()).into());
                }
                Err(e @ CallError::TimedOut(_)) => {
                    warn!(topic = %self.topic, attempt, "send timed out");
                    timed_out = true;
                    last = e.to_string();
                }
            }
        }

        if timed_out && attempts == 1 {
            return Err(DeliveryError::Timeout(self.config.send_timeout).into());
        }
        Err(DeliveryError::RetriesExhausted { attempts, last }.into())
    }

    /// Re-establish the session if needed and register again under the same
    /// producer name.
    async fn reregister(&self) -> Result<()> {
        self.connection.ensure_connected().await?;
        let name = self.registration().producer_name.clone();
        let registration = self
            .connection
            .call(
                self.connection
                    .transport()
                    .create_producer(&self.topic, Some(&name)),
            )
            .await?;
        info!(producer = %name, id = registration.producer_id, "producer re-registered");
        *self.registration() = registration;
        Ok(())
    }
}

async fn run_batch_timer(inner: Weak<ProducerInner>, max_delay: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(max_delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut state = inner.send_lock.lock().await;
        inner.flush_batch(&mut state).await;
    }
}
