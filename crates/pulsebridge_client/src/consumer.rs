//! Consumer sessions
//!
//! A `Consumer` reads one subscription over a topic, a topic list or a topic
//! pattern. Messages are pulled with `receive()` or pushed to a
//! `MessageHandler` with `listen()`.
//!
//! Moving parts:
//! - a pump task forwards broker deliveries into a local queue, stamped with
//!   the current subscription epoch, and runs the ack-timeout sweep every
//!   `tick_interval`
//! - the `DeliveryTracker` holds every message handed out and not yet
//!   acknowledged
//! - flow permits are granted up front (`receiver_queue_size`, capped by
//!   `max_total_receiver_queue_size_across_partitions`) and returned in chunks
//!   of half the queue as messages leave the in-flight state
//!
//! When the delivery channel closes (session lost) the pump reconnects,
//! resubscribes and bumps the epoch so messages queued under the old
//! subscription are dropped; the broker redelivers whatever was unacked.
//!
//! State machine:
//! `Created -> Subscribing -> Active -> Draining -> Closed`, with
//! `Active -> Failed -> Subscribing` around a reconnect. A failed reconnect
//! leaves the consumer `Failed` and `receive()` returns the error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pulsebridge_config::ConsumerSettings;
use pulsebridge_message::{
    ConsumerId, InitialPosition, Message, MessageId, SubscribeRequest, SubscriptionType,
    TopicSelector,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{CallError, Error, Result, SubscriptionError};
use crate::tracker::DeliveryTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub topic: Option<String>,
    pub topics: Vec<String>,
    /// Takes precedence over `topics`, which takes precedence over `topic`.
    pub topic_pattern: Option<String>,
    pub subscription: String,
    pub kind: SubscriptionType,
    pub initial_position: InitialPosition,
    pub read_compacted: bool,
    pub consumer_name: Option<String>,
    pub receiver_queue_size: u32,
    /// Upper bound on permits outstanding across every partition and topic
    /// the consumer reads.
    pub max_total_receiver_queue_size_across_partitions: u32,
    /// `None` disables ack-timeout redelivery.
    pub ack_timeout: Option<Duration>,
    pub nack_redelivery_delay: Duration,
    pub tick_interval: Duration,
    pub properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: None,
            topics: Vec::new(),
            topic_pattern: None,
            subscription: String::new(),
            kind: SubscriptionType::Exclusive,
            initial_position: InitialPosition::Earliest,
            read_compacted: false,
            consumer_name: None,
            receiver_queue_size: 1000,
            max_total_receiver_queue_size_across_partitions: 50_000,
            ack_timeout: Some(Duration::from_millis(1000)),
            nack_redelivery_delay: Duration::ZERO,
            tick_interval: Duration::from_millis(100),
            properties: HashMap::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            subscription: subscription.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: SubscriptionType) -> Self {
        self.kind = kind;
        self
    }

    /// Take queue size, timeouts and tick from configuration.
    pub fn apply_settings(mut self, settings: &ConsumerSettings) -> Self {
        self.receiver_queue_size = settings.receiver_queue_size;
        self.max_total_receiver_queue_size_across_partitions =
            settings.receiver_queue_size_across_partitions;
        self.ack_timeout =
            (settings.ack_timeout_ms > 0).then(|| Duration::from_millis(settings.ack_timeout_ms));
        self.nack_redelivery_delay = Duration::from_millis(settings.nack_redelivery_delay_ms);
        self.tick_interval = Duration::from_millis(settings.tick_interval_ms.max(1));
        self
    }

    /// Permits granted to the broker: the receiver queue, capped by the
    /// across-partitions total.
    pub fn effective_queue_size(&self) -> u32 {
        self.receiver_queue_size
            .min(self.max_total_receiver_queue_size_across_partitions)
    }

    /// Check the options and resolve the topic selector.
    pub fn validate(&self) -> Result<TopicSelector> {
        let invalid = |reason: String| -> Error { SubscriptionError::InvalidConfig(reason).into() };
        if self.subscription.trim().is_empty() {
            return Err(invalid("subscription name is empty".to_string()));
        }
        if self.receiver_queue_size == 0 {
            return Err(invalid("receiver_queue_size must be positive".to_string()));
        }
        if self.max_total_receiver_queue_size_across_partitions == 0 {
            return Err(invalid(
                "max_total_receiver_queue_size_across_partitions must be positive".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("tick_interval must be positive".to_string()));
        }
        if self.read_compacted && !self.kind.supports_read_compacted() {
            return Err(invalid(format!(
                "read_compacted is not allowed on {} subscriptions",
                self.kind
            )));
        }
        Ok(TopicSelector::from_parts(
            self.topic.as_deref(),
            &self.topics,
            self.topic_pattern.as_deref(),
        )?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Subscribing,
    Active,
    Draining,
    Closed,
    Failed,
}

impl ConsumerState {
    pub fn can_transition_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Created, Subscribing)
                | (Subscribing, Active)
                | (Subscribing, Failed)
                | (Active, Failed)
                | (Failed, Subscribing)
                | (Subscribing | Active | Failed, Draining)
                | (Draining, Closed)
        )
    }
}

/// What a handler decided about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Disposition;

    /// Called once when the listener ends because of `error` rather than
    /// `stop()` or `close()`, for example after reconnecting failed.
    async fn on_error(&self, error: Error) {
        let _ = error;
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Disposition> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Disposition {
        (self)(message).await
    }
}

struct Queued {
    epoch: u64,
    message: Message,
}

struct ConsumerInner {
    connection: Connection,
    config: ConsumerConfig,
    request: SubscribeRequest,
    consumer_id: AtomicU64,
    queue_tx: UnboundedSender<Queued>,
    queue_rx: AsyncMutex<UnboundedReceiver<Queued>>,
    epoch: AtomicU64,
    tracker: DeliveryTracker,
    released: AtomicU32,
    state: watch::Sender<ConsumerState>,
    fatal: Mutex<Option<Error>>,
    cancel: CancellationToken,
    listening: AtomicBool,
}

pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("subscription", &self.inner.config.subscription)
            .field("consumer_id", &self.inner.consumer_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Consumer {
    pub(crate) async fn subscribe(connection: Connection, config: ConsumerConfig) -> Result<Consumer> {
        let selector = config.validate()?;
        let request = SubscribeRequest {
            selector,
            subscription: config.subscription.clone(),
            kind: config.kind,
            initial_position: config.initial_position,
            read_compacted: config.read_compacted,
            consumer_name: config.consumer_name.clone(),
            properties: config.properties.clone(),
        };

        let (state, _) = watch::channel(ConsumerState::Created);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConsumerInner {
            cancel: connection.cancel_token().child_token(),
            connection,
            config,
            request,
            consumer_id: AtomicU64::new(0),
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            epoch: AtomicU64::new(0),
            tracker: DeliveryTracker::new(),
            released: AtomicU32::new(0),
            state,
            fatal: Mutex::new(None),
            listening: AtomicBool::new(false),
        });

        inner.transition(ConsumerState::Subscribing);
        inner.connection.ensure_connected().await?;
        let deliveries = inner.attach().await?;
        inner.transition(ConsumerState::Active);
        info!(
            consumer = inner.consumer_id(),
            subscription = %inner.config.subscription,
            kind = %inner.config.kind,
            topics = %inner.request.selector,
            "consumer subscribed"
        );

        tokio::spawn(run_pump(inner.clone(), deliveries));
        Ok(Consumer { inner })
    }

    pub fn subscription(&self) -> &str {
        &self.inner.config.subscription
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.inner.state.subscribe()
    }

    /// Messages handed out and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn redelivery_count(&self, id: &MessageId) -> Option<u32> {
        self.inner.tracker.redelivery_count(id)
    }

    /// Wait for the next message.
    pub async fn receive(&self) -> Result<Message> {
        self.inner.receive().await
    }

    pub async fn acknowledge(&self, id: MessageId) -> Result<()> {
        self.inner.acknowledge(id).await
    }

    pub async fn negative_acknowledge(&self, id: MessageId) -> Result<()> {
        self.inner.negative_acknowledge(id).await
    }

    /// Push messages to `handler` on a dedicated task, one at a time. Only
    /// one listener may run per consumer.
    pub fn listen<H>(&self, handler: H) -> Result<ListenerHandle>
    where
        H: MessageHandler + 'static,
    {
        self.inner.ensure_usable()?;
        if self.inner.listening.swap(true, Ordering::AcqRel) {
            return Err(SubscriptionError::InvalidConfig(
                "a listener is already attached".to_string(),
            )
            .into());
        }

        let cancel = self.inner.cancel.child_token();
        let task = tokio::spawn(run_listener(self.inner.clone(), handler, cancel.clone()));
        Ok(ListenerHandle { cancel, task })
    }

    /// Stop the listener and sweep, unregister broker-side. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if !self.inner.transition(ConsumerState::Draining) {
            return;
        }
        self.inner.cancel.cancel();
        let id = self.inner.consumer_id();
        warn!(consumer = id, "consumer dropped without close");

        let inner = self.inner.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let connection = &inner.connection;
                let _ = connection
                    .call(connection.transport().close_consumer(id))
                    .await;
                inner.tracker.clear();
                inner.transition(ConsumerState::Closed);
            });
        }
    }
}

/// Running listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop after the handler call in progress, if any, returns.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "listener task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl ConsumerInner {
    fn consumer_id(&self) -> ConsumerId {
        self.consumer_id.load(Ordering::Acquire)
    }

    fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConsumerState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = ?*current, to = ?next, "consumer state");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Record a fatal error and wake any receiver.
    fn fail(&self, err: Error) {
        error!(subscription = %self.config.subscription, error = %err, "consumer failed");
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.state.send_modify(|state| *state = ConsumerState::Failed);
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.connection.is_closed() {
            return Err(Error::Cancelled);
        }
        match self.state() {
            ConsumerState::Draining | ConsumerState::Closed => Err(Error::Closed("consumer")),
            _ => Ok(()),
        }
    }

    /// Errors that end a `receive()` wait.
    fn receive_error(&self) -> Option<Error> {
        if let Err(e) = self.ensure_usable() {
            return Some(e);
        }
        if self.state() == ConsumerState::Failed {
            return self
                .fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
        }
        None
    }

    /// Register with the broker and grant the full queue of permits.
    async fn attach(&self) -> Result<UnboundedReceiver<Message>> {
        let connection = &self.connection;
        let (id, deliveries) = connection
            .call(connection.transport().subscribe(self.request.clone()))
            .await?;
        self.consumer_id.store(id, Ordering::Release);
        if let Err(e) = connection
            .call(connection.transport().flow(id, self.config.effective_queue_size()))
            .await
        {
            let _ = connection.call(connection.transport().close_consumer(id)).await;
            return Err(e.into());
        }
        Ok(deliveries)
    }

    async fn receive(&self) -> Result<Message> {
        let mut queue = self.queue_rx.lock().await;
        let mut state_changes = self.state.subscribe();
        loop {
            if let Some(e) = self.receive_error() {
                return Err(e);
            }
            tokio::select! {
                biased;
                queued = queue.recv() => {
                    let Some(queued) = queued else {
                        return Err(Error::Closed("consumer"));
                    };
                    if queued.epoch != self.epoch.load(Ordering::Acquire) {
                        debug!(message_id = %queued.message.id, "dropping message from previous subscription");
                        continue;
                    }
                    let message = queued.message;
                    let deadline = self.config.ack_timeout.map(|timeout| Instant::now() + timeout);
                    self.tracker.track(message.id, deadline);
                    return Ok(message);
                }
                _ = self.cancel.cancelled() => {
                    return Err(self.receive_error().unwrap_or(Error::Closed("consumer")));
                }
                changed = state_changes.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed("consumer"));
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, id: MessageId) -> Result<()> {
        self.ensure_usable()?;
        let settled = self.tracker.settle(&id);

        let connection = &self.connection;
        match connection
            .call(connection.transport().ack(self.consumer_id(), vec![id]))
            .await
        {
            Ok(()) => debug!(message_id = %id, "acknowledged"),
            Err(CallError::Cancelled) => return Err(Error::Cancelled),
            // Redelivery covers a lost ack.
            Err(e) => warn!(message_id = %id, error = %e, "acknowledgment not delivered"),
        }

        if settled.is_some_and(|s| s.in_flight) {
            self.release_permits(1).await;
        }
        Ok(())
    }

    async fn negative_acknowledge(&self, id: MessageId) -> Result<()> {
        self.ensure_usable()?;
        let delay = self.config.nack_redelivery_delay;
        if !self.tracker.negative(&id, Instant::now() + delay) {
            debug!(message_id = %id, "negative ack for a message that is not in flight");
            return Ok(());
        }
        if delay.is_zero() {
            self.redeliver_expired().await;
        }
        Ok(())
    }

    /// Ask the broker to redeliver everything whose deadline passed.
    async fn redeliver_expired(&self) {
        let expired: Vec<MessageId> = self
            .tracker
            .expire(Instant::now())
            .map(|e| {
                debug!(
                    message_id = %e.id,
                    held_for = ?e.held_for,
                    redelivery_count = e.redelivery_count,
                    "ack deadline passed"
                );
                e.id
            })
            .collect();
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "redelivering expired messages");
        let count = expired.len() as u32;
        let connection = &self.connection;
        if let Err(e) = connection
            .call(connection.transport().redeliver(self.consumer_id(), expired))
            .await
        {
            warn!(error = %e, "redelivery request failed");
        }
        self.release_permits(count).await;
    }

    /// Return permits to the broker once half the queue has been released.
    async fn release_permits(&self, count: u32) {
        let threshold = (self.config.effective_queue_size() / 2).max(1);
        let released = self.released.fetch_add(count, Ordering::AcqRel) + count;
        if released < threshold {
            return;
        }
        let permits = self.released.swap(0, Ordering::AcqRel);
        if permits == 0 {
            return;
        }
        let connection = &self.connection;
        if let Err(e) = connection
            .call(connection.transport().flow(self.consumer_id(), permits))
            .await
        {
            warn!(permits, error = %e, "flow request failed");
        }
    }

    /// Resubscribe after the delivery channel closed.
    async fn recover(&self) -> Result<UnboundedReceiver<Message>> {
        self.transition(ConsumerState::Failed);
        warn!(subscription = %self.config.subscription, "delivery channel closed, resubscribing");
        self.connection.ensure_connected().await?;

        if !self.transition(ConsumerState::Subscribing) {
            return Err(Error::Closed("consumer"));
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.tracker.clear();
        self.released.store(0, Ordering::Release);
        let deliveries = self.attach().await?;

        if self.cancel.is_cancelled() {
            let id = self.consumer_id();
            let _ = self.connection.call(self.connection.transport().close_consumer(id)).await;
            return Err(Error::Closed("consumer"));
        }
        self.transition(ConsumerState::Active);
        info!(consumer = self.consumer_id(), subscription = %self.config.subscription, "resubscribed");
        Ok(deliveries)
    }

    async fn close(&self) {
        if !self.transition(ConsumerState::Draining) {
            return;
        }
        self.cancel.cancel();
        let id = self.consumer_id();
        let connection = &self.connection;
        match connection.call(connection.transport().close_consumer(id)).await {
            Ok(()) | Err(CallError::Cancelled) => {}
            Err(e) => warn!(consumer = id, error = %e, "failed to unregister consumer"),
        }
        self.tracker.clear();
        self.transition(ConsumerState::Closed);
        info!(consumer = id, subscription = %self.config.subscription, "consumer closed");
    }
}

async fn run_pump(inner: Arc<ConsumerInner>, mut deliveries: UnboundedReceiver<Message>) {
    let mut ticker = tokio::time::interval(inner.config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(message) => {
                    let epoch = inner.epoch.load(Ordering::Acquire);
                    if inner.queue_tx.send(Queued { epoch, message }).is_err() {
                        break;
                    }
                }
                None => {
                    if inner.cancel.is_cancelled() {
                        break;
                    }
                    match inner.recover().await {
                        Ok(next) => deliveries = next,
                        Err(Error::Closed(_)) | Err(Error::Cancelled) => break,
                        Err(e) => {
                            inner.fail(e);
                            break;
                        }
                    }
                }
            },
            _ = ticker.tick() => inner.redeliver_expired().await,
        }
    }
    debug!(subscription = %inner.config.subscription, "consumer pump stopped");
}

async fn run_listener<H: MessageHandler>(
    inner: Arc<ConsumerInner>,
    handler: H,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = inner.receive() => received,
        };
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                stop_listener(&inner, &handler, e).await;
                break;
            }
        };

        let id = message.id;
        let outcome = match handler.handle(message).await {
            Disposition::Ack => inner.acknowledge(id).await,
            Disposition::Nack => inner.negative_acknowledge(id).await,
        };
        if let Err(e) = outcome {
            debug!(message_id = %id, error = %e, "listener stopping");
            stop_listener(&inner, &handler, e).await;
            break;
        }
    }
    inner.listening.store(false, Ordering::Release);
}

/// Report why the listener ended unless the consumer was closed on purpose.
async fn stop_listener<H: MessageHandler>(inner: &ConsumerInner, handler: &H, err: Error) {
    let closed = matches!(err, Error::Closed(_))
        || matches!(inner.state(), ConsumerState::Draining | ConsumerState::Closed);
    if closed {
        return;
    }
    error!(subscription = %inner.config.subscription, error = %err, "listener stopped");
    handler.on_error(err).await;
}
