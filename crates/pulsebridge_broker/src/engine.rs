//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - authenticating sessions and authorizing namespace access
//! - managing topics, partitions and their subscriptions
//! - registering producers and appending their messages
//! - dispatching to consumers within their flow-control permits
//! - acknowledgment, redelivery and scheduled delivery
//!
//! Concurrency and usage notes:
//! - The API here is synchronous and designed to be held behind a lock
//!   (`BrokerHandle` wraps `Arc<Mutex<Broker>>`). Callers must not hold the
//!   lock across an `.await`.
//! - Deliveries go out over unbounded channels, so dispatching never blocks
//!   while the lock is held.
//! - Scheduled messages are released by `tick`, which the dispatch loop
//!   started by `BrokerHandle::start` calls periodically.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use pulsebridge_config::BrokerSettings;
use pulsebridge_message::{
    AuthData, ConsumerId, Envelope, InitialPosition, Message, MessageId, ProducerId,
    ProducerRegistration, RoutedMessage, ServerError, SessionId, SessionInfo, SubscribeRequest,
    TopicName, TopicPattern, TopicSelector,
};
use pulsebridge_utils::clock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::auth::AuthPolicy;
use crate::subscription::{ConsumerEntry, PartitionScope, SubscriptionStats};
use crate::topic::Topic;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Namespaces (`tenant/namespace`) that exist on this broker.
    pub namespaces: HashSet<String>,
    pub allow_auto_topic_creation: bool,
    pub auth: AuthPolicy,
    pub max_message_size: usize,
    pub dispatch_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespaces: HashSet::from(["public/default".to_string()]),
            allow_auto_topic_creation: true,
            auth: AuthPolicy {
                allow_anonymous: true,
                ..AuthPolicy::default()
            },
            max_message_size: 5 * 1024 * 1024,
            dispatch_interval: Duration::from_millis(10),
        }
    }
}

impl From<&BrokerSettings> for BrokerConfig {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            namespaces: settings.namespaces.iter().cloned().collect(),
            allow_auto_topic_creation: settings.allow_auto_topic_creation,
            auth: AuthPolicy {
                allow_anonymous: settings.allow_anonymous,
                jwt_secret: settings.jwt_secret.clone(),
                ..AuthPolicy::default()
            },
            max_message_size: settings.max_message_size,
            dispatch_interval: Duration::from_millis(settings.dispatch_interval_ms.max(1)),
        }
    }
}

#[derive(Debug)]
struct ProducerEntry {
    session: SessionId,
    topic: String,
    name: String,
    partition: Option<u32>,
}

/// Where a validated send lands.
#[derive(Debug)]
struct SendTarget {
    topic: String,
    partition: usize,
    producer_name: String,
}

#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    /// Keyed by the base (non-partition) topic name.
    topics: HashMap<String, Topic>,
    sessions: HashMap<SessionId, String>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    patterns: Vec<(ConsumerId, TopicPattern)>,
    next_id: u64,
    next_ledger: u64,
    available: bool,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            topics: HashMap::new(),
            sessions: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            patterns: Vec::new(),
            next_id: 1,
            next_ledger: 1,
            available: true,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---- sessions ----

    /// Run the connect handshake.
    pub fn connect(&mut self, auth: &AuthData) -> Result<SessionInfo, ServerError> {
        if !self.available {
            return Err(ServerError::ServiceUnavailable);
        }
        let role = self.config.auth.authenticate(auth)?;
        let session_id = self.allocate_id();
        self.sessions.insert(session_id, role.clone());
        info!(session = session_id, role = %role, "session opened");
        Ok(SessionInfo {
            session_id,
            role,
            max_message_size: self.config.max_message_size,
        })
    }

    pub fn has_session(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Drop a session with every producer and consumer it owns.
    pub fn disconnect(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_none() {
            return;
        }
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| p.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in producers {
            self.close_producer(id);
        }
        let consumers: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in consumers {
            self.close_consumer(id);
        }
        info!(session, "session closed");
    }

    /// Drop every live session, as a broker restart would.
    pub fn sever_connections(&mut self) {
        let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
        warn!(count = sessions.len(), "severing all sessions");
        for session in sessions {
            self.disconnect(session);
        }
    }

    /// While unavailable, new handshakes are refused.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    fn role(&self, session: SessionId) -> Result<&str, ServerError> {
        self.sessions
            .get(&session)
            .map(String::as_str)
            .ok_or(ServerError::SessionClosed)
    }

    // ---- topics ----

    /// Partition count of an existing topic (`0` when not partitioned).
    pub fn lookup_topic(&self, name: &str) -> Result<u32, ServerError> {
        let name = parse_topic(name)?;
        self.topics
            .get(&name.base().to_string())
            .map(Topic::partition_count)
            .ok_or_else(|| ServerError::TopicNotFound(name.to_string()))
    }

    pub fn create_partitioned_topic(&mut self, name: &str, partitions: u32) -> Result<(), ServerError> {
        if partitions == 0 {
            return Err(ServerError::InvalidConfiguration(
                "a partitioned topic needs at least one partition".to_string(),
            ));
        }
        let name = parse_topic(name)?.base();
        if self.topics.contains_key(&name.to_string()) {
            return Err(ServerError::InvalidConfiguration(format!(
                "topic {name} already exists"
            )));
        }
        self.ensure_namespace(&name)?;
        self.insert_topic(name, Some(partitions));
        Ok(())
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    fn ensure_namespace(&self, name: &TopicName) -> Result<(), ServerError> {
        if self.config.namespaces.contains(&name.namespace()) {
            Ok(())
        } else {
            Err(ServerError::TopicNotFound(format!(
                "namespace {} does not exist",
                name.namespace()
            )))
        }
    }

    /// Return the base name of `name`, creating the topic if allowed.
    fn resolve_topic(&mut self, name: &TopicName) -> Result<String, ServerError> {
        let base = name.base();
        let key = base.to_string();
        if self.topics.contains_key(&key) {
            return Ok(key);
        }
        if !self.config.allow_auto_topic_creation {
            return Err(ServerError::TopicNotFound(key));
        }
        self.ensure_namespace(&base)?;
        self.insert_topic(base, None);
        Ok(key)
    }

    /// Like `resolve_topic`, also returning the partition a `-partition-N`
    /// name addresses. That partition must exist on a partitioned topic.
    fn resolve_partition(&mut self, name: &TopicName) -> Result<(String, Option<u32>), ServerError> {
        let key = self.resolve_topic(name)?;
        let Some(index) = name.partition_index() else {
            return Ok((key, None));
        };
        let partitions = self.topics.get(&key).map_or(0, Topic::partition_count);
        if index >= partitions {
            return Err(ServerError::TopicNotFound(format!(
                "{name} (topic has {partitions} partitions)"
            )));
        }
        Ok((key, Some(index)))
    }

    fn insert_topic(&mut self, name: TopicName, partitions: Option<u32>) {
        let count = partitions.unwrap_or(1);
        let ledgers: Vec<u64> = (0..count)
            .map(|_| {
                let ledger = self.next_ledger;
                self.next_ledger += 1;
                ledger
            })
            .collect();
        let key = name.to_string();
        info!(topic = %key, partitions = count, "topic created");
        self.topics
            .insert(key.clone(), Topic::new(name, partitions.is_some(), ledgers));
        self.attach_pattern_consumers(&key);
    }

    /// Attach pattern consumers whose pattern matches a newly created topic.
    fn attach_pattern_consumers(&mut self, key: &str) {
        let Some(topic) = self.topics.get(key) else {
            return;
        };
        let matching: Vec<ConsumerId> = self
            .patterns
            .iter()
            .filter(|(_, pattern)| pattern.matches(&topic.name))
            .map(|(id, _)| *id)
            .collect();
        for consumer in matching {
            if let Err(e) = self.attach(consumer, key, None) {
                warn!(consumer, topic = %key, error = %e, "pattern consumer not attached");
            }
        }
    }

    // ---- producers ----

    pub fn create_producer(
        &mut self,
        session: SessionId,
        topic: &str,
        name: Option<&str>,
    ) -> Result<ProducerRegistration, ServerError> {
        let role = self.role(session)?.to_string();
        let topic_name = parse_topic(topic)?;
        self.config.auth.authorize(&role, &topic_name.namespace())?;
        let (key, partition) = self.resolve_partition(&topic_name)?;

        let producer_id = self.allocate_id();
        let producer_name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("loopback-{session}-{producer_id}"),
        };

        let Some(topic) = self.topics.get_mut(&key) else {
            return Err(ServerError::TopicNotFound(key));
        };
        if !topic.producers.insert(producer_name.clone()) {
            return Err(ServerError::ProducerBusy(producer_name));
        }
        let partitions = topic.partition_count();

        self.producers.insert(
            producer_id,
            ProducerEntry {
                session,
                topic: key.clone(),
                name: producer_name.clone(),
                partition,
            },
        );
        info!(producer = %producer_name, topic = %key, ?partition, "producer registered");

        Ok(ProducerRegistration {
            producer_id,
            producer_name,
            partitions,
            partition,
            max_message_size: self.config.max_message_size,
        })
    }

    /// Append one message. `partition` is ignored for non-partitioned topics
    /// and for producers bound to a single partition.
    pub fn send(
        &mut self,
        producer: ProducerId,
        partition: Option<u32>,
        envelope: Envelope,
    ) -> Result<MessageId, ServerError> {
        let target = self.send_target(producer, partition, &envelope)?;
        self.append(target, envelope)
    }

    /// Append a batch in order. Every message is checked before the first one
    /// is stored, so a rejected batch leaves nothing behind.
    pub fn send_batch(
        &mut self,
        producer: ProducerId,
        messages: Vec<RoutedMessage>,
    ) -> Result<Vec<MessageId>, ServerError> {
        let targets = messages
            .iter()
            .map(|m| self.send_target(producer, m.partition, &m.envelope))
            .collect::<Result<Vec<_>, _>>()?;
        targets
            .into_iter()
            .zip(messages)
            .map(|(target, m)| self.append(target, m.envelope))
            .collect()
    }

    /// Validate a send and work out where it lands.
    fn send_target(
        &self,
        producer: ProducerId,
        partition: Option<u32>,
        envelope: &Envelope,
    ) -> Result<SendTarget, ServerError> {
        let entry = self
            .producers
            .get(&producer)
            .ok_or(ServerError::UnknownProducer(producer))?;
        if envelope.payload.len() > self.config.max_message_size {
            return Err(ServerError::MessageTooLarge {
                size: envelope.payload.len(),
                max: self.config.max_message_size,
            });
        }
        let topic = self
            .topics
            .get(&entry.topic)
            .ok_or_else(|| ServerError::TopicNotFound(entry.topic.clone()))?;

        let index = if topic.partitioned {
            let index = entry.partition.or(partition).unwrap_or(0) as usize;
            if index >= topic.partitions.len() {
                return Err(ServerError::InvalidConfiguration(format!(
                    "partition {index} out of range for {}",
                    entry.topic
                )));
            }
            index
        } else {
            0
        };
        Ok(SendTarget {
            topic: entry.topic.clone(),
            partition: index,
            producer_name: entry.name.clone(),
        })
    }

    fn append(&mut self, target: SendTarget, envelope: Envelope) -> Result<MessageId, ServerError> {
        let SendTarget {
            topic: key,
            partition,
            producer_name,
        } = target;
        let now = clock::now_millis();
        let deliver_at = envelope.delivery.map(|schedule| schedule.resolve(now));
        let message = Message {
            id: MessageId::new(0, 0, MessageId::NON_PARTITIONED),
            topic: String::new(),
            payload: envelope.payload,
            properties: envelope.properties,
            partition_key: envelope.partition_key,
            ordering_key: envelope.ordering_key,
            event_time: envelope.event_time,
            publish_time: now,
            deliver_at,
            sequence_id: envelope.sequence_id.unwrap_or(0),
            producer_name,
            redelivery_count: 0,
        };
        let topic = self
            .topics
            .get_mut(&key)
            .ok_or_else(|| ServerError::TopicNotFound(key.clone()))?;
        let id = topic
            .append(partition, message)
            .ok_or_else(|| ServerError::TopicNotFound(key.clone()))?;

        let persistent = topic.name.is_persistent();
        for subscription in topic.subscriptions.values_mut() {
            // Non-persistent topics only reach subscriptions with live consumers.
            if persistent || !subscription.consumers.is_empty() {
                subscription.enqueue(id, deliver_at, now);
            }
        }
        debug!(topic = %key, message_id = %id, "message appended");

        self.dispatch_topic(&key, now);
        Ok(id)
    }

    /// Unregister a producer. Unknown ids are ignored.
    pub fn close_producer(&mut self, producer: ProducerId) {
        if let Some(entry) = self.producers.remove(&producer) {
            if let Some(topic) = self.topics.get_mut(&entry.topic) {
                topic.producers.remove(&entry.name);
            }
            info!(producer = %entry.name, topic = %entry.topic, "producer closed");
        }
    }

    // ---- consumers ----

    /// Register a consumer and attach it to every selected topic. The consumer
    /// starts with zero permits; deliveries begin after its first `flow`.
    pub fn subscribe(
        &mut self,
        session: SessionId,
        request: SubscribeRequest,
        sender: UnboundedSender<Message>,
    ) -> Result<ConsumerId, ServerError> {
        let role = self.role(session)?.to_string();

        if request.subscription.trim().is_empty() {
            return Err(ServerError::InvalidConfiguration(
                "subscription name is empty".to_string(),
            ));
        }
        if request.read_compacted && !request.kind.supports_read_compacted() {
            return Err(ServerError::InvalidConfiguration(format!(
                "read_compacted is not allowed on {} subscriptions",
                request.kind
            )));
        }

        // Resolve and validate everything before touching any state.
        let keys: Vec<(String, Option<PartitionScope>)> = match &request.selector {
            TopicSelector::Pattern(pattern) => {
                self.config.auth.authorize(&role, pattern.namespace())?;
                let mut keys: Vec<String> = self
                    .topics
                    .values()
                    .filter(|t| pattern.matches(&t.name))
                    .map(|t| t.name.to_string())
                    .collect();
                keys.sort();
                keys.into_iter().map(|key| (key, None)).collect()
            }
            selector => {
                let mut keys: Vec<(String, Option<PartitionScope>)> = Vec::new();
                for name in selector.named_topics() {
                    self.config.auth.authorize(&role, &name.namespace())?;
                    let (key, partition) = self.resolve_partition(&name)?;
                    let partition = partition.map(|p| p as i32);
                    match keys.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, scope)) => match partition {
                            None => *scope = None,
                            // a whole-topic entry already covers every partition
                            Some(p) => {
                                if let Some(set) = scope {
                                    set.insert(p);
                                }
                            }
                        },
                        None => keys.push((key, partition.map(|p| PartitionScope::from([p])))),
                    }
                }
                keys
            }
        };
        for (key, scope) in &keys {
            self.check_compatible(key, &request, scope.as_ref())?;
        }

        let consumer_id = self.allocate_id();
        let name = request
            .consumer_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("consumer-{consumer_id}"));
        if let TopicSelector::Pattern(pattern) = &request.selector {
            self.patterns.push((consumer_id, pattern.clone()));
        }
        info!(
            consumer = consumer_id,
            name = %name,
            subscription = %request.subscription,
            kind = %request.kind,
            topics = %request.selector,
            "consumer subscribed"
        );
        self.consumers.insert(
            consumer_id,
            ConsumerEntry {
                session,
                name,
                request,
                topics: Vec::new(),
                permits: 0,
                sender,
            },
        );
        for (key, scope) in keys {
            self.attach(consumer_id, &key, scope)?;
        }
        Ok(consumer_id)
    }

    fn check_compatible(
        &self,
        key: &str,
        request: &SubscribeRequest,
        scope: Option<&PartitionScope>,
    ) -> Result<(), ServerError> {
        let Some(existing) = self
            .topics
            .get(key)
            .and_then(|t| t.subscriptions.get(&request.subscription))
        else {
            return Ok(());
        };
        if existing.consumers.is_empty() {
            return Ok(());
        }
        if existing.kind != request.kind {
            return Err(ServerError::IncompatibleSubscription {
                subscription: request.subscription.clone(),
                existing: existing.kind.to_string(),
                requested: request.kind.to_string(),
            });
        }
        // Exclusive consumers on disjoint partitions do not compete.
        if !existing.kind.allows_multiple_consumers() && existing.overlaps(scope) {
            return Err(ServerError::ConsumerBusy(request.subscription.clone()));
        }
        Ok(())
    }

    /// Attach a consumer to one topic. `scope` limits it to some partitions;
    /// `None` means the whole topic.
    fn attach(
        &mut self,
        consumer_id: ConsumerId,
        key: &str,
        scope: Option<PartitionScope>,
    ) -> Result<(), ServerError> {
        let Some(consumer) = self.consumers.get(&consumer_id) else {
            return Err(ServerError::UnknownConsumer(consumer_id));
        };
        if consumer.topics.iter().any(|t| t == key) {
            return Ok(());
        }
        self.check_compatible(key, &consumer.request, scope.as_ref())?;
        let request = consumer.request.clone();

        let Some(topic) = self.topics.get_mut(key) else {
            return Err(ServerError::TopicNotFound(key.to_string()));
        };
        let fresh = !topic.subscriptions.contains_key(&request.subscription);
        let backlog: Vec<(MessageId, Option<i64>)> = match request.initial_position {
            InitialPosition::Earliest if fresh => topic
                .backlog(request.read_compacted)
                .into_iter()
                .map(|id| (id, topic.entry(&id).and_then(|m| m.deliver_at)))
                .collect(),
            _ => Vec::new(),
        };
        let now = clock::now_millis();
        let subscription = topic.subscription_mut(&request.subscription, request.kind);
        if subscription.consumers.is_empty() {
            subscription.kind = request.kind;
        }
        for (id, deliver_at) in backlog {
            subscription.enqueue(id, deliver_at, now);
        }
        subscription.attach(consumer_id, scope);

        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
            consumer.topics.push(key.to_string());
        }
        self.dispatch_topic(key, now);
        Ok(())
    }

    /// Grant `permits` more deliveries to a consumer.
    pub fn flow(&mut self, consumer: ConsumerId, permits: u32) -> Result<(), ServerError> {
        let entry = self
            .consumers
            .get_mut(&consumer)
            .ok_or(ServerError::UnknownConsumer(consumer))?;
        entry.permits = entry.permits.saturating_add(permits);
        let topics = entry.topics.clone();
        let now = clock::now_millis();
        for key in topics {
            self.dispatch_topic(&key, now);
        }
        Ok(())
    }

    /// Acknowledge ids on the consumer's subscription. Ids that were already
    /// acknowledged are ignored.
    pub fn ack(&mut self, consumer: ConsumerId, ids: &[MessageId]) -> Result<(), ServerError> {
        let entry = self
            .consumers
            .get(&consumer)
            .ok_or(ServerError::UnknownConsumer(consumer))?;
        let subscription = entry.request.subscription.clone();
        let topics = entry.topics.clone();
        for id in ids {
            for key in &topics {
                let Some(sub) = self
                    .topics
                    .get_mut(key)
                    .and_then(|t| t.subscriptions.get_mut(&subscription))
                else {
                    continue;
                };
                if sub.ack(id) {
                    debug!(consumer, message_id = %id, "acknowledged");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Put unacknowledged ids back for redelivery, bumping their redelivery
    /// count. An empty list redelivers everything the consumer holds.
    pub fn redeliver(&mut self, consumer: ConsumerId, ids: &[MessageId]) -> Result<(), ServerError> {
        let entry = self
            .consumers
            .get(&consumer)
            .ok_or(ServerError::UnknownConsumer(consumer))?;
        let subscription = entry.request.subscription.clone();
        let topics = entry.topics.clone();
        for key in &topics {
            let Some(sub) = self
                .topics
                .get_mut(key)
                .and_then(|t| t.subscriptions.get_mut(&subscription))
            else {
                continue;
            };
            let targets = if ids.is_empty() {
                sub.unacked_by(consumer)
            } else {
                ids.to_vec()
            };
            for id in targets {
                if sub.redeliver(&id) {
                    debug!(consumer, message_id = %id, "redelivery requested");
                }
            }
        }
        let now = clock::now_millis();
        for key in &topics {
            self.dispatch_topic(key, now);
        }
        Ok(())
    }

    /// Detach a consumer; whatever it held unacknowledged is redelivered to
    /// the remaining consumers. Unknown ids are ignored.
    pub fn close_consumer(&mut self, consumer: ConsumerId) {
        let Some(entry) = self.consumers.remove(&consumer) else {
            return;
        };
        self.patterns.retain(|(id, _)| *id != consumer);
        let now = clock::now_millis();
        for key in &entry.topics {
            if let Some(sub) = self
                .topics
                .get_mut(key)
                .and_then(|t| t.subscriptions.get_mut(&entry.request.subscription))
            {
                sub.detach(consumer);
            }
            self.dispatch_topic(key, now);
        }
        info!(consumer, name = %entry.name, "consumer closed");
    }

    // ---- dispatch ----

    fn dispatch_topic(&mut self, key: &str, now: i64) {
        let Some(topic) = self.topics.get_mut(key) else {
            return;
        };
        let Topic {
            partitions,
            subscriptions,
            ..
        } = topic;
        for subscription in subscriptions.values_mut() {
            subscription.dispatch(partitions, &mut self.consumers, now);
        }
    }

    /// Release due scheduled messages and dispatch everywhere.
    pub fn tick(&mut self, now: i64) {
        let keys: Vec<String> = self.topics.keys().cloned().collect();
        for key in keys {
            self.dispatch_topic(&key, now);
        }
    }

    // ---- inspection ----

    pub fn subscription_stats(&self, topic: &str, subscription: &str) -> Option<SubscriptionStats> {
        let name = TopicName::parse(topic).ok()?;
        self.topics
            .get(&name.base().to_string())?
            .subscriptions
            .get(subscription)
            .map(|s| s.stats())
    }

    pub fn consumer_permits(&self, consumer: ConsumerId) -> Option<u32> {
        self.consumers.get(&consumer).map(|c| c.permits)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

fn parse_topic(name: &str) -> Result<TopicName, ServerError> {
    TopicName::parse(name).map_err(|e| ServerError::InvalidTopic(e.to_string()))
}

/// Shared, lockable handle to a broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerHandle {
    inner: Arc<Mutex<Broker>>,
}

impl BrokerHandle {
    /// Wrap a broker without starting its dispatch loop.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Broker::new(config))),
        }
    }

    /// Create a broker and spawn its dispatch loop on the current runtime.
    /// The loop ends once every handle has been dropped.
    pub fn start(config: BrokerConfig) -> Self {
        let interval = config.dispatch_interval;
        let handle = Self::new(config);
        tokio::spawn(Self::run_dispatch_loop(Arc::downgrade(&handle.inner), interval));
        handle
    }

    /// Lock the broker, recovering from a poisoned lock.
    pub fn lock(&self) -> MutexGuard<'_, Broker> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_dispatch_loop(broker: Weak<Mutex<Broker>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(broker) = broker.upgrade() else {
                debug!("broker dropped, dispatch loop exiting");
                break;
            };
            broker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tick(clock::now_millis());
        }
    }
}
