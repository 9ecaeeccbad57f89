//! Transport seam
//!
//! A `Transport` carries session commands to one broker endpoint. A
//! `Connector` creates transports for `(endpoint, credentials)` pairs.
//!
//! The workspace ships the loopback pair: `LoopbackConnector` resolves
//! endpoints against brokers registered with it, and `LoopbackTransport`
//! drives a `BrokerHandle` directly, holding the broker lock only for the
//! duration of each synchronous call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use pulsebridge_broker::BrokerHandle;
use pulsebridge_message::{
    AuthData, ConsumerId, Message, MessageId, ProducerId, ProducerRegistration, RoutedMessage,
    ServerError, SessionId, SessionInfo, SubscribeRequest,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info};
use url::Url;

use crate::error::{ConnectionError, Error, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the broker session behind this transport is still alive.
    fn is_connected(&self) -> bool;

    /// Run a fresh connect handshake, replacing any previous session.
    async fn reconnect(&self) -> Result<SessionInfo, ServerError>;

    async fn create_producer(
        &self,
        topic: &str,
        name: Option<&str>,
    ) -> Result<ProducerRegistration, ServerError>;

    /// Send messages in order; ids come back in the same order. A rejected
    /// batch stores none of its messages, so it can be retried whole.
    async fn send(
        &self,
        producer: ProducerId,
        messages: Vec<RoutedMessage>,
    ) -> Result<Vec<MessageId>, ServerError>;

    async fn close_producer(&self, producer: ProducerId) -> Result<(), ServerError>;

    /// Register a consumer. Deliveries arrive on the returned receiver, which
    /// closes when the broker drops the consumer or the session.
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<(ConsumerId, UnboundedReceiver<Message>), ServerError>;

    async fn flow(&self, consumer: ConsumerId, permits: u32) -> Result<(), ServerError>;

    async fn ack(&self, consumer: ConsumerId, ids: Vec<MessageId>) -> Result<(), ServerError>;

    /// Ask for redelivery of unacknowledged ids; empty means all of them.
    async fn redeliver(&self, consumer: ConsumerId, ids: Vec<MessageId>)
    -> Result<(), ServerError>;

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), ServerError>;

    /// End the session. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport and run its first handshake.
    async fn connect(&self, endpoint: &Url, auth: &AuthData) -> Result<Arc<dyn Transport>>;
}

/// `host:port` identity of an endpoint, with the Pulsar default ports.
pub fn endpoint_key(endpoint: &Url) -> String {
    let host = endpoint.host_str().unwrap_or_default();
    let port = endpoint.port().unwrap_or(match endpoint.scheme() {
        "pulsar+ssl" => 6651,
        _ => 6650,
    });
    format!("{host}:{port}")
}

/// Resolves endpoints against in-process brokers registered with it.
#[derive(Debug, Default)]
pub struct LoopbackConnector {
    brokers: Mutex<HashMap<String, BrokerHandle>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `service_url` from `broker`.
    pub fn register(&self, service_url: &str, broker: BrokerHandle) -> Result<()> {
        let url = Url::parse(service_url)
            .map_err(|_| ConnectionError::InvalidUrl(service_url.to_string()))?;
        let key = endpoint_key(&url);
        info!(endpoint = %key, "loopback broker registered");
        self.brokers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, broker);
        Ok(())
    }

    fn lookup(&self, endpoint: &Url) -> Option<BrokerHandle> {
        self.brokers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint_key(endpoint))
            .cloned()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, endpoint: &Url, auth: &AuthData) -> Result<Arc<dyn Transport>> {
        let broker = self
            .lookup(endpoint)
            .ok_or_else(|| ConnectionError::Unreachable(endpoint_key(endpoint)))?;
        let transport = LoopbackTransport::new(broker, auth.clone());
        match transport.reconnect().await {
            Ok(_) => Ok(Arc::new(transport)),
            Err(ServerError::AuthenticationFailed(reason)) => {
                Err(ConnectionError::AuthRejected(reason).into())
            }
            Err(e) => Err(Error::from(ConnectionError::Unreachable(e.to_string()))),
        }
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    broker: BrokerHandle,
    auth: AuthData,
    session: Mutex<Option<SessionId>>,
}

impl LoopbackTransport {
    pub fn new(broker: BrokerHandle, auth: AuthData) -> Self {
        Self {
            broker,
            auth,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<SessionId, ServerError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(ServerError::SessionClosed)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn is_connected(&self) -> bool {
        self.session()
            .is_ok_and(|session| self.broker.lock().has_session(session))
    }

    async fn reconnect(&self) -> Result<SessionInfo, ServerError> {
        let mut broker = self.broker.lock();
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = session.take() {
            broker.disconnect(old);
        }
        let info = broker.connect(&self.auth)?;
        *session = Some(info.session_id);
        debug!(session = info.session_id, role = %info.role, "loopback session established");
        Ok(info)
    }

    async fn create_producer(
        &self,
        topic: &str,
        name: Option<&str>,
    ) -> Result<ProducerRegistration, ServerError> {
        let session = self.session()?;
        self.broker.lock().create_producer(session, topic, name)
    }

    async fn send(
        &self,
        producer: ProducerId,
        messages: Vec<RoutedMessage>,
    ) -> Result<Vec<MessageId>, ServerError> {
        self.broker.lock().send_batch(producer, messages)
    }

    async fn close_producer(&self, producer: ProducerId) -> Result<(), ServerError> {
        self.broker.lock().close_producer(producer);
        Ok(())
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<(ConsumerId, UnboundedReceiver<Message>), ServerError> {
        let session = self.session()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = self.broker.lock().subscribe(session, request, tx)?;
        Ok((consumer, rx))
    }

    async fn flow(&self, consumer: ConsumerId, permits: u32) -> Result<(), ServerError> {
        self.broker.lock().flow(consumer, permits)
    }

    async fn ack(&self, consumer: ConsumerId, ids: Vec<MessageId>) -> Result<(), ServerError> {
        self.broker.lock().ack(consumer, &ids)
    }

    async fn redeliver(
        &self,
        consumer: ConsumerId,
        ids: Vec<MessageId>,
    ) -> Result<(), ServerError> {
        self.broker.lock().redeliver(consumer, &ids)
    }

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), ServerError> {
        self.broker.lock().close_consumer(consumer);
        Ok(())
    }

    async fn close(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            self.broker.lock().disconnect(session);
        }
    }
}
