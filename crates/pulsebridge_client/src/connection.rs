//! Connection management
//!
//! `ConnectionManager` hands out one `Connection` per `(endpoint, auth)` pair
//! and serializes concurrent opens of the same pair so no redundant transport
//! is created. Opens of different pairs proceed independently.
//!
//! A `Connection` is a cheap, clonable handle around the shared transport.
//! Every call made through it is raced against the connection's cancellation
//! token and the operation timeout. Closing it cancels all dependent sessions
//! and outstanding operations with `Error::Cancelled`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use std::time::Duration;

use pulsebridge_config::ClientSettings;
use pulsebridge_message::ServerError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::auth::Authentication;
use crate::consumer::{Consumer, ConsumerConfig};
use crate::error::{CallError, ConnectionError, Error, Result};
use crate::producer::{Producer, ProducerConfig};
use crate::transport::{Connector, Transport};

const SUPPORTED_SCHEMES: [&str; 2] = ["pulsar", "pulsar+ssl"];

/// Exponential backoff used when a session has to be re-established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after failed attempt number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub operation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&ClientSettings> for ConnectionOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(settings.reconnect_initial_backoff_ms),
                max_backoff: Duration::from_millis(settings.reconnect_max_backoff_ms),
                max_attempts: settings.reconnect_max_attempts,
            },
        }
    }
}

/// Validate a service URL.
pub fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint.trim())
        .map_err(|_| ConnectionError::InvalidUrl(endpoint.to_string()))?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(ConnectionError::UnsupportedScheme(url.scheme().to_string()).into());
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConnectionError::InvalidUrl(endpoint.to_string()).into());
    }
    Ok(url)
}

type ConnectionKey = (String, Authentication);

/// Holds the connection of one key; locked for the length of its handshake.
type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    connections: SyncMutex<HashMap<ConnectionKey, ConnectionSlot>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        Self {
            connector,
            options,
            connections: SyncMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: ConnectionKey) -> ConnectionSlot {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    fn slots(&self) -> Vec<ConnectionSlot> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Open (or reuse) the connection for `endpoint` and `auth`. `timeout`
    /// bounds the handshake and becomes the connection's operation timeout.
    pub async fn open(
        &self,
        endpoint: &str,
        auth: &Authentication,
        timeout: Duration,
    ) -> Result<Connection> {
        let url = parse_endpoint(endpoint)?;
        let key = (url.to_string(), auth.clone());

        // Only this pair's slot is held across the handshake.
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        if let Some(existing) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(existing.clone());
        }

        let transport = tokio::time::timeout(timeout, self.connector.connect(&url, &auth.to_auth_data()))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        let options = ConnectionOptions {
            operation_timeout: timeout,
            ..self.options.clone()
        };
        let connection = Connection::new(url, transport, options);
        info!(endpoint = %connection.endpoint(), auth = auth.method(), "connection opened");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Number of connections that are still open. Handshakes in progress
    /// are not counted.
    pub async fn open_connections(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| {
                slot.try_lock()
                    .is_ok_and(|c| c.as_ref().is_some_and(|c| !c.is_closed()))
            })
            .count()
    }

    /// Close every connection handed out so far, waiting for handshakes in
    /// progress.
    pub async fn close_all(&self) {
        let slots: Vec<ConnectionSlot> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            let connection = slot.lock().await.take();
            if let Some(connection) = connection {
                connection.close().await;
            }
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: Url,
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    cancel: CancellationToken,
    reconnect_lock: Mutex<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(endpoint: Url, transport: Arc<dyn Transport>, options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                transport,
                options,
                cancel: CancellationToken::new(),
                reconnect_lock: Mutex::new(()),
            }),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether both handles share one underlying connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Token cancelled when the connection closes; sessions derive theirs
    /// from it.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) async fn call<T, F>(&self, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, ServerError>>,
    {
        self.call_with_timeout(self.inner.options.operation_timeout, fut)
            .await
    }

    pub(crate) async fn call_with_timeout<T, F>(
        &self,
        timeout: Duration,
        fut: F,
    ) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, ServerError>>,
    {
        if self.is_closed() {
            return Err(CallError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(CallError::Cancelled),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CallError::Server(e)),
                Err(_) => Err(CallError::TimedOut(timeout)),
            },
        }
    }

    /// Re-handshake with backoff if the broker session is gone.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Cancelled);
        }
        if self.inner.transport.is_connected() {
            return Ok(());
        }

        let _guard = self.inner.reconnect_lock.lock().await;
        if self.inner.transport.is_connected() {
            return Ok(());
        }

        let policy = &self.inner.options.reconnect;
        for attempt in 0..policy.max_attempts {
            match self.call(self.inner.transport.reconnect()).await {
                Ok(session) => {
                    info!(
                        endpoint = %self.inner.endpoint,
                        session = session.session_id,
                        attempt = attempt + 1,
                        "reconnected"
                    );
                    return Ok(());
                }
                Err(CallError::Cancelled) => return Err(Error::Cancelled),
                Err(CallError::Server(ServerError::AuthenticationFailed(reason))) => {
                    return Err(ConnectionError::AuthRejected(reason).into());
                }
                Err(e) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        endpoint = %self.inner.endpoint,
                        attempt = attempt + 1,
                        error = %e,
                        ?delay,
                        "reconnect attempt failed"
                    );
                    tokio::select! {
                        _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(ConnectionError::ReconnectFailed {
            attempts: policy.max_attempts,
        }
        .into())
    }

    /// Cancel every dependent session and release the transport. Idempotent.
    pub async fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.transport.close().await;
        info!(endpoint = %self.inner.endpoint, "connection closed");
    }

    pub async fn create_producer(&self, topic: &str, config: ProducerConfig) -> Result<Producer> {
        Producer::create(self.clone(), topic, config).await
    }

    pub async fn subscribe(&self, config: ConsumerConfig) -> Result<Consumer> {
        Consumer::subscribe(self.clone(), config).await
    }
}
