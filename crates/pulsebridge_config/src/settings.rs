use serde::{Deserialize, Serialize};

/// Top-level configuration settings for the application.
///
/// One section per concern: the client connection, producer and consumer
/// defaults, the in-process loopback broker, and logging.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    pub client: ClientSettings,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Connection settings: where the broker lives and how to authenticate.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub service_url: String,
    pub operation_timeout_secs: u64,
    /// `none`, `token` (alias `jwt`), `basic`, `tls` or `oauth2`.
    pub auth_method: String,
    pub auth_token: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub oauth2_issuer_url: Option<String>,
    pub oauth2_client_id: Option<String>,
    pub oauth2_audience: Option<String>,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub reconnect_max_attempts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProducerSettings {
    pub send_timeout_ms: u64,
    pub max_send_retries: u32,
    pub batching_enabled: bool,
    pub batching_max_messages: usize,
    pub batching_max_publish_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub receiver_queue_size: u32,
    pub receiver_queue_size_across_partitions: u32,
    /// `0` disables the ack timeout.
    pub ack_timeout_ms: u64,
    pub nack_redelivery_delay_ms: u64,
    pub tick_interval_ms: u64,
}

/// Settings for the in-process loopback broker.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub allow_auto_topic_creation: bool,
    pub allow_anonymous: bool,
    pub jwt_secret: Option<String>,
    pub max_message_size: usize,
    pub dispatch_interval_ms: u64,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub client: Option<PartialClientSettings>,
    pub producer: Option<PartialProducerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub service_url: Option<String>,
    pub operation_timeout_secs: Option<u64>,
    pub auth_method: Option<String>,
    pub auth_token: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub oauth2_issuer_url: Option<String>,
    pub oauth2_client_id: Option<String>,
    pub oauth2_audience: Option<String>,
    pub reconnect_initial_backoff_ms: Option<u64>,
    pub reconnect_max_backoff_ms: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialProducerSettings {
    pub send_timeout_ms: Option<u64>,
    pub max_send_retries: Option<u32>,
    pub batching_enabled: Option<bool>,
    pub batching_max_messages: Option<usize>,
    pub batching_max_publish_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub receiver_queue_size: Option<u32>,
    pub receiver_queue_size_across_partitions: Option<u32>,
    pub ack_timeout_ms: Option<u64>,
    pub nack_redelivery_delay_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub allow_auto_topic_creation: Option<bool>,
    pub allow_anonymous: Option<bool>,
    pub jwt_secret: Option<String>,
    pub max_message_size: Option<usize>,
    pub dispatch_interval_ms: Option<u64>,
    pub namespaces: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        Settings {
            client: self.client.unwrap_or_default().merge(defaults.client),
            producer: self.producer.unwrap_or_default().merge(defaults.producer),
            consumer: self.consumer.unwrap_or_default().merge(defaults.consumer),
            broker: self.broker.unwrap_or_default().merge(defaults.broker),
            logging: LoggingSettings {
                level: self
                    .logging
                    .and_then(|l| l.level)
                    .unwrap_or(defaults.logging.level),
            },
        }
    }
}

impl PartialClientSettings {
    fn merge(self, d: ClientSettings) -> ClientSettings {
        ClientSettings {
            service_url: self.service_url.unwrap_or(d.service_url),
            operation_timeout_secs: self
                .operation_timeout_secs
                .unwrap_or(d.operation_timeout_secs),
            auth_method: self.auth_method.unwrap_or(d.auth_method),
            auth_token: self.auth_token.or(d.auth_token),
            auth_username: self.auth_username.or(d.auth_username),
            auth_password: self.auth_password.or(d.auth_password),
            tls_cert_path: self.tls_cert_path.or(d.tls_cert_path),
            tls_key_path: self.tls_key_path.or(d.tls_key_path),
            oauth2_issuer_url: self.oauth2_issuer_url.or(d.oauth2_issuer_url),
            oauth2_client_id: self.oauth2_client_id.or(d.oauth2_client_id),
            oauth2_audience: self.oauth2_audience.or(d.oauth2_audience),
            reconnect_initial_backoff_ms: self
                .reconnect_initial_backoff_ms
                .unwrap_or(d.reconnect_initial_backoff_ms),
            reconnect_max_backoff_ms: self
                .reconnect_max_backoff_ms
                .unwrap_or(d.reconnect_max_backoff_ms),
            reconnect_max_attempts: self
                .reconnect_max_attempts
                .unwrap_or(d.reconnect_max_attempts),
        }
    }
}

impl PartialProducerSettings {
    fn merge(self, d: ProducerSettings) -> ProducerSettings {
        ProducerSettings {
            send_timeout_ms: self.send_timeout_ms.unwrap_or(d.send_timeout_ms),
            max_send_retries: self.max_send_retries.unwrap_or(d.max_send_retries),
            batching_enabled: self.batching_enabled.unwrap_or(d.batching_enabled),
            batching_max_messages: self
                .batching_max_messages
                .unwrap_or(d.batching_max_messages),
            batching_max_publish_delay_ms: self
                .batching_max_publish_delay_ms
                .unwrap_or(d.batching_max_publish_delay_ms),
        }
    }
}

impl PartialConsumerSettings {
    fn merge(self, d: ConsumerSettings) -> ConsumerSettings {
        ConsumerSettings {
            receiver_queue_size: self.receiver_queue_size.unwrap_or(d.receiver_queue_size),
            receiver_queue_size_across_partitions: self
                .receiver_queue_size_across_partitions
                .unwrap_or(d.receiver_queue_size_across_partitions),
            ack_timeout_ms: self.ack_timeout_ms.unwrap_or(d.ack_timeout_ms),
            nack_redelivery_delay_ms: self
                .nack_redelivery_delay_ms
                .unwrap_or(d.nack_redelivery_delay_ms),
            tick_interval_ms: self.tick_interval_ms.unwrap_or(d.tick_interval_ms),
        }
    }
}

impl PartialBrokerSettings {
    fn merge(self, d: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            allow_auto_topic_creation: self
                .allow_auto_topic_creation
                .unwrap_or(d.allow_auto_topic_creation),
            allow_anonymous: self.allow_anonymous.unwrap_or(d.allow_anonymous),
            jwt_secret: self.jwt_secret.or(d.jwt_secret),
            max_message_size: self.max_message_size.unwrap_or(d.max_message_size),
            dispatch_interval_ms: self.dispatch_interval_ms.unwrap_or(d.dispatch_interval_ms),
            namespaces: self.namespaces.unwrap_or(d.namespaces),
        }
    }
}

/// Provides default values for `Settings`.
///
/// Mirrors the defaults of the Pulsar workflow nodes: a local broker URL, a
/// 30 second operation timeout, a 1000 message receiver queue and a 1 second
/// ack timeout.
impl Default for Settings {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                service_url: "pulsar://localhost:6650".to_string(),
                operation_timeout_secs: 30,
                auth_method: "none".to_string(),
                auth_token: None,
                auth_username: None,
                auth_password: None,
                tls_cert_path: None,
                tls_key_path: None,
                oauth2_issuer_url: None,
                oauth2_client_id: None,
                oauth2_audience: None,
                reconnect_initial_backoff_ms: 100,
                reconnect_max_backoff_ms: 30_000,
                reconnect_max_attempts: 10,
            },
            producer: ProducerSettings {
                send_timeout_ms: 30_000,
                max_send_retries: 3,
                batching_enabled: false,
                batching_max_messages: 1000,
                batching_max_publish_delay_ms: 10,
            },
            consumer: ConsumerSettings {
                receiver_queue_size: 1000,
                receiver_queue_size_across_partitions: 50_000,
                ack_timeout_ms: 1000,
                nack_redelivery_delay_ms: 0,
                tick_interval_ms: 100,
            },
            broker: BrokerSettings {
                allow_auto_topic_creation: true,
                allow_anonymous: true,
                jwt_secret: None,
                max_message_size: 5 * 1024 * 1024,
                dispatch_interval_ms: 10,
                namespaces: vec!["public/default".to_string()],
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
