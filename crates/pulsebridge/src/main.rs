//! CLI for pulsebridge
//!
//! Subcommands:
//! - `smoke`: run a trigger and a publisher against an in-process broker
//! - `config`: print the effective settings
//! - `token`: mint a broker token for a subject

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use pulsebridge_broker::{BrokerConfig, BrokerHandle, issue_token};
use pulsebridge_client::{
    Authentication, ConnectionManager, ConnectionOptions, LoopbackConnector, ProducerConfig,
};
use pulsebridge_config::{Settings, load_config};
use pulsebridge_nodes::{
    EmitError, MessageFormat, PublishItem, Publisher, RecordSink, Trigger, TriggerConfig,
    TriggerRecord,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pulsebridge")]
enum Command {
    /// Publish messages through a loopback broker and print what a trigger receives
    Smoke {
        #[arg(long, default_value = "smoke")]
        topic: String,
        #[arg(long, default_value = "smoke-sub")]
        subscription: String,
        /// Number of messages to publish
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// Publish JSON bodies instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as JSON (secrets redacted)
    Config,
    /// Mint an HS256 token signed with the configured broker secret
    Token {
        subject: String,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
        /// Overrides `broker.jwt_secret`
        #[arg(long)]
        secret: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            pulsebridge_utils::logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    pulsebridge_utils::logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Smoke {
            topic,
            subscription,
            count,
            json,
        } => run_smoke(&settings, &topic, &subscription, count, json).await,
        Command::Config => print_config(&settings),
        Command::Token {
            subject,
            ttl,
            secret,
        } => print_token(&settings, &subject, ttl, secret),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
    }
}

/// Prints each record as a JSON line and reports it on `seen`.
struct StdoutSink {
    seen: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl RecordSink for StdoutSink {
    async fn emit(&self, record: TriggerRecord) -> Result<(), EmitError> {
        let line = serde_json::to_string(&record).map_err(|e| EmitError(e.to_string()))?;
        println!("{line}");
        let _ = self.seen.send(());
        Ok(())
    }
}

async fn run_smoke(
    settings: &Settings,
    topic: &str,
    subscription: &str,
    count: usize,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = BrokerHandle::start(BrokerConfig::from(&settings.broker));
    let connector = LoopbackConnector::new();
    connector.register(&settings.client.service_url, broker.clone())?;
    let manager = ConnectionManager::new(
        Arc::new(connector),
        ConnectionOptions::from(&settings.client),
    );

    let auth = Authentication::from_settings(&settings.client)?;
    let timeout = Duration::from_secs(settings.client.operation_timeout_secs);
    let connection = manager
        .open(&settings.client.service_url, &auth, timeout)
        .await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let trigger_config = TriggerConfig {
        receiver_queue_size: settings.consumer.receiver_queue_size,
        receiver_queue_size_across_partitions: settings
            .consumer
            .receiver_queue_size_across_partitions,
        ack_timeout_ms: settings.consumer.ack_timeout_ms,
        nack_redeliver_timeout_ms: settings.consumer.nack_redelivery_delay_ms,
        ..TriggerConfig::new(topic, subscription)
    };
    let trigger = Trigger::new(
        connection.clone(),
        trigger_config,
        Arc::new(StdoutSink { seen: seen_tx }),
    );
    trigger.start().await?;

    let items: Vec<PublishItem> = (0..count)
        .map(|i| PublishItem {
            format: if json { MessageFormat::Json } else { MessageFormat::Raw },
            message: if json {
                serde_json::json!({ "index": i }).to_string()
            } else {
                format!("smoke message {i}")
            },
            producer_name: Some("smoke".to_string()),
            ..PublishItem::new(topic, "")
        })
        .collect();
    let publisher = Publisher::new(
        connection.clone(),
        ProducerConfig::from(&settings.producer),
    );
    let outcomes = publisher.publish(&items).await?;
    let published = outcomes.iter().filter(|o| o.success).count();
    info!(published, failed = outcomes.len() - published, "publish finished");

    let mut received = 0;
    while received < published {
        match tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await {
            Ok(Some(())) => received += 1,
            _ => {
                warn!(received, expected = published, "gave up waiting for records");
                break;
            }
        }
    }

    trigger.stop().await;
    manager.close_all().await;
    info!(received, "smoke run finished");
    Ok(())
}

fn print_config(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let redact = |value: &mut Option<String>| {
        if value.is_some() {
            *value = Some("<redacted>".to_string());
        }
    };
    let mut shown = settings.clone();
    redact(&mut shown.client.auth_token);
    redact(&mut shown.client.auth_password);
    redact(&mut shown.broker.jwt_secret);
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

fn print_token(
    settings: &Settings,
    subject: &str,
    ttl: u64,
    secret: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let secret = secret
        .or_else(|| settings.broker.jwt_secret.clone())
        .ok_or("no secret given and broker.jwt_secret is not set")?;
    let token = issue_token(&secret, subject, Duration::from_secs(ttl))?;
    println!("{token}");
    Ok(())
}
