use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pulsebridge_broker::{AuthPolicy, BrokerConfig, BrokerHandle, issue_token};
use pulsebridge_message::routing::java_string_hash;
use pulsebridge_message::{AuthData, Envelope, Message, MessageId, SubscriptionType};
use pulsebridge_utils::clock;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

use crate::{
    Authentication, BatchingConfig, Connection, ConnectionError, ConnectionManager,
    ConnectionOptions, Connector, ConsumerConfig, ConsumerState, Disposition, Error,
    LoopbackConnector, ProducerConfig, ReconnectPolicy, SerializationError, SubscriptionError,
    TopicResolutionError, Transport,
};

const SERVICE_URL: &str = "pulsar://loopback:6650";
const WAIT: Duration = Duration::from_secs(2);

struct Fixture {
    broker: BrokerHandle,
    manager: ConnectionManager,
    connection: Connection,
}

async fn setup_with(config: BrokerConfig, options: ConnectionOptions) -> Fixture {
    let broker = BrokerHandle::start(config);
    let connector = LoopbackConnector::new();
    connector.register(SERVICE_URL, broker.clone()).unwrap();
    let manager = ConnectionManager::new(Arc::new(connector), options);
    let connection = manager
        .open(SERVICE_URL, &Authentication::None, Duration::from_secs(5))
        .await
        .unwrap();
    Fixture {
        broker,
        manager,
        connection,
    }
}

async fn setup() -> Fixture {
    setup_with(BrokerConfig::default(), ConnectionOptions::default()).await
}

fn consumer_config(topic: &str, subscription: &str, kind: SubscriptionType) -> ConsumerConfig {
    ConsumerConfig {
        tick_interval: Duration::from_millis(10),
        ..ConsumerConfig::new(topic, subscription).with_kind(kind)
    }
}

async fn next(consumer: &crate::Consumer) -> Message {
    timeout(WAIT, consumer.receive())
        .await
        .expect("timed out waiting for a message")
        .unwrap()
}

#[tokio::test]
async fn open_rejects_bad_endpoints() {
    let fixture = setup().await;
    let none = Authentication::None;
    let open = |endpoint: &'static str| {
        fixture
            .manager
            .open(endpoint, &none, Duration::from_secs(1))
    };

    assert!(matches!(
        open("not a url").await,
        Err(Error::Connection(ConnectionError::InvalidUrl(_)))
    ));
    assert_eq!(
        open("http://loopback:6650").await.unwrap_err(),
        Error::Connection(ConnectionError::UnsupportedScheme("http".to_string()))
    );
    assert!(matches!(
        open("pulsar://elsewhere:6650").await,
        Err(Error::Connection(ConnectionError::Unreachable(_)))
    ));
}

#[tokio::test]
async fn open_reuses_connections_per_endpoint_and_auth() {
    let fixture = setup().await;
    let again = fixture
        .manager
        .open(SERVICE_URL, &Authentication::None, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(again.same_as(&fixture.connection));
    assert_eq!(fixture.manager.open_connections().await, 1);

    let token = Authentication::Token("anything".to_string());
    let other = fixture
        .manager
        .open(SERVICE_URL, &token, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!other.same_as(&fixture.connection));
    assert_eq!(fixture.manager.open_connections().await, 2);

    fixture.manager.close_all().await;
    assert!(fixture.connection.is_closed());
    assert_eq!(fixture.manager.open_connections().await, 0);
}

#[tokio::test]
async fn concurrent_opens_share_one_connection() {
    let fixture = setup().await;
    fixture.manager.close_all().await;

    let token = Authentication::Token("t".to_string());
    let opens = (0..8).map(|_| {
        fixture
            .manager
            .open(SERVICE_URL, &token, Duration::from_secs(1))
    });
    let connections: Vec<Connection> = futures::future::try_join_all(opens).await.unwrap();
    assert!(connections.iter().all(|c| c.same_as(&connections[0])));
    assert_eq!(fixture.manager.open_connections().await, 1);
    assert_eq!(fixture.broker.lock().session_count(), 1);
}

/// Stalls handshakes to the host `slow`.
struct SlowConnector(LoopbackConnector);

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, endpoint: &Url, auth: &AuthData) -> crate::Result<Arc<dyn Transport>> {
        if endpoint.host_str() == Some("slow") {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        self.0.connect(endpoint, auth).await
    }
}

#[tokio::test]
async fn slow_handshake_does_not_block_other_endpoints() {
    let broker = BrokerHandle::start(BrokerConfig::default());
    let connector = LoopbackConnector::new();
    connector.register(SERVICE_URL, broker.clone()).unwrap();
    connector.register("pulsar://slow:6650", broker).unwrap();
    let manager = ConnectionManager::new(
        Arc::new(SlowConnector(connector)),
        ConnectionOptions::default(),
    );

    let slow = manager.open(
        "pulsar://slow:6650",
        &Authentication::None,
        Duration::from_millis(500),
    );
    let fast = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        let connection = manager
            .open(SERVICE_URL, &Authentication::None, Duration::from_secs(1))
            .await;
        (connection, started.elapsed())
    };
    let (slow, (fast, elapsed)) = tokio::join!(slow, fast);

    assert!(matches!(
        slow,
        Err(Error::Connection(ConnectionError::Timeout(_)))
    ));
    assert!(fast.is_ok());
    assert!(elapsed < Duration::from_millis(250), "fast open took {elapsed:?}");
}

#[tokio::test]
async fn open_with_bad_token_is_rejected() {
    let config = BrokerConfig {
        auth: AuthPolicy {
            allow_anonymous: false,
            jwt_secret: Some("s3cret".to_string()),
            ..AuthPolicy::default()
        },
        ..BrokerConfig::default()
    };
    let broker = BrokerHandle::start(config);
    let connector = LoopbackConnector::new();
    connector.register(SERVICE_URL, broker.clone()).unwrap();
    let manager = ConnectionManager::new(Arc::new(connector), ConnectionOptions::default());

    let bad = Authentication::Token("not-a-jwt".to_string());
    assert!(matches!(
        manager.open(SERVICE_URL, &bad, Duration::from_secs(1)).await,
        Err(Error::Connection(ConnectionError::AuthRejected(_)))
    ));

    let token = issue_token("s3cret", "alice", Duration::from_secs(60)).unwrap();
    let connection = manager
        .open(SERVICE_URL, &Authentication::Token(token), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!connection.is_closed());
    assert_eq!(broker.lock().session_count(), 1);
}

#[tokio::test]
async fn keyed_messages_arrive_in_order() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("orders", "audit", SubscriptionType::Exclusive))
        .await
        .unwrap();
    assert_eq!(consumer.state(), ConsumerState::Active);
    let producer = fixture
        .connection
        .create_producer("orders", ProducerConfig::default())
        .await
        .unwrap();

    for i in 0..10 {
        producer
            .send(Envelope::new(format!("m{i}")).with_partition_key("customer-1"))
            .await
            .unwrap();
    }

    let mut last: Option<MessageId> = None;
    for i in 0..10u64 {
        let message = next(&consumer).await;
        assert_eq!(message.payload_str(), format!("m{i}"));
        assert_eq!(message.sequence_id, i);
        assert_eq!(message.key(), Some("customer-1"));
        assert!(last.is_none_or(|prev| prev < message.id));
        last = Some(message.id);
        consumer.acknowledge(message.id).await.unwrap();
    }
    assert_eq!(consumer.unacked(), 0);

    producer.close().await;
    consumer.close().await;
}

#[tokio::test]
async fn shared_subscription_spreads_messages() {
    let fixture = setup().await;
    let config = consumer_config("jobs", "workers", SubscriptionType::Shared);
    let first = fixture.connection.subscribe(config.clone()).await.unwrap();
    let second = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("jobs", ProducerConfig::default())
        .await
        .unwrap();

    for i in 0..4 {
        producer.send(Envelope::new(format!("j{i}"))).await.unwrap();
    }

    let mut seen = Vec::new();
    for consumer in [&first, &first, &second, &second] {
        seen.push(next(consumer).await.payload_str().into_owned());
    }
    seen.sort();
    assert_eq!(seen, vec!["j0", "j1", "j2", "j3"]);
}

#[tokio::test]
async fn acknowledge_twice_is_harmless() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("acks", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("acks", ProducerConfig::default())
        .await
        .unwrap();
    producer.send(Envelope::new("once")).await.unwrap();

    let message = next(&consumer).await;
    consumer.acknowledge(message.id).await.unwrap();
    consumer.acknowledge(message.id).await.unwrap();

    let stats = fixture
        .broker
        .lock()
        .subscription_stats("acks", "s")
        .unwrap();
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(consumer.unacked(), 0);
}

#[tokio::test]
async fn unacked_message_is_redelivered_after_ack_timeout() {
    let fixture = setup().await;
    let config = ConsumerConfig {
        ack_timeout: Some(Duration::from_millis(50)),
        ..consumer_config("slow", "s", SubscriptionType::Shared)
    };
    let consumer = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("slow", ProducerConfig::default())
        .await
        .unwrap();
    producer.send(Envelope::new("retry me")).await.unwrap();

    let first = next(&consumer).await;
    assert_eq!(first.redelivery_count, 0);

    let again = next(&consumer).await;
    assert_eq!(again.id, first.id);
    assert_eq!(again.redelivery_count, 1);
    assert_eq!(consumer.redelivery_count(&again.id), Some(1));

    consumer.acknowledge(again.id).await.unwrap();
    assert!(timeout(Duration::from_millis(150), consumer.receive()).await.is_err());
}

#[tokio::test]
async fn negative_ack_redelivers() {
    let fixture = setup().await;
    let config = ConsumerConfig {
        ack_timeout: None,
        ..consumer_config("nacks", "s", SubscriptionType::Shared)
    };
    let consumer = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("nacks", ProducerConfig::default())
        .await
        .unwrap();
    producer.send(Envelope::new("bad")).await.unwrap();

    let first = next(&consumer).await;
    consumer.negative_acknowledge(first.id).await.unwrap();
    let again = next(&consumer).await;
    assert_eq!(again.id, first.id);
    assert_eq!(again.redelivery_count, 1);
}

#[tokio::test]
async fn negative_ack_waits_for_the_delay() {
    let fixture = setup().await;
    let delay = Duration::from_millis(100);
    let config = ConsumerConfig {
        ack_timeout: None,
        nack_redelivery_delay: delay,
        ..consumer_config("later", "s", SubscriptionType::Shared)
    };
    let consumer = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("later", ProducerConfig::default())
        .await
        .unwrap();
    producer.send(Envelope::new("x")).await.unwrap();

    let first = next(&consumer).await;
    let nacked_at = tokio::time::Instant::now();
    consumer.negative_acknowledge(first.id).await.unwrap();
    let again = next(&consumer).await;
    assert_eq!(again.id, first.id);
    assert!(nacked_at.elapsed() >= delay);
}

#[tokio::test]
async fn scheduled_message_is_held_back() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("timers", "s", SubscriptionType::Shared))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("timers", ProducerConfig::default())
        .await
        .unwrap();

    producer
        .send(Envelope::new("wake up").deliver_after(Duration::from_millis(100)))
        .await
        .unwrap();
    let message = next(&consumer).await;
    let received_at = clock::now_millis();

    assert_eq!(message.deliver_at, Some(message.publish_time + 100));
    assert!(received_at >= message.publish_time + 100);
}

#[tokio::test]
async fn closing_the_connection_cancels_sessions() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("cancel", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("cancel", ProducerConfig::default())
        .await
        .unwrap();
    producer.send(Envelope::new("m")).await.unwrap();
    let message = next(&consumer).await;

    let pending = tokio::spawn({
        let connection = fixture.connection.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            connection.close().await;
        }
    });
    // nothing else is queued, so this waits until the close lands
    assert_eq!(consumer.receive().await.unwrap_err(), Error::Cancelled);
    pending.await.unwrap();

    assert_eq!(consumer.acknowledge(message.id).await, Err(Error::Cancelled));
    assert_eq!(
        producer.send(Envelope::new("late")).await,
        Err(Error::Cancelled)
    );
    assert_eq!(fixture.broker.lock().session_count(), 0);
    fixture.connection.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("closing", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("closing", ProducerConfig::default())
        .await
        .unwrap();
    producer.send(Envelope::new("m")).await.unwrap();
    let message = next(&consumer).await;

    consumer.close().await;
    consumer.close().await;
    producer.close().await;
    producer.close().await;

    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(
        consumer.acknowledge(message.id).await,
        Err(Error::Closed("consumer"))
    );
    assert_eq!(consumer.receive().await.unwrap_err(), Error::Closed("consumer"));
    assert_eq!(
        producer.send(Envelope::new("m")).await,
        Err(Error::Closed("producer"))
    );

    let broker = fixture.broker.lock();
    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(broker.producer_count(), 0);
    // the unacked message went back to the subscription
    assert_eq!(broker.subscription_stats("closing", "s").unwrap().pending, 1);
}

#[tokio::test]
async fn sessions_recover_after_broker_restart() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("durable", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("durable", ProducerConfig::default().with_name("writer"))
        .await
        .unwrap();

    producer.send(Envelope::new("before")).await.unwrap();
    let before = next(&consumer).await;
    consumer.acknowledge(before.id).await.unwrap();

    fixture.broker.lock().sever_connections();

    producer.send(Envelope::new("after")).await.unwrap();
    assert_eq!(producer.name(), "writer");
    let after = next(&consumer).await;
    assert_eq!(after.payload_str(), "after");
    assert_eq!(after.sequence_id, 1);
    assert_eq!(consumer.state(), ConsumerState::Active);
    consumer.acknowledge(after.id).await.unwrap();
}

#[tokio::test]
async fn consumer_fails_when_reconnect_is_exhausted() {
    let options = ConnectionOptions {
        reconnect: ReconnectPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_attempts: 2,
        },
        ..ConnectionOptions::default()
    };
    let fixture = setup_with(BrokerConfig::default(), options).await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("gone", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();

    {
        let mut broker = fixture.broker.lock();
        broker.set_available(false);
        broker.sever_connections();
    }

    let err = timeout(WAIT, consumer.receive()).await.unwrap().unwrap_err();
    assert_eq!(
        err,
        Error::Connection(ConnectionError::ReconnectFailed { attempts: 2 })
    );
    assert_eq!(consumer.state(), ConsumerState::Failed);
}

#[tokio::test]
async fn batches_flush_on_size_and_timer() {
    let fixture = setup().await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("batched", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let config = ProducerConfig {
        batching: Some(BatchingConfig {
            max_messages: 3,
            max_delay: Duration::from_millis(50),
        }),
        ..ProducerConfig::default()
    };
    let producer = fixture
        .connection
        .create_producer("batched", config)
        .await
        .unwrap();

    // two messages wait for the timer
    let a = producer.send_async(Envelope::new("a")).await.unwrap();
    let b = producer.send_async(Envelope::new("b")).await.unwrap();
    let (a, b) = (a.wait().await.unwrap(), b.wait().await.unwrap());
    assert!(a < b);

    // the third message of a batch flushes it
    let mut receipts = Vec::new();
    for payload in ["c", "d", "e"] {
        receipts.push(producer.send_async(Envelope::new(payload)).await.unwrap());
    }
    for receipt in receipts {
        receipt.wait().await.unwrap();
    }

    let mut sequence = Vec::new();
    for _ in 0..5 {
        sequence.push(next(&consumer).await.sequence_id);
    }
    assert_eq!(sequence, vec![0, 1, 2, 3, 4]);
    producer.close().await;
}

#[tokio::test]
async fn oversized_payload_does_not_use_a_sequence_id() {
    let config = BrokerConfig {
        max_message_size: 16,
        ..BrokerConfig::default()
    };
    let fixture = setup_with(config, ConnectionOptions::default()).await;
    let consumer = fixture
        .connection
        .subscribe(consumer_config("small", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("small", ProducerConfig::default())
        .await
        .unwrap();

    assert_eq!(
        producer.send(Envelope::new(vec![0u8; 17])).await,
        Err(Error::Serialization(SerializationError::PayloadTooLarge {
            size: 17,
            max: 16
        }))
    );
    producer.send(Envelope::new("fits")).await.unwrap();
    assert_eq!(next(&consumer).await.sequence_id, 0);
}

#[tokio::test]
async fn producer_names_are_unique_per_topic() {
    let fixture = setup().await;
    let config = ProducerConfig::default().with_name("dup");
    let _first = fixture
        .connection
        .create_producer("names", config.clone())
        .await
        .unwrap();
    assert_eq!(
        fixture.connection.create_producer("names", config).await.unwrap_err(),
        Error::TopicResolution(TopicResolutionError::ProducerBusy("dup".to_string()))
    );
}

#[tokio::test]
async fn subscription_conflicts_are_reported() {
    let fixture = setup().await;
    let _owner = fixture
        .connection
        .subscribe(consumer_config("conflict", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();

    let busy = fixture
        .connection
        .subscribe(consumer_config("conflict", "s", SubscriptionType::Exclusive))
        .await;
    assert!(matches!(
        busy,
        Err(Error::Subscription(SubscriptionError::ConsumerBusy(_)))
    ));

    let mismatch = fixture
        .connection
        .subscribe(consumer_config("conflict", "s", SubscriptionType::Shared))
        .await;
    assert!(matches!(
        mismatch,
        Err(Error::Subscription(SubscriptionError::IncompatibleType(_)))
    ));
}

#[tokio::test]
async fn invalid_consumer_configs_are_rejected() {
    let fixture = setup().await;
    let invalid = |result: crate::Result<crate::Consumer>| {
        matches!(
            result,
            Err(Error::Subscription(SubscriptionError::InvalidConfig(_)))
        )
    };

    let unnamed = consumer_config("t", "", SubscriptionType::Shared);
    assert!(invalid(fixture.connection.subscribe(unnamed).await));

    let compacted = ConsumerConfig {
        read_compacted: true,
        ..consumer_config("t", "s", SubscriptionType::Shared)
    };
    assert!(invalid(fixture.connection.subscribe(compacted).await));

    let no_topic = ConsumerConfig {
        topic: None,
        ..consumer_config("t", "s", SubscriptionType::Shared)
    };
    assert!(invalid(fixture.connection.subscribe(no_topic).await));

    let no_queue = ConsumerConfig {
        max_total_receiver_queue_size_across_partitions: 0,
        ..consumer_config("t", "s", SubscriptionType::Shared)
    };
    assert!(invalid(fixture.connection.subscribe(no_queue).await));
}

#[tokio::test]
async fn unknown_topic_without_auto_creation() {
    let config = BrokerConfig {
        allow_auto_topic_creation: false,
        ..BrokerConfig::default()
    };
    let fixture = setup_with(config, ConnectionOptions::default()).await;
    assert!(matches!(
        fixture
            .connection
            .create_producer("missing", ProducerConfig::default())
            .await,
        Err(Error::TopicResolution(TopicResolutionError::NotFound(_)))
    ));
    assert!(matches!(
        fixture
            .connection
            .create_producer("persistent://public", ProducerConfig::default())
            .await,
        Err(Error::TopicResolution(TopicResolutionError::Invalid(_)))
    ));
}

#[tokio::test]
async fn listener_acks_and_nacks() {
    let fixture = setup().await;
    let config = ConsumerConfig {
        ack_timeout: None,
        ..consumer_config("pushed", "s", SubscriptionType::Shared)
    };
    let consumer = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("pushed", ProducerConfig::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = consumer
        .listen(move |message: Message| {
            let tx = tx.clone();
            async move {
                let first_attempt = message.redelivery_count == 0;
                let _ = tx.send((message.payload_str().into_owned(), message.redelivery_count));
                if first_attempt {
                    Disposition::Nack
                } else {
                    Disposition::Ack
                }
            }
        })
        .unwrap();

    let second = consumer.listen(|_message: Message| async { Disposition::Ack });
    assert!(matches!(
        second,
        Err(Error::Subscription(SubscriptionError::InvalidConfig(_)))
    ));

    producer.send(Envelope::new("hello")).await.unwrap();
    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let retry = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, ("hello".to_string(), 0));
    assert_eq!(retry, ("hello".to_string(), 1));

    handle.stop().await;
    assert_eq!(consumer.unacked(), 0);
    // a new listener may attach once the old one stopped
    let again = consumer
        .listen(|_message: Message| async { Disposition::Ack })
        .unwrap();
    again.stop().await;
}

#[tokio::test]
async fn keyed_messages_stick_to_a_partition() {
    let fixture = setup().await;
    fixture
        .broker
        .lock()
        .create_partitioned_topic("persistent://public/default/sharded", 4)
        .unwrap();
    let consumer = fixture
        .connection
        .subscribe(consumer_config("sharded", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("sharded", ProducerConfig::default())
        .await
        .unwrap();
    assert_eq!(producer.partitions(), 4);

    for key in ["alpha", "beta", "alpha", "beta"] {
        producer
            .send(Envelope::new(key).with_partition_key(key))
            .await
            .unwrap();
    }
    for _ in 0..4 {
        let message = next(&consumer).await;
        let key = message.key().unwrap();
        let expected = java_string_hash(key) % 4;
        assert!(
            message
                .topic
                .ends_with(&format!("-partition-{expected}")),
            "{} routed to {}",
            key,
            message.topic
        );
        assert_eq!(message.id.partition, expected as i32);
    }
}

#[tokio::test]
async fn permits_are_returned_in_chunks() {
    let fixture = setup().await;
    let config = ConsumerConfig {
        receiver_queue_size: 4,
        ack_timeout: None,
        ..consumer_config("flow", "s", SubscriptionType::Exclusive)
    };
    let consumer = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("flow", ProducerConfig::default())
        .await
        .unwrap();
    for i in 0..10 {
        producer.send(Envelope::new(format!("f{i}"))).await.unwrap();
    }

    let stats = |broker: &BrokerHandle| broker.lock().subscription_stats("flow", "s").unwrap();
    assert_eq!(stats(&fixture.broker).unacked, 4);
    assert_eq!(stats(&fixture.broker).pending, 6);

    let first = next(&consumer).await;
    consumer.acknowledge(first.id).await.unwrap();
    // one released permit is below the threshold
    assert_eq!(stats(&fixture.broker).pending, 6);

    let second = next(&consumer).await;
    consumer.acknowledge(second.id).await.unwrap();
    assert_eq!(stats(&fixture.broker).unacked, 4);
    assert_eq!(stats(&fixture.broker).pending, 4);
}

#[tokio::test]
async fn ordering_key_decides_the_partition() {
    let fixture = setup().await;
    fixture
        .broker
        .lock()
        .create_partitioned_topic("persistent://public/default/okeys", 4)
        .unwrap();
    let consumer = fixture
        .connection
        .subscribe(consumer_config("okeys", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("okeys", ProducerConfig::default())
        .await
        .unwrap();

    // the partition keys alone would land on different partitions
    assert_ne!(java_string_hash("a") % 4, java_string_hash("b") % 4);
    for (payload, partition_key) in [("m0", "b"), ("m1", "a")] {
        producer
            .send(
                Envelope::new(payload)
                    .with_ordering_key("order-1")
                    .with_partition_key(partition_key),
            )
            .await
            .unwrap();
    }

    let expected = (java_string_hash("order-1") % 4) as i32;
    let first = next(&consumer).await;
    let second = next(&consumer).await;
    assert_eq!(first.payload_str(), "m0");
    assert_eq!(second.payload_str(), "m1");
    assert_eq!(first.id.partition, expected);
    assert_eq!(second.id.partition, expected);
}

#[tokio::test]
async fn producer_on_a_partition_name_stays_there() {
    let fixture = setup().await;
    fixture
        .broker
        .lock()
        .create_partitioned_topic("persistent://public/default/pinned", 4)
        .unwrap();
    let consumer = fixture
        .connection
        .subscribe(consumer_config("pinned", "s", SubscriptionType::Exclusive))
        .await
        .unwrap();
    let producer = fixture
        .connection
        .create_producer("pinned-partition-2", ProducerConfig::default())
        .await
        .unwrap();
    assert_eq!(producer.partition(), Some(2));

    for key in ["w", "x", "y", "z"] {
        producer
            .send(Envelope::new(key).with_partition_key(key))
            .await
            .unwrap();
    }
    for _ in 0..4 {
        let message = next(&consumer).await;
        assert_eq!(message.id.partition, 2);
        assert!(message.topic.ends_with("-partition-2"), "{}", message.topic);
    }
}

#[tokio::test]
async fn queue_across_partitions_caps_permits() {
    let fixture = setup().await;
    fixture
        .broker
        .lock()
        .create_partitioned_topic("persistent://public/default/capped", 4)
        .unwrap();
    let config = ConsumerConfig {
        receiver_queue_size: 10,
        max_total_receiver_queue_size_across_partitions: 3,
        ack_timeout: None,
        ..consumer_config("capped", "s", SubscriptionType::Exclusive)
    };
    assert_eq!(config.effective_queue_size(), 3);
    let _consumer = fixture.connection.subscribe(config).await.unwrap();
    let producer = fixture
        .connection
        .create_producer("capped", ProducerConfig::default())
        .await
        .unwrap();
    for i in 0..6 {
        producer.send(Envelope::new(format!("c{i}"))).await.unwrap();
    }

    let stats = fixture.broker.lock().subscription_stats("capped", "s").unwrap();
    assert_eq!(stats.unacked, 3);
    assert_eq!(stats.pending, 3);
}

#[test]
fn auth_methods_from_settings() {
    let settings = |method: &str| pulsebridge_config::ClientSettings {
        auth_method: method.to_string(),
        auth_token: Some("t0k".to_string()),
        ..pulsebridge_config::Settings::default().client
    };

    assert_eq!(
        Authentication::from_settings(&settings("jwt")).unwrap(),
        Authentication::Token("t0k".to_string())
    );
    for method in ["kerberos", "athenz"] {
        let err = Authentication::from_settings(&settings(method)).unwrap_err();
        assert_eq!(
            err,
            Error::Connection(ConnectionError::AuthRejected(format!(
                "{method} authentication is not supported"
            )))
        );
    }
}
