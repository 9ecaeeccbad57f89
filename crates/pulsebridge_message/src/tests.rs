use std::time::Duration;

use crate::routing::{bucket, java_string_hash};
use crate::{
    DeliverySchedule, Envelope, InitialPosition, MessageId, SubscriptionType, TopicError,
    TopicName, TopicPattern, TopicSelector,
};

#[test]
fn test_short_topic_name_expands_to_default_namespace() {
    let topic = TopicName::parse("orders").unwrap();
    assert_eq!(topic.to_string(), "persistent://public/default/orders");
    assert_eq!(topic.namespace(), "public/default");
    assert!(topic.is_persistent());
}

#[test]
fn test_three_segment_topic_name() {
    let topic = TopicName::parse("acme/billing/invoices").unwrap();
    assert_eq!(topic.to_string(), "persistent://acme/billing/invoices");
    assert_eq!(topic.tenant(), "acme");
}

#[test]
fn test_fully_qualified_non_persistent_topic() {
    let topic = TopicName::parse("non-persistent://acme/billing/ticks").unwrap();
    assert!(!topic.is_persistent());
    assert_eq!(topic.local_name(), "ticks");
}

#[test]
fn test_invalid_topic_names() {
    assert_eq!(TopicName::parse("  "), Err(TopicError::Empty));
    assert!(matches!(
        TopicName::parse("a/b"),
        Err(TopicError::InvalidName(_))
    ));
    assert!(matches!(
        TopicName::parse("persistent://only-one"),
        Err(TopicError::InvalidName(_))
    ));
    assert!(matches!(
        TopicName::parse("bogus://a/b/c"),
        Err(TopicError::UnknownDomain(_))
    ));
    assert!(matches!(
        TopicName::parse("has space"),
        Err(TopicError::InvalidName(_))
    ));
}

#[test]
fn test_partition_names() {
    let topic = TopicName::parse("orders").unwrap();
    let p2 = topic.partition(2);
    assert_eq!(p2.to_string(), "persistent://public/default/orders-partition-2");
    assert_eq!(p2.partition_index(), Some(2));
    assert_eq!(p2.base(), topic);
    assert_eq!(topic.partition_index(), None);
}

#[test]
fn test_pattern_matches_within_namespace() {
    let pattern = TopicPattern::parse("orders-.*").unwrap();
    assert_eq!(pattern.namespace(), "public/default");
    assert!(pattern.matches(&TopicName::parse("orders-eu").unwrap()));
    assert!(!pattern.matches(&TopicName::parse("payments").unwrap()));
    assert!(!pattern.matches(&TopicName::parse("acme/other/orders-eu").unwrap()));
}

#[test]
fn test_pattern_with_explicit_namespace() {
    let pattern = TopicPattern::parse("persistent://acme/billing/inv.*").unwrap();
    assert!(pattern.matches(&TopicName::parse("acme/billing/invoices").unwrap()));
    assert!(!pattern.matches(&TopicName::parse("invoices").unwrap()));
}

#[test]
fn test_invalid_pattern_is_rejected() {
    assert!(matches!(
        TopicPattern::parse("orders-(unclosed"),
        Err(TopicError::InvalidPattern { .. })
    ));
    assert!(matches!(
        TopicPattern::parse("persistent://acme/bil.*/x"),
        Err(TopicError::InvalidPattern { .. })
    ));
}

#[test]
fn test_selector_precedence() {
    let topics = vec!["a".to_string(), "b".to_string()];
    let selector = TopicSelector::from_parts(Some("c"), &topics, Some("d-.*")).unwrap();
    assert!(selector.pattern().is_some());

    let selector = TopicSelector::from_parts(Some("c"), &topics, None).unwrap();
    assert_eq!(selector.named_topics().len(), 2);

    let selector = TopicSelector::from_parts(Some("c"), &[], Some("")).unwrap();
    assert_eq!(
        selector.named_topics(),
        vec![TopicName::parse("c").unwrap()]
    );

    assert!(matches!(
        TopicSelector::from_parts(None, &[], None),
        Err(TopicError::NoTopic)
    ));
}

#[test]
fn test_message_id_order_and_display() {
    let a = MessageId::new(1, 5, -1);
    let b = MessageId::new(1, 6, -1);
    let c = MessageId::new(2, 0, 0);
    assert!(a < b && b < c);
    assert_eq!(a.to_string(), "1:5:-1");
    assert_eq!("1:5:-1".parse::<MessageId>().unwrap(), a);
    assert!("1:5".parse::<MessageId>().is_err());
    assert!("1:5:0:9".parse::<MessageId>().is_err());
    assert_eq!(a.partition_index(), 0);
    assert_eq!(MessageId::new(3, 0, 4).partition_index(), 4);
}

#[test]
fn test_subscription_type_parsing() {
    assert_eq!("Exclusive".parse(), Ok(SubscriptionType::Exclusive));
    assert_eq!("Key_Shared".parse(), Ok(SubscriptionType::KeyShared));
    assert_eq!("keyshared".parse(), Ok(SubscriptionType::KeyShared));
    assert_eq!("FAILOVER".parse(), Ok(SubscriptionType::Failover));
    assert!("Broadcast".parse::<SubscriptionType>().is_err());
    assert_eq!("latest".parse(), Ok(InitialPosition::Latest));

    let json = serde_json::to_string(&SubscriptionType::KeyShared).unwrap();
    assert_eq!(json, "\"Key_Shared\"");
    let parsed: SubscriptionType = serde_json::from_str("\"KeyShared\"").unwrap();
    assert_eq!(parsed, SubscriptionType::KeyShared);
}

#[test]
fn test_subscription_type_capabilities() {
    assert!(!SubscriptionType::Exclusive.allows_multiple_consumers());
    assert!(SubscriptionType::Failover.allows_multiple_consumers());
    assert!(SubscriptionType::Failover.supports_read_compacted());
    assert!(!SubscriptionType::Shared.supports_read_compacted());
}

#[test]
fn test_delivery_schedule_resolution() {
    assert_eq!(DeliverySchedule::At(5_000).resolve(1_000), 5_000);
    assert_eq!(DeliverySchedule::After(250).resolve(1_000), 1_250);

    let envelope = Envelope::new("x").deliver_after(Duration::from_millis(300));
    assert_eq!(envelope.delivery, Some(DeliverySchedule::After(300)));
}

#[test]
fn test_envelope_builder_and_routing_key() {
    let envelope = Envelope::new("payload")
        .with_property("k", "v")
        .with_ordering_key("order-1");
    assert_eq!(envelope.routing_key(), Some("order-1"));
    assert_eq!(envelope.properties.get("k").map(String::as_str), Some("v"));

    // the ordering key wins so every message sharing it lands on one partition
    let envelope = envelope.with_partition_key("p");
    assert_eq!(envelope.routing_key(), Some("order-1"));
    assert_eq!(Envelope::new("x").with_partition_key("p").routing_key(), Some("p"));

    let envelope = Envelope::json(&serde_json::json!({"a": 1})).unwrap();
    assert_eq!(envelope.payload, br#"{"a":1}"#.to_vec());
}

#[test]
fn test_java_string_hash_matches_java() {
    assert_eq!(java_string_hash(""), 0);
    assert_eq!(java_string_hash("a"), 97);
    assert_eq!(java_string_hash("ab"), 3105);
    // "polygenelubricants".hashCode() == Integer.MIN_VALUE, masked to 0
    assert_eq!(java_string_hash("polygenelubricants"), 0);
    assert_eq!(bucket("anything", 0), 0);
    assert!(bucket("anything", 3) < 3);
}
