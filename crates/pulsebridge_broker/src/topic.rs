//! Topic management
//!
//! A `Topic` owns its partitions (append-only entry logs) and the named
//! subscriptions reading them. Non-partitioned topics have exactly one
//! partition whose message ids carry partition `-1`.
//!
//! Concurrency note: callers must synchronize access to `Topic` (for example
//! via the broker lock).

use std::collections::{HashMap, HashSet};

use pulsebridge_message::{Message, MessageId, SubscriptionType, TopicName};

use crate::subscription::Subscription;

/// One append-only entry log.
#[derive(Debug)]
pub struct Partition {
    pub ledger_id: u64,
    pub entries: Vec<Message>,
}

impl Partition {
    pub fn new(ledger_id: u64) -> Self {
        Self {
            ledger_id,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Topic {
    pub name: TopicName,
    pub partitioned: bool,
    pub partitions: Vec<Partition>,
    pub subscriptions: HashMap<String, Subscription>,
    /// Names of producers currently registered on the topic.
    pub producers: HashSet<String>,
}

impl Topic {
    /// Create a topic. `ledger_ids` supplies one id per partition; a single id
    /// with `partitioned == false` makes a non-partitioned topic.
    pub fn new(name: TopicName, partitioned: bool, ledger_ids: Vec<u64>) -> Self {
        Self {
            name,
            partitioned,
            partitions: ledger_ids.into_iter().map(Partition::new).collect(),
            subscriptions: HashMap::new(),
            producers: HashSet::new(),
        }
    }

    /// Partition count as reported to producers; `0` when not partitioned.
    pub fn partition_count(&self) -> u32 {
        if self.partitioned {
            self.partitions.len() as u32
        } else {
            0
        }
    }

    /// Append `message` to `partition`, stamping its id and topic.
    pub fn append(&mut self, partition: usize, mut message: Message) -> Option<MessageId> {
        let partitioned = self.partitioned;
        let topic = if partitioned {
            self.name.partition(partition as u32).to_string()
        } else {
            self.name.to_string()
        };
        let log = self.partitions.get_mut(partition)?;
        let index = if partitioned {
            partition as i32
        } else {
            MessageId::NON_PARTITIONED
        };
        let id = MessageId::new(log.ledger_id, log.entries.len() as u64, index);
        message.id = id;
        message.topic = topic;
        log.entries.push(message);
        Some(id)
    }

    /// Ids of every stored entry, in order. With `compacted` only the latest
    /// entry per key survives within a partition; keyless entries are kept.
    pub fn backlog(&self, compacted: bool) -> Vec<MessageId> {
        let mut ids = Vec::new();
        for partition in &self.partitions {
            if !compacted {
                ids.extend(partition.entries.iter().map(|m| m.id));
                continue;
            }
            let mut latest: HashMap<&str, MessageId> = HashMap::new();
            for message in &partition.entries {
                match message.key() {
                    Some(key) => {
                        latest.insert(key, message.id);
                    }
                    None => ids.push(message.id),
                }
            }
            ids.extend(latest.into_values());
        }
        ids.sort();
        ids
    }

    pub fn subscription_mut(&mut self, name: &str, kind: SubscriptionType) -> &mut Subscription {
        self.subscriptions
            .entry(name.to_string())
            .or_insert_with(|| Subscription::new(name, kind))
    }

    pub fn entry(&self, id: &MessageId) -> Option<&Message> {
        self.partitions
            .get(id.partition_index())
            .filter(|p| p.ledger_id == id.ledger_id)
            .and_then(|p| p.entries.get(id.entry_id as usize))
    }
}
