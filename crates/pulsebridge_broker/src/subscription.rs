//! Subscription cursors and dispatch
//!
//! A `Subscription` is the broker-side cursor a consumer group reads through.
//! It tracks which entries are waiting to be dispatched (`pending`), which are
//! held back until their scheduled delivery time (`delayed`), and which have
//! been handed to a consumer but not acknowledged yet (`unacked`).
//!
//! Dispatch walks `pending` in id order and picks a target consumer per
//! subscription type. A delivery consumes one flow permit from the target.
//! Consumers that subscribed through a `-partition-N` name only see entries
//! from the partitions in their scope.

use std::collections::{BTreeSet, HashMap, HashSet};

use pulsebridge_message::routing::bucket;
use pulsebridge_message::{ConsumerId, Message, MessageId, SessionId, SubscribeRequest, SubscriptionType};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::topic::Partition;

/// Partition indexes a consumer is limited to on one topic.
pub type PartitionScope = HashSet<i32>;

/// A consumer registered with the broker.
#[derive(Debug)]
pub struct ConsumerEntry {
    pub session: SessionId,
    pub name: String,
    pub request: SubscribeRequest,
    /// Base names of every topic this consumer is attached to.
    pub topics: Vec<String>,
    pub permits: u32,
    pub sender: UnboundedSender<Message>,
}

/// Counters exposed for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub pending: usize,
    pub delayed: usize,
    pub unacked: usize,
    pub consumers: usize,
}

#[derive(Debug)]
pub struct Subscription {
    pub name: String,
    pub kind: SubscriptionType,
    /// Attached consumers in attach order.
    pub consumers: Vec<ConsumerId>,
    pending: BTreeSet<MessageId>,
    delayed: BTreeSet<(i64, MessageId)>,
    unacked: HashMap<MessageId, ConsumerId>,
    redeliveries: HashMap<MessageId, u32>,
    /// Consumers without an entry see every partition.
    scopes: HashMap<ConsumerId, PartitionScope>,
    next_shared: usize,
}

impl Subscription {
    pub fn new(name: &str, kind: SubscriptionType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            consumers: Vec::new(),
            pending: BTreeSet::new(),
            delayed: BTreeSet::new(),
            unacked: HashMap::new(),
            redeliveries: HashMap::new(),
            scopes: HashMap::new(),
            next_shared: 0,
        }
    }

    /// Queue a freshly published entry. Entries scheduled in the future wait
    /// in `delayed` until `promote_due` releases them.
    pub fn enqueue(&mut self, id: MessageId, deliver_at: Option<i64>, now: i64) {
        match deliver_at {
            Some(at) if at > now => {
                self.delayed.insert((at, id));
            }
            _ => {
                self.pending.insert(id);
            }
        }
    }

    pub fn attach(&mut self, consumer: ConsumerId, scope: Option<PartitionScope>) {
        if !self.consumers.contains(&consumer) {
            self.consumers.push(consumer);
        }
        match scope {
            Some(scope) => {
                self.scopes.insert(consumer, scope);
            }
            None => {
                self.scopes.remove(&consumer);
            }
        }
    }

    /// Whether `consumer` may receive entries of `partition`.
    pub fn accepts(&self, consumer: ConsumerId, partition: i32) -> bool {
        self.scopes
            .get(&consumer)
            .is_none_or(|scope| scope.contains(&partition))
    }

    /// Whether any attached consumer shares a partition with `scope`.
    pub fn overlaps(&self, scope: Option<&PartitionScope>) -> bool {
        self.consumers
            .iter()
            .any(|consumer| match (self.scopes.get(consumer), scope) {
                (Some(held), Some(wanted)) => !held.is_disjoint(wanted),
                _ => true,
            })
    }

    /// Remove a consumer; everything it held unacknowledged goes back to
    /// `pending` with its redelivery count bumped.
    pub fn detach(&mut self, consumer: ConsumerId) {
        self.consumers.retain(|c| *c != consumer);
        self.scopes.remove(&consumer);
        let held: Vec<MessageId> = self
            .unacked
            .iter()
            .filter(|(_, owner)| **owner == consumer)
            .map(|(id, _)| *id)
            .collect();
        for id in held {
            self.requeue(id);
        }
        if self.consumers.is_empty() {
            self.next_shared = 0;
        }
    }

    /// Acknowledge an entry. Unknown or already acknowledged ids are ignored.
    pub fn ack(&mut self, id: &MessageId) -> bool {
        let known = self.unacked.remove(id).is_some() | self.pending.remove(id);
        self.delayed.retain(|(_, delayed)| delayed != id);
        self.redeliveries.remove(id);
        known
    }

    /// Put an unacknowledged entry back for redelivery. Returns `false` when
    /// the id is not outstanding (acknowledged or never delivered).
    pub fn redeliver(&mut self, id: &MessageId) -> bool {
        if self.unacked.contains_key(id) {
            self.requeue(*id);
            true
        } else {
            false
        }
    }

    /// Ids `consumer` holds unacknowledged.
    pub fn unacked_by(&self, consumer: ConsumerId) -> Vec<MessageId> {
        self.unacked
            .iter()
            .filter(|(_, owner)| **owner == consumer)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn redelivery_count(&self, id: &MessageId) -> u32 {
        self.redeliveries.get(id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            pending: self.pending.len(),
            delayed: self.delayed.len(),
            unacked: self.unacked.len(),
            consumers: self.consumers.len(),
        }
    }

    fn requeue(&mut self, id: MessageId) {
        self.unacked.remove(&id);
        *self.redeliveries.entry(id).or_insert(0) += 1;
        self.pending.insert(id);
    }

    fn promote_due(&mut self, now: i64) {
        while let Some(&(at, id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            self.pending.insert(id);
        }
    }

    /// Hand pending entries to consumers that have permits.
    pub fn dispatch(
        &mut self,
        partitions: &[Partition],
        consumers: &mut HashMap<ConsumerId, ConsumerEntry>,
        now: i64,
    ) {
        self.promote_due(now);
        if self.consumers.is_empty() || self.pending.is_empty() {
            return;
        }

        // Failover picks the active consumer per partition by name order.
        let by_name: Vec<ConsumerId> = if self.kind == SubscriptionType::Failover {
            let mut named: Vec<(&str, ConsumerId)> = self
                .consumers
                .iter()
                .filter_map(|id| consumers.get(id).map(|c| (c.name.as_str(), *id)))
                .collect();
            named.sort();
            named.into_iter().map(|(_, id)| id).collect()
        } else {
            Vec::new()
        };

        let mut blocked_partitions: HashSet<i32> = HashSet::new();
        let mut blocked_keys: HashSet<String> = HashSet::new();
        let candidates: Vec<MessageId> = self.pending.iter().copied().collect();

        for id in candidates {
            let Some(stored) = lookup(partitions, &id) else {
                self.pending.remove(&id);
                continue;
            };

            if blocked_partitions.contains(&id.partition) {
                continue;
            }
            let has_permits =
                |c: &ConsumerId| consumers.get(c).is_some_and(|entry| entry.permits > 0);
            let eligible: Vec<ConsumerId> = self
                .consumers
                .iter()
                .copied()
                .filter(|c| self.accepts(*c, id.partition))
                .collect();

            let target = match self.kind {
                SubscriptionType::Exclusive => match eligible.first() {
                    Some(c) if has_permits(c) => *c,
                    _ => {
                        blocked_partitions.insert(id.partition);
                        continue;
                    }
                },
                SubscriptionType::Failover => {
                    let active: Vec<ConsumerId> = by_name
                        .iter()
                        .copied()
                        .filter(|c| eligible.contains(c))
                        .collect();
                    if active.is_empty() {
                        blocked_partitions.insert(id.partition);
                        continue;
                    }
                    let active = active[id.partition_index() % active.len()];
                    if !has_permits(&active) {
                        blocked_partitions.insert(id.partition);
                        continue;
                    }
                    active
                }
                SubscriptionType::KeyShared => {
                    let key = stored.key().unwrap_or_default();
                    if blocked_keys.contains(key) || eligible.is_empty() {
                        continue;
                    }
                    let owner = eligible[bucket(key, eligible.len())];
                    if !has_permits(&owner) {
                        blocked_keys.insert(key.to_string());
                        continue;
                    }
                    owner
                }
                SubscriptionType::Shared => {
                    let n = self.consumers.len();
                    let Some(offset) = (0..n).find(|offset| {
                        let c = self.consumers[(self.next_shared + offset) % n];
                        has_permits(&c) && eligible.contains(&c)
                    }) else {
                        blocked_partitions.insert(id.partition);
                        continue;
                    };
                    let index = (self.next_shared + offset) % n;
                    self.next_shared = (index + 1) % n;
                    self.consumers[index]
                }
            };

            let Some(entry) = consumers.get_mut(&target) else {
                continue;
            };
            let mut message = stored.clone();
            message.redelivery_count = self.redelivery_count(&id);
            if entry.sender.send(message).is_err() {
                // Receiver is gone; stop feeding it until it is closed.
                entry.permits = 0;
                continue;
            }
            entry.permits -= 1;
            self.pending.remove(&id);
            self.unacked.insert(id, target);
            debug!(
                subscription = %self.name,
                consumer = target,
                message_id = %id,
                "dispatched"
            );
        }
    }
}

fn lookup<'a>(partitions: &'a [Partition], id: &MessageId) -> Option<&'a Message> {
    partitions
        .get(id.partition_index())
        .filter(|p| p.ledger_id == id.ledger_id)
        .and_then(|p| p.entries.get(usize::try_from(id.entry_id).ok()?))
}
