//! Partition routing for producers on partitioned topics.

use pulsebridge_message::routing::java_string_hash;

/// How un-keyed messages are spread over partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingMode {
    /// Cycle through partitions message by message.
    #[default]
    RoundRobin,
    /// Send every un-keyed message to one partition picked per producer.
    SinglePartition,
}

#[derive(Debug)]
pub struct MessageRouter {
    mode: RoutingMode,
    seed: u32,
    next: u32,
}

impl MessageRouter {
    /// `producer_name` seeds the partition choice so producers spread out.
    pub fn new(mode: RoutingMode, producer_name: &str) -> Self {
        let seed = java_string_hash(producer_name);
        Self {
            mode,
            seed,
            next: seed,
        }
    }

    /// Pick a partition, `None` for non-partitioned topics. Keyed messages
    /// always land on the key's partition.
    pub fn route(&mut self, key: Option<&str>, partitions: u32) -> Option<u32> {
        if partitions <= 1 {
            return None;
        }
        if let Some(key) = key {
            return Some(java_string_hash(key) % partitions);
        }
        match self.mode {
            RoutingMode::RoundRobin => {
                let partition = self.next % partitions;
                self.next = self.next.wrapping_add(1);
                Some(partition)
            }
            RoutingMode::SinglePartition => Some(self.seed % partitions),
        }
    }
}
