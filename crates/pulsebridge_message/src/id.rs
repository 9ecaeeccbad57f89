//! Message identifiers
//!
//! A `MessageId` is assigned by the broker when an entry is appended to a
//! partition's ledger. Ordering is lexicographic over `(ledger_id, entry_id,
//! partition)`, which matches append order inside one partition.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    /// Partition index, `-1` for non-partitioned topics.
    pub partition: i32,
}

impl MessageId {
    pub const NON_PARTITIONED: i32 = -1;

    pub fn new(ledger_id: u64, entry_id: u64, partition: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
        }
    }

    /// Index into a topic's partition list (`0` for non-partitioned topics).
    pub fn partition_index(&self) -> usize {
        self.partition.max(0) as usize
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message id '{0}', expected ledger:entry:partition")]
pub struct ParseMessageIdError(String);

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMessageIdError(s.to_string());
        let mut parts = s.split(':');
        let ledger_id = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let entry_id = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let partition = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self::new(ledger_id, entry_id, partition))
    }
}
