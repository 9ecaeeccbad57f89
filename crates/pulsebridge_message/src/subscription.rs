//! Subscription semantics
//!
//! A subscription is a named cursor over a topic. Its type decides how
//! messages fan out across the consumers attached to it and which ordering
//! guarantee those consumers get.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionType {
    /// One consumer only; a second subscribe attempt is rejected. Messages
    /// arrive in publish order per partition.
    #[default]
    Exclusive,
    /// Any number of consumers; each message goes to exactly one of them,
    /// round-robin. No ordering guarantee across consumers.
    Shared,
    /// Any number of consumers; messages with the same key always reach the
    /// same consumer while membership is stable, so per-key order holds.
    #[serde(rename = "Key_Shared", alias = "KeyShared")]
    KeyShared,
    /// Many consumers may attach but only one is active per partition (first
    /// by consumer name); the others take over when it leaves. In order per
    /// partition.
    Failover,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Exclusive => "Exclusive",
            SubscriptionType::Shared => "Shared",
            SubscriptionType::KeyShared => "Key_Shared",
            SubscriptionType::Failover => "Failover",
        }
    }

    /// Whether more than one consumer may attach at the same time.
    pub fn allows_multiple_consumers(&self) -> bool {
        !matches!(self, SubscriptionType::Exclusive)
    }

    /// Whether reading a compacted view is meaningful for this type.
    pub fn supports_read_compacted(&self) -> bool {
        matches!(self, SubscriptionType::Exclusive | SubscriptionType::Failover)
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for SubscriptionType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "exclusive" => Ok(SubscriptionType::Exclusive),
            "shared" => Ok(SubscriptionType::Shared),
            "keyshared" => Ok(SubscriptionType::KeyShared),
            "failover" => Ok(SubscriptionType::Failover),
            _ => Err(ParseEnumError {
                kind: "subscription type",
                value: s.to_string(),
            }),
        }
    }
}

/// Where a brand-new subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitialPosition {
    #[default]
    Earliest,
    Latest,
}

impl FromStr for InitialPosition {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(InitialPosition::Earliest),
            "latest" => Ok(InitialPosition::Latest),
            _ => Err(ParseEnumError {
                kind: "initial position",
                value: s.to_string(),
            }),
        }
    }
}
