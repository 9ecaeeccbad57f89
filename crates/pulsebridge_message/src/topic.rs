//! Topic addressing
//!
//! Topics are named `{domain}://{tenant}/{namespace}/{local}`. Short names are
//! expanded the same way a Pulsar client expands them:
//!
//! - `orders` becomes `persistent://public/default/orders`
//! - `acme/billing/orders` becomes `persistent://acme/billing/orders`
//!
//! A local name ending in `-partition-N` addresses partition `N` of a
//! partitioned topic.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

pub const DEFAULT_TENANT: &str = "public";
pub const DEFAULT_NAMESPACE: &str = "default";
const PARTITION_SUFFIX: &str = "-partition-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic name is empty")]
    Empty,
    #[error("invalid topic name '{0}'")]
    InvalidName(String),
    #[error("unknown topic domain '{0}'")]
    UnknownDomain(String),
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("no topic, topic list or topic pattern given")]
    NoTopic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicDomain {
    Persistent,
    NonPersistent,
}

impl TopicDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicDomain::Persistent => "persistent",
            TopicDomain::NonPersistent => "non-persistent",
        }
    }
}

impl FromStr for TopicDomain {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(TopicDomain::Persistent),
            "non-persistent" => Ok(TopicDomain::NonPersistent),
            other => Err(TopicError::UnknownDomain(other.to_string())),
        }
    }
}

/// Fully qualified topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    domain: TopicDomain,
    tenant: String,
    namespace: String,
    local_name: String,
}

impl TopicName {
    pub fn parse(name: &str) -> Result<Self, TopicError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TopicError::Empty);
        }

        let (domain, rest) = match name.split_once("://") {
            Some((domain, rest)) => (domain.parse()?, rest),
            None => (TopicDomain::Persistent, name),
        };

        let segments: Vec<&str> = rest.split('/').collect();
        let (tenant, namespace, local_name) = match segments.as_slice() {
            [local] if !name.contains("://") => (DEFAULT_TENANT, DEFAULT_NAMESPACE, *local),
            [tenant, namespace, local] => (*tenant, *namespace, *local),
            _ => return Err(TopicError::InvalidName(name.to_string())),
        };

        for segment in [tenant, namespace, local_name] {
            if !is_valid_segment(segment) {
                return Err(TopicError::InvalidName(name.to_string()));
            }
        }

        Ok(Self {
            domain,
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            local_name: local_name.to_string(),
        })
    }

    pub fn domain(&self) -> TopicDomain {
        self.domain
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// `tenant/namespace`, the unit authorization is granted on.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.tenant, self.namespace)
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn is_persistent(&self) -> bool {
        self.domain == TopicDomain::Persistent
    }

    /// Partition index when this name addresses a single partition.
    pub fn partition_index(&self) -> Option<u32> {
        let (_, index) = self.local_name.rsplit_once(PARTITION_SUFFIX)?;
        index.parse().ok()
    }

    /// Name of the partitioned topic this partition belongs to (or `self`).
    pub fn base(&self) -> TopicName {
        match self.local_name.rsplit_once(PARTITION_SUFFIX) {
            Some((base, index)) if index.parse::<u32>().is_ok() => TopicName {
                local_name: base.to_string(),
                ..self.clone()
            },
            _ => self.clone(),
        }
    }

    /// Name of partition `index` of this topic.
    pub fn partition(&self, index: u32) -> TopicName {
        let base = self.base();
        TopicName {
            local_name: format!("{}{}{}", base.local_name, PARTITION_SUFFIX, index),
            ..base
        }
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.domain.as_str(),
            self.tenant,
            self.namespace,
            self.local_name
        )
    }
}

impl FromStr for TopicName {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicName::parse(s)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '=' | ':'))
}

/// Regular expression over full topic names inside one namespace.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    namespace: String,
    regex: Regex,
}

impl TopicPattern {
    /// Parse a pattern such as `persistent://public/default/orders-.*` or the
    /// short form `orders-.*`. Tenant and namespace must be literal.
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        let pattern = pattern.trim();
        let invalid = |reason: &str| TopicError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let (domain, rest) = match pattern.split_once("://") {
            Some((domain, rest)) => (domain.parse::<TopicDomain>()?, rest.to_string()),
            None if pattern.matches('/').count() == 2 => {
                (TopicDomain::Persistent, pattern.to_string())
            }
            None => (
                TopicDomain::Persistent,
                format!("{DEFAULT_TENANT}/{DEFAULT_NAMESPACE}/{pattern}"),
            ),
        };

        let mut parts = rest.splitn(3, '/');
        let (Some(tenant), Some(namespace), Some(local)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected tenant/namespace/regex"));
        };
        if !is_valid_segment(tenant) || !is_valid_segment(namespace) {
            return Err(invalid("tenant and namespace must be literal"));
        }

        if local.is_empty() {
            return Err(invalid("empty topic expression"));
        }

        let prefix = format!("{}://{tenant}/{namespace}/", domain.as_str());
        let regex = Regex::new(&format!("^{}(?:{local})$", regex::escape(&prefix)))
            .map_err(|e| invalid(&e.to_string()))?;
        let source = format!("{prefix}{local}");

        Ok(Self {
            source,
            namespace: format!("{tenant}/{namespace}"),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn matches(&self, topic: &TopicName) -> bool {
        topic.namespace() == self.namespace && self.regex.is_match(&topic.base().to_string())
    }
}

/// What a consumer subscribes to.
#[derive(Debug, Clone)]
pub enum TopicSelector {
    Single(TopicName),
    List(Vec<TopicName>),
    Pattern(TopicPattern),
}

impl TopicSelector {
    /// Build a selector with pattern taking precedence over a topic list, and
    /// a list over a single topic.
    pub fn from_parts(
        topic: Option<&str>,
        topics: &[String],
        pattern: Option<&str>,
    ) -> Result<Self, TopicError> {
        if let Some(pattern) = pattern.filter(|p| !p.trim().is_empty()) {
            return Ok(TopicSelector::Pattern(TopicPattern::parse(pattern)?));
        }

        let listed: Vec<&String> = topics.iter().filter(|t| !t.trim().is_empty()).collect();
        if !listed.is_empty() {
            let names = listed
                .into_iter()
                .map(|t| TopicName::parse(t))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(TopicSelector::List(names));
        }

        match topic.filter(|t| !t.trim().is_empty()) {
            Some(topic) => Ok(TopicSelector::Single(TopicName::parse(topic)?)),
            None => Err(TopicError::NoTopic),
        }
    }

    /// Explicitly named topics (empty for a pattern).
    pub fn named_topics(&self) -> Vec<TopicName> {
        match self {
            TopicSelector::Single(name) => vec![name.clone()],
            TopicSelector::List(names) => names.clone(),
            TopicSelector::Pattern(_) => Vec::new(),
        }
    }

    pub fn pattern(&self) -> Option<&TopicPattern> {
        match self {
            TopicSelector::Pattern(pattern) => Some(pattern),
            _ => None,
        }
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSelector::Single(name) => write!(f, "{name}"),
            TopicSelector::List(names) => {
                let joined: Vec<String> = names.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", joined.join(", "))
            }
            TopicSelector::Pattern(pattern) => write!(f, "pattern({})", pattern.as_str()),
        }
    }
}
