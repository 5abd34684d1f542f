//! Queue identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Name suffix that designates a FIFO queue.
pub const FIFO_SUFFIX: &str = ".fifo";

/// The name of a queue, e.g. `orders` or `orders.fifo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this name designates a FIFO queue.
    pub fn is_fifo(&self) -> bool {
        self.0.ends_with(FIFO_SUFFIX)
    }

    /// Name used for a dead-letter queue created on behalf of this queue.
    ///
    /// `orders` becomes `orders_dlq`, `orders.fifo` becomes `orders_dlq.fifo`.
    pub fn dlq_name(&self) -> QueueName {
        match self.0.strip_suffix(FIFO_SUFFIX) {
            Some(base) => QueueName(format!("{base}_dlq{FIFO_SUFFIX}")),
            None => QueueName(format!("{}_dlq", self.0)),
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The URL of a queue, the address used by every message-level call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueUrl(String);

impl QueueUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whatever is known about a queue at the point a failure happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    Url(QueueUrl),
    Name(QueueName),
    Both { url: QueueUrl, name: QueueName },
}

impl QueueId {
    pub fn url(&self) -> Option<&QueueUrl> {
        match self {
            Self::Url(url) | Self::Both { url, .. } => Some(url),
            Self::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<&QueueName> {
        match self {
            Self::Name(name) | Self::Both { name, .. } => Some(name),
            Self::Url(_) => None,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::Name(name) => write!(f, "{name}"),
            Self::Both { url, name } => write!(f, "{name} ({url})"),
        }
    }
}

impl From<QueueUrl> for QueueId {
    fn from(url: QueueUrl) -> Self {
        Self::Url(url)
    }
}

impl From<QueueName> for QueueId {
    fn from(name: QueueName) -> Self {
        Self::Name(name)
    }
}

/// Standard or FIFO delivery semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Standard,
    Fifo,
}

/// A resolved queue. Immutable; re-resolve through the connector to observe changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    name: QueueName,
    url: QueueUrl,
    kind: QueueKind,
    dlq: Option<Box<Queue>>,
}

impl Queue {
    /// Creates a queue whose kind is derived from the name suffix.
    pub fn new(name: QueueName, url: QueueUrl) -> Self {
        let kind = if name.is_fifo() {
            QueueKind::Fifo
        } else {
            QueueKind::Standard
        };
        Self {
            name,
            url,
            kind,
            dlq: None,
        }
    }

    pub fn with_dlq(mut self, dlq: Queue) -> Self {
        self.dlq = Some(Box::new(dlq));
        self
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn url(&self) -> &QueueUrl {
        &self.url
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn is_fifo(&self) -> bool {
        self.kind == QueueKind::Fifo
    }

    /// The dead-letter queue attached through the redrive policy, if any.
    pub fn dlq(&self) -> Option<&Queue> {
        self.dlq.as_deref()
    }

    pub fn id(&self) -> QueueId {
        QueueId::Both {
            url: self.url.clone(),
            name: self.name.clone(),
        }
    }
}

/// `arn:aws:sqs:<region>:<account>:<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueArn {
    pub region: String,
    pub account_id: String,
    pub name: QueueName,
}

impl FromStr for QueueArn {
    type Err = String;

    fn from_str(arn: &str) -> Result<Self, Self::Err> {
        let components: Vec<&str> = arn.split(':').collect();
        if components.len() < 6 {
            return Err(format!(
                "invalid SQS ARN {arn}: expected at least 6 parts, got {}",
                components.len()
            ));
        }
        if components[2] != "sqs" {
            return Err(format!(
                "invalid SQS ARN {arn}: third component must be 'sqs', got '{}'",
                components[2]
            ));
        }

        Ok(Self {
            region: components[3].to_string(),
            account_id: components[4].to_string(),
            name: QueueName::new(components[5]),
        })
    }
}

impl fmt::Display for QueueArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arn:aws:sqs:{}:{}:{}", self.region, self.account_id, self.name)
    }
}

/// The `RedrivePolicy` queue attribute linking a queue to its dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    #[serde(deserialize_with = "count_from_number_or_string")]
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn new(target: &QueueArn, max_receive_count: u32) -> Self {
        Self {
            dead_letter_target_arn: target.to_string(),
            max_receive_count,
        }
    }

    pub fn target_arn(&self) -> Result<QueueArn, String> {
        self.dead_letter_target_arn.parse()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// The service echoes maxReceiveCount back as a string when it was set as one.
fn count_from_number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u32),
        Text(String),
    }

    match Count::deserialize(deserializer)? {
        Count::Number(n) => Ok(n),
        Count::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
