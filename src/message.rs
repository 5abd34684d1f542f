//! Message types: received messages, their identifiers, and outbound messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::queue::Queue;

/// Unique identifier the service assigned to a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token authorizing deletion or visibility changes of one particular receive of a
/// message. It stops working once the message is deleted or its visibility window lapses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tag assigning a message to an ordered group of a FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(pub String);

/// Token used by FIFO queues to deduplicate sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeduplicationId(pub String);

/// FIFO-only message metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FifoMetadata {
    pub group_id: GroupId,
    pub deduplication_id: DeduplicationId,
}

/// Anything tied to one received message: the message itself, or a verdict about it.
pub trait MessageBound {
    /// The queue the message was received from.
    fn queue(&self) -> &Queue;

    /// The receipt handle used to act on the message.
    fn receipt_handle(&self) -> &ReceiptHandle;
}

/// A message received from a queue.
///
/// Messages are produced by [`SqsConnector::receive_messages`](crate::connector::SqsConnector)
/// and never mutated afterwards; cloning one is cheap apart from its content and attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T = String> {
    id: MessageId,
    receipt_handle: ReceiptHandle,
    attributes: HashMap<String, String>,
    content: T,
    queue: Arc<Queue>,
    fifo: Option<FifoMetadata>,
}

impl<T> Message<T> {
    /// Assembles a received message. Intended for connector implementations.
    pub fn new(
        id: MessageId,
        receipt_handle: ReceiptHandle,
        attributes: HashMap<String, String>,
        content: T,
        queue: Arc<Queue>,
        fifo: Option<FifoMetadata>,
    ) -> Self {
        Self {
            id,
            receipt_handle,
            attributes,
            content,
            queue,
            fifo,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Custom string attributes merged with the system attributes of the message.
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn content(&self) -> &T {
        &self.content
    }

    pub fn into_content(self) -> T {
        self.content
    }

    pub fn fifo(&self) -> Option<&FifoMetadata> {
        self.fifo.as_ref()
    }

    pub fn queue_ref(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Replaces the content while keeping identity, handle and queue.
    pub fn map_content<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: self.id,
            receipt_handle: self.receipt_handle,
            attributes: self.attributes,
            content: f(self.content),
            queue: self.queue,
            fifo: self.fifo,
        }
    }
}

impl Message<String> {
    /// Deserializes the JSON body into `U`.
    pub fn parse_json<U: DeserializeOwned>(&self) -> Result<Message<U>, serde_json::Error> {
        let content = serde_json::from_str(&self.content)?;
        Ok(Message {
            id: self.id.clone(),
            receipt_handle: self.receipt_handle.clone(),
            attributes: self.attributes.clone(),
            content,
            queue: Arc::clone(&self.queue),
            fifo: self.fifo.clone(),
        })
    }
}

impl<T> MessageBound for Message<T> {
    fn queue(&self) -> &Queue {
        &self.queue
    }

    fn receipt_handle(&self) -> &ReceiptHandle {
        &self.receipt_handle
    }
}

/// A message to be sent to a queue. It has no identity until the queue accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content: String,
    pub attributes: HashMap<String, String>,
    pub fifo: Option<FifoMetadata>,
}

impl OutboundMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attributes: HashMap::new(),
            fifo: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_fifo(mut self, group_id: GroupId, deduplication_id: DeduplicationId) -> Self {
        self.fifo = Some(FifoMetadata {
            group_id,
            deduplication_id,
        });
        self
    }

    /// Copies a received message so it can be re-sent elsewhere, e.g. to a dead-letter queue.
    pub fn from_message(message: &Message<String>) -> Self {
        Self {
            content: message.content.clone(),
            attributes: message.attributes.clone(),
            fifo: message.fifo.clone(),
        }
    }
}

impl From<&str> for OutboundMessage {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}
