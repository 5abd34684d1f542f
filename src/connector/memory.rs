//! An in-process [`SqsConnector`] with the delivery semantics the runtime relies on: messages
//! become invisible for the requested visibility timeout when received, every receive issues a
//! fresh receipt handle, and a handle stops working once its message is deleted or received
//! again.
//!
//! Time is read from [`tokio::time::Instant`], so tests running with paused time observe
//! visibility deadlines deterministically. Every call is recorded and can be inspected through
//! [`InMemorySqs::calls`]; whole-call failures can be injected per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{SqsConnector, extract_already_deleted};
use crate::batch::{
    BatchErrorEntry, BatchResult, SQS_BATCH_SIZE, aggregate, batch_call_failed,
    chunk_for_batching, split_failure_and_success,
};
use crate::errors::{Operation, SqsFailure};
use crate::message::{FifoMetadata, Message, MessageId, OutboundMessage, ReceiptHandle};
use crate::queue::{Queue, QueueId, QueueName, QueueUrl};

/// How often an empty long poll re-checks for visible messages.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A call made against [`InMemorySqs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    GetQueue {
        name: QueueName,
    },
    CreateQueue {
        name: QueueName,
    },
    Receive {
        queue_url: QueueUrl,
        received: usize,
    },
    Send {
        queue_url: QueueUrl,
        count: usize,
    },
    Delete {
        queue_url: QueueUrl,
        handles: Vec<ReceiptHandle>,
    },
    ChangeVisibility {
        queue_url: QueueUrl,
        handles: Vec<ReceiptHandle>,
        duration: Duration,
        at: Instant,
    },
}

/// A visibility change as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityChange {
    pub queue_url: QueueUrl,
    pub handles: Vec<ReceiptHandle>,
    pub duration: Duration,
    pub at: Instant,
}

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    attributes: HashMap<String, String>,
    fifo: Option<FifoMetadata>,
    visible_at: Instant,
    receipt_handle: Option<ReceiptHandle>,
    receive_count: u32,
}

#[derive(Debug)]
struct StoredQueue {
    url: QueueUrl,
    dlq: Option<QueueName>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<QueueName, StoredQueue>,
    names: HashMap<QueueUrl, QueueName>,
    calls: Vec<RecordedCall>,
    injected: HashMap<Operation, VecDeque<SqsFailure>>,
}

impl State {
    fn queue_mut(&mut self, url: &QueueUrl) -> Option<&mut StoredQueue> {
        let name = self.names.get(url)?;
        self.queues.get_mut(name)
    }

    fn take_injected(&mut self, operation: Operation) -> Option<SqsFailure> {
        self.injected.get_mut(&operation)?.pop_front()
    }

    fn create(&mut self, name: &QueueName) -> QueueUrl {
        if let Some(queue) = self.queues.get(name) {
            return queue.url.clone();
        }

        let url = QueueUrl::new(format!("memory://{name}"));
        self.names.insert(url.clone(), name.clone());
        self.queues.insert(
            name.clone(),
            StoredQueue {
                url: url.clone(),
                dlq: None,
                messages: Vec::new(),
            },
        );
        url
    }

    fn resolve(&self, name: &QueueName) -> Option<Queue> {
        let stored = self.queues.get(name)?;
        let queue = Queue::new(name.clone(), stored.url.clone());

        let dlq = stored
            .dlq
            .as_ref()
            .and_then(|dlq| self.queues.get(dlq).map(|d| Queue::new(dlq.clone(), d.url.clone())));
        Some(match dlq {
            Some(dlq) => queue.with_dlq(dlq),
            None => queue,
        })
    }
}

/// In-memory queue service.
#[derive(Debug, Clone, Default)]
pub struct InMemorySqs {
    state: Arc<Mutex<State>>,
}

impl InMemorySqs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a queue (idempotently) and returns it.
    pub fn create_queue(&self, name: impl Into<String>) -> Queue {
        let name = QueueName::new(name);
        let mut state = self.state();
        state.create(&name);
        state
            .resolve(&name)
            .unwrap_or_else(|| Queue::new(name.clone(), QueueUrl::new(format!("memory://{name}"))))
    }

    /// Creates a queue together with a dead-letter queue linked to it.
    pub fn create_queue_with_dlq(&self, name: impl Into<String>) -> Queue {
        let name = QueueName::new(name);
        let dlq_name = name.dlq_name();
        let mut state = self.state();
        state.create(&name);
        state.create(&dlq_name);
        if let Some(stored) = state.queues.get_mut(&name) {
            stored.dlq = Some(dlq_name);
        }
        state
            .resolve(&name)
            .unwrap_or_else(|| Queue::new(name.clone(), QueueUrl::new(format!("memory://{name}"))))
    }

    /// Enqueues messages, returning how many were accepted. Unknown queues accept nothing.
    pub fn push(&self, queue_url: &QueueUrl, messages: impl IntoIterator<Item = OutboundMessage>) -> usize {
        let mut state = self.state();
        let Some(queue) = state.queue_mut(queue_url) else {
            return 0;
        };

        let now = Instant::now();
        let before = queue.messages.len();
        queue
            .messages
            .extend(messages.into_iter().map(|message| StoredMessage {
                id: MessageId::new(Uuid::new_v4().to_string()),
                body: message.content,
                attributes: message.attributes,
                fifo: message.fifo,
                visible_at: now,
                receipt_handle: None,
                receive_count: 0,
            }));
        queue.messages.len() - before
    }

    /// Makes the next `times` calls of `operation` fail as a whole with `failure`.
    pub fn inject_failure(&self, operation: Operation, failure: SqsFailure, times: usize) {
        let mut state = self.state();
        let queue = state.injected.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(failure, times));
    }

    /// Messages stored in the queue, in flight or not.
    pub fn message_count(&self, queue_url: &QueueUrl) -> usize {
        self.state()
            .queue_mut(queue_url)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Messages currently hidden by a visibility timeout.
    pub fn in_flight_count(&self, queue_url: &QueueUrl) -> usize {
        let now = Instant::now();
        self.state().queue_mut(queue_url).map_or(0, |queue| {
            queue
                .messages
                .iter()
                .filter(|message| message.visible_at > now)
                .count()
        })
    }

    /// Bodies of the stored messages, in enqueue order.
    pub fn bodies(&self, queue_url: &QueueUrl) -> Vec<String> {
        self.state().queue_mut(queue_url).map_or_else(Vec::new, |queue| {
            queue.messages.iter().map(|message| message.body.clone()).collect()
        })
    }

    /// How often each stored message has been received, keyed by body.
    pub fn receive_counts(&self, queue_url: &QueueUrl) -> HashMap<String, u32> {
        self.state()
            .queue_mut(queue_url)
            .map_or_else(HashMap::new, |queue| {
                queue
                    .messages
                    .iter()
                    .map(|message| (message.body.clone(), message.receive_count))
                    .collect()
            })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn visibility_changes(&self) -> Vec<VisibilityChange> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::ChangeVisibility {
                    queue_url,
                    handles,
                    duration,
                    at,
                } => Some(VisibilityChange {
                    queue_url: queue_url.clone(),
                    handles: handles.clone(),
                    duration: *duration,
                    at: *at,
                }),
                _ => None,
            })
            .collect()
    }

    fn try_receive(
        &self,
        queue: &Arc<Queue>,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, SqsFailure> {
        let mut state = self.state();
        if let Some(failure) = state.take_injected(Operation::ReceiveMessages) {
            return Err(failure);
        }

        let Some(stored) = state.queue_mut(queue.url()) else {
            return Err(SqsFailure::QueueDoesNotExist {
                operation: Operation::ReceiveMessages,
                queue: queue.id(),
                message: "The specified queue does not exist".to_string(),
            });
        };

        let now = Instant::now();
        let mut received = Vec::new();
        for message in stored
            .messages
            .iter_mut()
            .filter(|message| message.visible_at <= now)
            .take(SQS_BATCH_SIZE)
        {
            let handle = ReceiptHandle::new(Uuid::new_v4().to_string());
            message.receipt_handle = Some(handle.clone());
            message.visible_at = now + visibility_timeout;
            message.receive_count += 1;

            let mut attributes = message.attributes.clone();
            attributes.insert(
                "ApproximateReceiveCount".to_string(),
                message.receive_count.to_string(),
            );
            if let Some(fifo) = &message.fifo {
                attributes.insert("MessageGroupId".to_string(), fifo.group_id.0.clone());
                attributes.insert(
                    "MessageDeduplicationId".to_string(),
                    fifo.deduplication_id.0.clone(),
                );
            }

            received.push(Message::new(
                message.id.clone(),
                handle,
                attributes,
                message.body.clone(),
                Arc::clone(queue),
                message.fifo.clone(),
            ));
        }

        Ok(received)
    }

    fn record(&self, call: RecordedCall) {
        self.state().calls.push(call);
    }
}

fn missing_queue(operation: Operation, queue_url: &QueueUrl) -> SqsFailure {
    SqsFailure::QueueDoesNotExist {
        operation,
        queue: QueueId::Url(queue_url.clone()),
        message: "The specified queue does not exist".to_string(),
    }
}

fn invalid_handle(id: &str) -> BatchErrorEntry {
    BatchErrorEntry {
        id: id.to_string(),
        code: "ReceiptHandleIsInvalid".to_string(),
        message: Some("The receipt handle provided is not valid".to_string()),
        sender_fault: true,
    }
}

#[async_trait]
impl SqsConnector for InMemorySqs {
    async fn get_queue(&self, name: &QueueName) -> Result<Queue, SqsFailure> {
        let mut state = self.state();
        state.calls.push(RecordedCall::GetQueue { name: name.clone() });
        if let Some(failure) = state.take_injected(Operation::GetQueue) {
            return Err(failure);
        }

        state.resolve(name).ok_or_else(|| SqsFailure::QueueDoesNotExist {
            operation: Operation::GetQueue,
            queue: QueueId::Name(name.clone()),
            message: "The specified queue does not exist".to_string(),
        })
    }

    async fn get_or_create_queue(
        &self,
        name: &QueueName,
        create_dlq: bool,
    ) -> Result<Queue, SqsFailure> {
        {
            let mut state = self.state();
            state.calls.push(RecordedCall::CreateQueue { name: name.clone() });
            if let Some(failure) = state.take_injected(Operation::CreateQueue) {
                return Err(failure);
            }
        }

        let has_dlq = self
            .state()
            .queues
            .get(name)
            .is_some_and(|queue| queue.dlq.is_some());
        let queue = if create_dlq && !has_dlq {
            self.create_queue_with_dlq(name.as_str())
        } else {
            self.create_queue(name.as_str())
        };
        Ok(queue)
    }

    async fn receive_messages(
        &self,
        queue: &Arc<Queue>,
        receive_timeout: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, SqsFailure> {
        let deadline = Instant::now() + receive_timeout;
        loop {
            let received = self.try_receive(queue, visibility_timeout);
            let done = match &received {
                Ok(messages) => !messages.is_empty() || Instant::now() >= deadline,
                Err(_) => true,
            };
            if done {
                self.record(RecordedCall::Receive {
                    queue_url: queue.url().clone(),
                    received: received.as_ref().map_or(0, Vec::len),
                });
                return received;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    async fn send_messages(
        &self,
        queue_url: &QueueUrl,
        messages: Vec<OutboundMessage>,
    ) -> BatchResult<SqsFailure, OutboundMessage> {
        let mut state = self.state();
        state.calls.push(RecordedCall::Send {
            queue_url: queue_url.clone(),
            count: messages.len(),
        });
        if let Some(failure) = state.take_injected(Operation::SendMessages) {
            return batch_call_failed(failure, messages, None);
        }
        let Some(queue) = state.queue_mut(queue_url) else {
            return batch_call_failed(missing_queue(Operation::SendMessages, queue_url), messages, Some(true));
        };

        let now = Instant::now();
        queue
            .messages
            .extend(messages.iter().map(|message| StoredMessage {
                id: MessageId::new(Uuid::new_v4().to_string()),
                body: message.content.clone(),
                attributes: message.attributes.clone(),
                fifo: message.fifo.clone(),
                visible_at: now,
                receipt_handle: None,
                receive_count: 0,
            }));
        BatchResult::success(messages)
    }

    async fn delete_messages(
        &self,
        queue_url: &QueueUrl,
        handles: Vec<ReceiptHandle>,
    ) -> BatchResult<SqsFailure, ReceiptHandle> {
        let mut state = self.state();
        state.calls.push(RecordedCall::Delete {
            queue_url: queue_url.clone(),
            handles: handles.clone(),
        });
        if let Some(failure) = state.take_injected(Operation::DeleteMessages) {
            return batch_call_failed(failure, handles, None);
        }
        let Some(queue) = state.queue_mut(queue_url) else {
            return batch_call_failed(missing_queue(Operation::DeleteMessages, queue_url), handles, Some(true));
        };

        let results = chunk_for_batching(handles, SQS_BATCH_SIZE)
            .into_iter()
            .map(|chunk| {
                let errors = chunk
                    .iter()
                    .filter_map(|(id, handle)| {
                        let position = queue
                            .messages
                            .iter()
                            .position(|message| message.receipt_handle.as_ref() == Some(handle));
                        match position {
                            Some(position) => {
                                queue.messages.remove(position);
                                None
                            }
                            None => Some(invalid_handle(id)),
                        }
                    })
                    .collect();
                split_failure_and_success(
                    SqsFailure::PartialFailure {
                        operation: Operation::DeleteMessages,
                        queue: QueueId::Url(queue_url.clone()),
                    },
                    chunk,
                    errors,
                )
            })
            .collect::<Vec<_>>();
        aggregate(results)
    }

    async fn extend_message_visibility(
        &self,
        queue_url: &QueueUrl,
        handles: Vec<ReceiptHandle>,
        duration: Duration,
    ) -> BatchResult<SqsFailure, ReceiptHandle> {
        let now = Instant::now();
        let mut state = self.state();
        state.calls.push(RecordedCall::ChangeVisibility {
            queue_url: queue_url.clone(),
            handles: handles.clone(),
            duration,
            at: now,
        });
        if let Some(failure) = state.take_injected(Operation::ChangeMessageVisibility) {
            return batch_call_failed(failure, handles, None);
        }
        let Some(queue) = state.queue_mut(queue_url) else {
            return batch_call_failed(
                missing_queue(Operation::ChangeMessageVisibility, queue_url),
                handles,
                Some(true),
            );
        };

        let results = chunk_for_batching(handles, SQS_BATCH_SIZE)
            .into_iter()
            .map(|chunk| {
                let errors = chunk
                    .iter()
                    .filter_map(|(id, handle)| {
                        let message = queue
                            .messages
                            .iter_mut()
                            .find(|message| message.receipt_handle.as_ref() == Some(handle));
                        match message {
                            None => Some(BatchErrorEntry {
                                code: "InvalidParameterValue".to_string(),
                                message: Some(
                                    "Message does not exist or is not available for visibility timeout change"
                                        .to_string(),
                                ),
                                ..invalid_handle(id)
                            }),
                            Some(message) if message.visible_at <= now => Some(BatchErrorEntry {
                                code: "MessageNotInflight".to_string(),
                                message: Some("Message is not in flight".to_string()),
                                ..invalid_handle(id)
                            }),
                            Some(message) => {
                                message.visible_at = now + duration;
                                None
                            }
                        }
                    })
                    .collect();
                split_failure_and_success(
                    SqsFailure::PartialFailure {
                        operation: Operation::ChangeMessageVisibility,
                        queue: QueueId::Url(queue_url.clone()),
                    },
                    chunk,
                    errors,
                )
            })
            .collect::<Vec<_>>();
        extract_already_deleted(aggregate(results), &QueueId::Url(queue_url.clone()))
    }
}
