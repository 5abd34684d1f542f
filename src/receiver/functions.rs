use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use super::config::ConsumerConfiguration;
use crate::message::{Message, MessageBound, ReceiptHandle};
use crate::queue::Queue;

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Backoff applied to messages whose handler failed or panicked.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(60);

/// The verdict a handler returns for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// The message was processed and can be deleted.
    DeleteMessage(Message),
    /// Make the message visible again after `backoff`.
    RetryBackoff { message: Message, backoff: Duration },
    /// Send a copy of the message to the queue's dead-letter queue, then delete it.
    MoveMessageToDlq(Message),
}

impl Action {
    pub fn delete(message: Message) -> Self {
        Self::DeleteMessage(message)
    }

    pub fn retry(message: Message, backoff: Duration) -> Self {
        Self::RetryBackoff { message, backoff }
    }

    pub fn move_to_dlq(message: Message) -> Self {
        Self::MoveMessageToDlq(message)
    }

    pub fn message(&self) -> &Message {
        match self {
            Self::DeleteMessage(message)
            | Self::RetryBackoff { message, .. }
            | Self::MoveMessageToDlq(message) => message,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::DeleteMessage(message)
            | Self::RetryBackoff { message, .. }
            | Self::MoveMessageToDlq(message) => message,
        }
    }

    /// Name used as the `sqs.action` log field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeleteMessage(_) => "DeleteMessage",
            Self::RetryBackoff { .. } => "RetryBackoff",
            Self::MoveMessageToDlq(_) => "MoveMessageToDlq",
        }
    }
}

impl MessageBound for Action {
    fn queue(&self) -> &Queue {
        self.message().queue()
    }

    fn receipt_handle(&self) -> &ReceiptHandle {
        self.message().receipt_handle()
    }
}

/// Handles messages one at a time.
#[async_trait]
pub trait IndividualConsumer: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<Action, HandlerError>;
}

/// Handles whole received batches. Must return exactly one action per input message.
#[async_trait]
pub trait BatchConsumer: Send + Sync + 'static {
    async fn handle_batch(&self, messages: Vec<Message>) -> Result<Vec<Action>, HandlerError>;
}

/// A handler together with its per-consumer settings.
#[derive(Clone)]
pub enum MessageConsumer {
    Individual {
        consumer: Arc<dyn IndividualConsumer>,
        configuration: ConsumerConfiguration,
    },
    Batch {
        consumer: Arc<dyn BatchConsumer>,
        configuration: ConsumerConfiguration,
    },
}

impl MessageConsumer {
    pub fn individual(consumer: impl IndividualConsumer) -> Self {
        Self::Individual {
            consumer: Arc::new(consumer),
            configuration: ConsumerConfiguration::default(),
        }
    }

    pub fn batch(consumer: impl BatchConsumer) -> Self {
        Self::Batch {
            consumer: Arc::new(consumer),
            configuration: ConsumerConfiguration::default(),
        }
    }

    /// Wraps an async function receiving each message along with a clone of `shared_resources`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rs_sqs_consumer::receiver::{Action, MessageConsumer};
    ///
    /// let consumer = MessageConsumer::individual_fn(
    ///     |message, prefix: String| async move {
    ///         println!("{prefix}: {}", message.content());
    ///         Ok(Action::delete(message))
    ///     },
    ///     "orders".to_string(),
    /// );
    /// ```
    pub fn individual_fn<RFn, Fut, TShared>(rv_fn: RFn, shared_resources: TShared) -> Self
    where
        RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action, HandlerError>> + Send + 'static,
        TShared: Clone + Send + Sync + 'static,
    {
        Self::individual(IndividualConsumerFn {
            rv_fn,
            shared_resources,
        })
    }

    /// Wraps an async function receiving each batch along with a clone of `shared_resources`.
    pub fn batch_fn<RFn, Fut, TShared>(rv_fn: RFn, shared_resources: TShared) -> Self
    where
        RFn: Fn(Vec<Message>, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Action>, HandlerError>> + Send + 'static,
        TShared: Clone + Send + Sync + 'static,
    {
        Self::batch(BatchConsumerFn {
            rv_fn,
            shared_resources,
        })
    }

    pub fn with_configuration(self, configuration: ConsumerConfiguration) -> Self {
        match self {
            Self::Individual { consumer, .. } => Self::Individual {
                consumer,
                configuration,
            },
            Self::Batch { consumer, .. } => Self::Batch {
                consumer,
                configuration,
            },
        }
    }

    pub fn with_parallelism(self, parallelism: usize) -> Self {
        self.with_configuration(ConsumerConfiguration::with_parallelism(parallelism))
    }

    pub fn configuration(&self) -> ConsumerConfiguration {
        match self {
            Self::Individual { configuration, .. } | Self::Batch { configuration, .. } => {
                *configuration
            }
        }
    }
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, configuration) = match self {
            Self::Individual { configuration, .. } => ("Individual", configuration),
            Self::Batch { configuration, .. } => ("Batch", configuration),
        };
        f.debug_struct("MessageConsumer")
            .field("kind", &kind)
            .field("configuration", configuration)
            .finish()
    }
}

/// [`IndividualConsumer`] backed by a function and a shared resource.
pub struct IndividualConsumerFn<RFn, TShared> {
    rv_fn: RFn,
    shared_resources: TShared,
}

#[async_trait]
impl<RFn, Fut, TShared> IndividualConsumer for IndividualConsumerFn<RFn, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, HandlerError>> + Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    async fn handle(&self, message: Message) -> Result<Action, HandlerError> {
        (self.rv_fn)(message, self.shared_resources.clone()).await
    }
}

/// [`BatchConsumer`] backed by a function and a shared resource.
pub struct BatchConsumerFn<RFn, TShared> {
    rv_fn: RFn,
    shared_resources: TShared,
}

#[async_trait]
impl<RFn, Fut, TShared> BatchConsumer for BatchConsumerFn<RFn, TShared>
where
    RFn: Fn(Vec<Message>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Action>, HandlerError>> + Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    async fn handle_batch(&self, messages: Vec<Message>) -> Result<Vec<Action>, HandlerError> {
        (self.rv_fn)(messages, self.shared_resources.clone()).await
    }
}

/// Runs an individual handler, turning errors, panics and actions for the wrong message into a
/// retry of the input message.
pub(crate) async fn dispatch_individual(
    consumer: &Arc<dyn IndividualConsumer>,
    message: Message,
) -> Action {
    let outcome = AssertUnwindSafe(consumer.handle(message.clone()))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(action)) if action.receipt_handle() == message.receipt_handle() => action,
        Ok(Ok(action)) => {
            error!(
                sqs.message.id = %message.id(),
                sqs.action = action.name(),
                "Handler returned an action for a different message, retrying the input"
            );
            Action::retry(message, FAILURE_BACKOFF)
        }
        Ok(Err(e)) => {
            error!(sqs.message.id = %message.id(), error = %e, "Message handler failed");
            Action::retry(message, FAILURE_BACKOFF)
        }
        Err(panic) => {
            error!(
                sqs.message.id = %message.id(),
                panic = panic_message(panic.as_ref()),
                "Message handler panicked"
            );
            Action::retry(message, FAILURE_BACKOFF)
        }
    }
}

/// Runs a batch handler. The returned actions correspond one-to-one to `messages`.
pub(crate) async fn dispatch_batch(
    consumer: &Arc<dyn BatchConsumer>,
    messages: Vec<Message>,
) -> Vec<Action> {
    let outcome = AssertUnwindSafe(consumer.handle_batch(messages.clone()))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(actions)) => reconcile(messages, actions),
        Ok(Err(e)) => {
            error!(sqs.messages.count = messages.len(), error = %e, "Batch handler failed");
            retry_all(messages)
        }
        Err(panic) => {
            error!(
                sqs.messages.count = messages.len(),
                panic = panic_message(panic.as_ref()),
                "Batch handler panicked"
            );
            retry_all(messages)
        }
    }
}

fn retry_all(messages: Vec<Message>) -> Vec<Action> {
    messages
        .into_iter()
        .map(|message| Action::retry(message, FAILURE_BACKOFF))
        .collect()
}

/// Matches actions to input messages by receipt handle. Actions for unknown or already answered
/// messages are dropped; inputs without an action are retried.
pub(crate) fn reconcile(messages: Vec<Message>, actions: Vec<Action>) -> Vec<Action> {
    let order: Vec<ReceiptHandle> = messages
        .iter()
        .map(|message| message.receipt_handle().clone())
        .collect();
    let mut pending: HashMap<ReceiptHandle, Message> = messages
        .into_iter()
        .map(|message| (message.receipt_handle().clone(), message))
        .collect();

    let mut reconciled = Vec::with_capacity(order.len());
    let mut dropped = 0usize;
    for action in actions {
        if pending.remove(action.receipt_handle()).is_some() {
            reconciled.push(action);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        error!(
            dropped,
            "Batch handler returned actions for unknown or already handled messages, dropping them"
        );
    }

    if !pending.is_empty() {
        error!(
            missing = pending.len(),
            "Batch handler returned no action for some messages, retrying them"
        );
        for handle in order {
            if let Some(message) = pending.remove(&handle) {
                reconciled.push(Action::retry(message, FAILURE_BACKOFF));
            }
        }
    }

    reconciled
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GenericError;
    use crate::message::MessageId;
    use crate::queue::{QueueName, QueueUrl};

    fn messages(n: usize) -> Vec<Message> {
        let queue = Arc::new(Queue::new(QueueName::new("orders"), QueueUrl::new("memory://orders")));
        (0..n)
            .map(|i| {
                Message::new(
                    MessageId::new(format!("id-{i}")),
                    ReceiptHandle::new(format!("rh-{i}")),
                    HashMap::new(),
                    format!("body-{i}"),
                    Arc::clone(&queue),
                    None,
                )
            })
            .collect()
    }

    fn consumer_of(consumer: MessageConsumer) -> Arc<dyn IndividualConsumer> {
        match consumer {
            MessageConsumer::Individual { consumer, .. } => consumer,
            MessageConsumer::Batch { .. } => panic!("expected an individual consumer"),
        }
    }

    fn batch_consumer_of(consumer: MessageConsumer) -> Arc<dyn BatchConsumer> {
        match consumer {
            MessageConsumer::Batch { consumer, .. } => consumer,
            MessageConsumer::Individual { .. } => panic!("expected a batch consumer"),
        }
    }

    #[test]
    fn test_reconcile_fills_missing_and_drops_extra() {
        let input = messages(3);
        let foreign = messages(5).pop().unwrap();
        let actions = vec![
            Action::delete(input[2].clone()),
            Action::delete(input[2].clone()),
            Action::move_to_dlq(foreign),
        ];

        let reconciled = reconcile(input.clone(), actions);

        assert_eq!(reconciled.len(), 3);
        assert_eq!(reconciled[0], Action::delete(input[2].clone()));
        assert_eq!(reconciled[1], Action::retry(input[0].clone(), FAILURE_BACKOFF));
        assert_eq!(reconciled[2], Action::retry(input[1].clone(), FAILURE_BACKOFF));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_retry() {
        let consumer = consumer_of(MessageConsumer::individual_fn(
            |_message, _: ()| async move { Err(GenericError::new("nope").into()) },
            (),
        ));
        let message = messages(1).remove(0);

        let action = dispatch_individual(&consumer, message.clone()).await;

        assert_eq!(action, Action::retry(message, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_retry() {
        let consumer = consumer_of(MessageConsumer::individual_fn(
            |message: Message, _: ()| async move {
                if message.content().starts_with("body") {
                    panic!("handler exploded");
                }
                Ok(Action::delete(message))
            },
            (),
        ));
        let message = messages(1).remove(0);

        let action = dispatch_individual(&consumer, message.clone()).await;

        assert_eq!(action, Action::retry(message, FAILURE_BACKOFF));
    }

    #[tokio::test]
    async fn test_shared_resource_is_passed_to_handler() {
        let consumer = consumer_of(MessageConsumer::individual_fn(
            |message: Message, prefix: String| async move {
                if message.content().starts_with(prefix.as_str()) {
                    Ok(Action::delete(message))
                } else {
                    Ok(Action::move_to_dlq(message))
                }
            },
            "body".to_string(),
        ));
        let message = messages(1).remove(0);

        let action = dispatch_individual(&consumer, message.clone()).await;

        assert_eq!(action, Action::delete(message));
    }

    #[tokio::test]
    async fn test_batch_handler_failure_retries_every_message() {
        let consumer = batch_consumer_of(MessageConsumer::batch_fn(
            |_messages, _: ()| async move { Err("downstream unavailable".into()) },
            (),
        ));
        let input = messages(4);

        let actions = dispatch_batch(&consumer, input.clone()).await;

        assert_eq!(actions.len(), 4);
        assert!(actions.iter().all(|action| matches!(
            action,
            Action::RetryBackoff { backoff, .. } if *backoff == FAILURE_BACKOFF
        )));
    }

    #[test]
    fn test_with_parallelism_keeps_kind() {
        let consumer = MessageConsumer::batch_fn(
            |messages: Vec<Message>, _: ()| async move {
                Ok(messages.into_iter().map(Action::delete).collect())
            },
            (),
        )
        .with_parallelism(4);

        assert_eq!(consumer.configuration().parallelism, 4);
        assert!(matches!(consumer, MessageConsumer::Batch { .. }));
    }
}
