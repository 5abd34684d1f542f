use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::QueueId;

/// The SQS operation a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetQueue,
    CreateQueue,
    GetQueueAttributes,
    SetQueueAttributes,
    ReceiveMessages,
    SendMessages,
    DeleteMessages,
    ChangeMessageVisibility,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetQueue => "SQS.GetQueue",
            Self::CreateQueue => "SQS.CreateQueue",
            Self::GetQueueAttributes => "SQS.GetQueueAttributes",
            Self::SetQueueAttributes => "SQS.SetQueueAttributes",
            Self::ReceiveMessages => "SQS.ReceiveMessages",
            Self::SendMessages => "SQS.SendMessages",
            Self::DeleteMessages => "SQS.DeleteMessages",
            Self::ChangeMessageVisibility => "SQS.ChangeMessageVisibilities",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy for every call made against the queue service.
///
/// Failures are values: batch operations use them as keys of the failure map in
/// [`BatchResult`](crate::batch::BatchResult), so entries failing for the same reason end up in
/// the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum SqsFailure {
    /// The queue addressed by the call does not exist (or has no DLQ, for DLQ moves).
    #[error("{operation} failed for {queue}: {message}")]
    QueueDoesNotExist {
        operation: Operation,
        queue: QueueId,
        message: String,
    },

    /// The call was rejected because of request throttling or an exceeded limit.
    #[error("{operation} failed for {queue}: call was throttled")]
    Throttled { operation: Operation, queue: QueueId },

    /// The queue is encrypted and the underlying KMS key could not be used.
    #[error("{operation} failed for {queue} due to a KMS issue: {message}")]
    KmsFailure {
        operation: Operation,
        queue: QueueId,
        message: String,
    },

    /// The batch call went through, but some of its entries were rejected.
    #[error("{operation} on {queue}: some entries in this batch request could not be processed")]
    PartialFailure { operation: Operation, queue: QueueId },

    /// A visibility change targeted a message that has already been deleted.
    #[error("message on {queue} was already deleted")]
    MessageAlreadyDeleted { queue: QueueId },

    /// Anything the service or the transport reported that has no dedicated variant.
    #[error("{operation} failed for {queue}: {message}")]
    UnknownFailure {
        operation: Operation,
        queue: QueueId,
        message: String,
    },
}

impl SqsFailure {
    /// Short name of the variant, used as the `sqs.failure.kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueDoesNotExist { .. } => "QueueDoesNotExist",
            Self::Throttled { .. } => "Throttled",
            Self::KmsFailure { .. } => "KmsFailure",
            Self::PartialFailure { .. } => "PartialFailure",
            Self::MessageAlreadyDeleted { .. } => "MessageAlreadyDeleted",
            Self::UnknownFailure { .. } => "UnknownFailure",
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::QueueDoesNotExist { operation, .. }
            | Self::Throttled { operation, .. }
            | Self::KmsFailure { operation, .. }
            | Self::PartialFailure { operation, .. }
            | Self::UnknownFailure { operation, .. } => *operation,
            Self::MessageAlreadyDeleted { .. } => Operation::ChangeMessageVisibility,
        }
    }

    pub fn queue(&self) -> &QueueId {
        match self {
            Self::QueueDoesNotExist { queue, .. }
            | Self::Throttled { queue, .. }
            | Self::KmsFailure { queue, .. }
            | Self::PartialFailure { queue, .. }
            | Self::MessageAlreadyDeleted { queue }
            | Self::UnknownFailure { queue, .. } => queue,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Throttled { .. } => true,
            Self::UnknownFailure { .. } => true,
            Self::PartialFailure { .. } => true,
            Self::KmsFailure { .. } => false,
            Self::QueueDoesNotExist { .. } => false,
            Self::MessageAlreadyDeleted { .. } => false,
        }
    }
}

/// Rejected consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("visibility timeout must be a whole number of seconds between 1s and 12h, got {0:?}")]
    InvalidVisibilityTimeout(Duration),

    #[error("extension threshold {threshold:?} must be shorter than the visibility timeout {visibility_timeout:?}")]
    InvalidExtensionThreshold {
        threshold: Duration,
        visibility_timeout: Duration,
    },

    #[error("receive timeout must be at most 20s, got {0:?}")]
    InvalidReceiveTimeout(Duration),

    #[error("parallelism must be at least 1")]
    InvalidParallelism,
}

/// Error types surfaced by the consumption runtime itself.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),

    /// The subscription task panicked; its in-flight messages fall back to redelivery.
    #[error("consumer task failed: {0}")]
    TaskFailed(String),

    /// The subscription was hard-aborted instead of drained.
    #[error("consumer task was aborted")]
    Aborted,

    #[error("{0}")]
    GenericError(#[from] GenericError),
}

/// Generic error type for handler-side failures that carry nothing but a message.
#[derive(Debug, Error)]
pub struct GenericError(String);

impl GenericError {
    /// Creates a new `GenericError` with the provided message.
    pub fn new(message: impl Into<String>) -> Self {
        GenericError(message.into())
    }
}

impl fmt::Display for GenericError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenericError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(GenericError::new(s))
    }
}

impl From<String> for GenericError {
    fn from(s: String) -> Self {
        GenericError::new(s)
    }
}
