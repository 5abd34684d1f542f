//! The queue client boundary used by the consumption runtime.
//!
//! [`SqsConnector`] is the full contract the runtime needs from the queue service. Two
//! implementations ship with the crate: [`AwsSqsConnector`] on top of `aws-sdk-sqs`, and
//! [`memory::InMemorySqs`] for tests and local development.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::batch::{BatchResult, FailedBatchEntry};
use crate::errors::{Operation, SqsFailure};
use crate::message::{Message, OutboundMessage, ReceiptHandle};
use crate::queue::{Queue, QueueId, QueueName, QueueUrl};

mod aws;
pub mod memory;

pub use aws::AwsSqsConnector;

/// Longest visibility timeout the service accepts.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest long-poll wait the service accepts.
pub const MAX_RECEIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Error codes with which a visibility change is rejected for a message that no longer exists.
pub const ALREADY_DELETED_CODES: &[&str] = &[
    "InvalidParameterValue",
    "InvalidParameterValueException",
    "ReceiptHandleIsInvalid",
];

/// Batched access to the queue service.
///
/// Batch operations never fail as a whole: every input item is reported back either as a
/// success or as a [`FailedBatchEntry`] under its failure cause. Implementations chunk inputs
/// to the service's batch limit themselves. Empty inputs yield empty results.
#[async_trait]
pub trait SqsConnector: Send + Sync + 'static {
    /// Resolves an existing queue, including its dead-letter queue.
    async fn get_queue(&self, name: &QueueName) -> Result<Queue, SqsFailure>;

    /// Resolves a queue, creating it (and optionally a dead-letter queue for it) if missing.
    async fn get_or_create_queue(
        &self,
        name: &QueueName,
        create_dlq: bool,
    ) -> Result<Queue, SqsFailure>;

    /// Long-polls for up to one batch of messages.
    async fn receive_messages(
        &self,
        queue: &Arc<Queue>,
        receive_timeout: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, SqsFailure>;

    async fn send_messages(
        &self,
        queue_url: &QueueUrl,
        messages: Vec<OutboundMessage>,
    ) -> BatchResult<SqsFailure, OutboundMessage>;

    async fn delete_messages(
        &self,
        queue_url: &QueueUrl,
        handles: Vec<ReceiptHandle>,
    ) -> BatchResult<SqsFailure, ReceiptHandle>;

    /// Sets the remaining invisibility of each message to `duration`.
    ///
    /// Entries rejected because the message is already gone are reported under
    /// [`SqsFailure::MessageAlreadyDeleted`].
    async fn extend_message_visibility(
        &self,
        queue_url: &QueueUrl,
        handles: Vec<ReceiptHandle>,
        duration: Duration,
    ) -> BatchResult<SqsFailure, ReceiptHandle>;
}

/// Maps a provider error code onto the failure taxonomy.
pub fn classify_error_code(
    operation: Operation,
    queue: QueueId,
    code: Option<&str>,
    message: String,
) -> SqsFailure {
    match code {
        Some("AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist") => {
            SqsFailure::QueueDoesNotExist {
                operation,
                queue,
                message,
            }
        }
        Some("RequestThrottled" | "OverLimit" | "ThrottlingException" | "Throttling") => {
            SqsFailure::Throttled { operation, queue }
        }
        Some(code) if code.starts_with("Kms") || code.starts_with("KMS.") => {
            SqsFailure::KmsFailure {
                operation,
                queue,
                message,
            }
        }
        _ => SqsFailure::UnknownFailure {
            operation,
            queue,
            message,
        },
    }
}

pub fn is_already_deleted<T>(entry: &FailedBatchEntry<T>) -> bool {
    ALREADY_DELETED_CODES.contains(&entry.code.as_str())
}

/// Moves entries of partial-failure buckets that were rejected because the message is gone into
/// a [`SqsFailure::MessageAlreadyDeleted`] bucket.
pub fn extract_already_deleted<T>(
    result: BatchResult<SqsFailure, T>,
    queue: &QueueId,
) -> BatchResult<SqsFailure, T> {
    let (failed, succeeded) = result.into_parts();
    let mut extracted = BatchResult::success(succeeded);

    for (cause, entries) in failed {
        if !matches!(cause, SqsFailure::PartialFailure { .. }) {
            extracted.add_failures(cause, entries);
            continue;
        }

        let (deleted, others): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(is_already_deleted);
        extracted.add_failures(cause, others);
        extracted.add_failures(
            SqsFailure::MessageAlreadyDeleted {
                queue: queue.clone(),
            },
            deleted,
        );
    }

    extracted
}

/// Whole seconds as the service expects them, saturating instead of overflowing.
pub(crate) fn whole_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

/// Like [`whole_seconds`], but rounds a fractional second up so a message never becomes visible
/// earlier than asked for.
pub(crate) fn visibility_seconds(duration: Duration) -> i32 {
    let seconds = whole_seconds(duration);
    if duration.subsec_nanos() > 0 {
        seconds.saturating_add(1)
    } else {
        seconds
    }
}
