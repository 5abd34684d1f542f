use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{
    BatchResultErrorEntry, ChangeMessageVisibilityBatchRequestEntry,
    DeleteMessageBatchRequestEntry, MessageAttributeValue, MessageSystemAttributeName,
    QueueAttributeName, SendMessageBatchRequestEntry,
};
use tracing::{debug, info, warn};

use super::{
    SqsConnector, classify_error_code, extract_already_deleted, visibility_seconds, whole_seconds,
};
use crate::batch::{
    BatchErrorEntry, BatchResult, SQS_BATCH_SIZE, aggregate, batch_call_failed,
    chunk_for_batching, split_failure_and_success,
};
use crate::errors::{Operation, SqsFailure};
use crate::message::{
    DeduplicationId, FifoMetadata, GroupId, Message, MessageId, OutboundMessage, ReceiptHandle,
};
use crate::queue::{Queue, QueueArn, QueueId, QueueName, QueueUrl, RedrivePolicy};

/// Receive count after which the service moves a message to a dead-letter queue created by
/// [`SqsConnector::get_or_create_queue`].
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// [`SqsConnector`] backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct AwsSqsConnector {
    client: aws_sdk_sqs::Client,
    max_receive_count: u32,
}

impl AwsSqsConnector {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self {
            client,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        }
    }

    /// Overrides the `maxReceiveCount` of redrive policies attached to created dead-letter queues.
    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    pub fn client(&self) -> &aws_sdk_sqs::Client {
        &self.client
    }

    async fn queue_url(
        &self,
        name: &QueueName,
        owner_account_id: Option<&str>,
    ) -> Result<QueueUrl, SqsFailure> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name.as_str())
            .set_queue_owner_aws_account_id(owner_account_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| classify(Operation::GetQueue, QueueId::Name(name.clone()), &e))?;

        output
            .queue_url()
            .map(QueueUrl::new)
            .ok_or_else(|| SqsFailure::UnknownFailure {
                operation: Operation::GetQueue,
                queue: QueueId::Name(name.clone()),
                message: "response did not contain a queue URL".to_string(),
            })
    }

    async fn queue_attribute(
        &self,
        url: &QueueUrl,
        attribute: QueueAttributeName,
    ) -> Result<Option<String>, SqsFailure> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(url.as_str())
            .attribute_names(attribute.clone())
            .send()
            .await
            .map_err(|e| classify(Operation::GetQueueAttributes, QueueId::Url(url.clone()), &e))?;

        Ok(output
            .attributes()
            .and_then(|attributes| attributes.get(&attribute))
            .cloned())
    }

    /// Follows the redrive policy of a queue to its dead-letter queue.
    async fn resolve_dlq(&self, url: &QueueUrl) -> Result<Option<Queue>, SqsFailure> {
        let Some(raw) = self
            .queue_attribute(url, QueueAttributeName::RedrivePolicy)
            .await?
        else {
            return Ok(None);
        };

        let malformed = |message: String| SqsFailure::UnknownFailure {
            operation: Operation::GetQueueAttributes,
            queue: QueueId::Url(url.clone()),
            message,
        };
        let policy = RedrivePolicy::from_json(&raw)
            .map_err(|e| malformed(format!("malformed redrive policy {raw}: {e}")))?;
        let arn = policy.target_arn().map_err(malformed)?;

        let dlq_url = self.queue_url(&arn.name, Some(&arn.account_id)).await?;
        Ok(Some(Queue::new(arn.name, dlq_url)))
    }

    async fn create_queue(&self, name: &QueueName) -> Result<QueueUrl, SqsFailure> {
        let mut request = self.client.create_queue().queue_name(name.as_str());
        if name.is_fifo() {
            request = request.attributes(QueueAttributeName::FifoQueue, "true");
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify(Operation::CreateQueue, QueueId::Name(name.clone()), &e))?;

        output
            .queue_url()
            .map(QueueUrl::new)
            .ok_or_else(|| SqsFailure::UnknownFailure {
                operation: Operation::CreateQueue,
                queue: QueueId::Name(name.clone()),
                message: "response did not contain a queue URL".to_string(),
            })
    }

    async fn attach_dlq(&self, url: &QueueUrl, dlq_url: &QueueUrl) -> Result<(), SqsFailure> {
        let dlq_id = QueueId::Url(dlq_url.clone());
        let raw_arn = self
            .queue_attribute(dlq_url, QueueAttributeName::QueueArn)
            .await?
            .ok_or_else(|| SqsFailure::UnknownFailure {
                operation: Operation::GetQueueAttributes,
                queue: dlq_id.clone(),
                message: "queue has no QueueArn attribute".to_string(),
            })?;
        let arn: QueueArn = raw_arn
            .parse()
            .map_err(|message| SqsFailure::UnknownFailure {
                operation: Operation::GetQueueAttributes,
                queue: dlq_id.clone(),
                message,
            })?;

        let policy = RedrivePolicy::new(&arn, self.max_receive_count)
            .to_json()
            .map_err(|e| SqsFailure::UnknownFailure {
                operation: Operation::SetQueueAttributes,
                queue: QueueId::Url(url.clone()),
                message: e.to_string(),
            })?;

        self.client
            .set_queue_attributes()
            .queue_url(url.as_str())
            .attributes(QueueAttributeName::RedrivePolicy, policy)
            .send()
            .await
            .map_err(|e| classify(Operation::SetQueueAttributes, QueueId::Url(url.clone()), &e))?;

        Ok(())
    }

    async fn send_chunk(
        &self,
        queue_url: &QueueUrl,
        chunk: Vec<(String, OutboundMessage)>,
    ) -> BatchResult<SqsFailure, OutboundMessage> {
        let queue = QueueId::Url(queue_url.clone());
        let entries: Result<Vec<_>, _> = chunk
            .iter()
            .map(|(id, message)| send_entry(id, message))
            .collect();
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => return invalid_request(Operation::SendMessages, queue, chunk, &e),
        };

        match self
            .client
            .send_message_batch()
            .queue_url(queue_url.as_str())
            .set_entries(Some(entries))
            .send()
            .await
        {
            Ok(output) => split_failure_and_success(
                SqsFailure::PartialFailure {
                    operation: Operation::SendMessages,
                    queue,
                },
                chunk,
                output.failed().iter().map(error_entry).collect(),
            ),
            Err(e) => {
                let failure = classify(Operation::SendMessages, queue, &e);
                batch_call_failed(failure, unzip_items(chunk), None)
            }
        }
    }

    async fn delete_chunk(
        &self,
        queue_url: &QueueUrl,
        chunk: Vec<(String, ReceiptHandle)>,
    ) -> BatchResult<SqsFailure, ReceiptHandle> {
        let queue = QueueId::Url(queue_url.clone());
        let entries: Result<Vec<_>, _> = chunk
            .iter()
            .map(|(id, handle)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(id)
                    .receipt_handle(handle.as_str())
                    .build()
            })
            .collect();
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => return invalid_request(Operation::DeleteMessages, queue, chunk, &e),
        };

        match self
            .client
            .delete_message_batch()
            .queue_url(queue_url.as_str())
            .set_entries(Some(entries))
            .send()
            .await
        {
            Ok(output) => split_failure_and_success(
                SqsFailure::PartialFailure {
                    operation: Operation::DeleteMessages,
                    queue,
                },
                chunk,
                output.failed().iter().map(error_entry).collect(),
            ),
            Err(e) => {
                let failure = classify(Operation::DeleteMessages, queue, &e);
                batch_call_failed(failure, unzip_items(chunk), None)
            }
        }
    }

    async fn change_visibility_chunk(
        &self,
        queue_url: &QueueUrl,
        chunk: Vec<(String, ReceiptHandle)>,
        seconds: i32,
    ) -> BatchResult<SqsFailure, ReceiptHandle> {
        let queue = QueueId::Url(queue_url.clone());
        let entries: Result<Vec<_>, _> = chunk
            .iter()
            .map(|(id, handle)| {
                ChangeMessageVisibilityBatchRequestEntry::builder()
                    .id(id)
                    .receipt_handle(handle.as_str())
                    .visibility_timeout(seconds)
                    .build()
            })
            .collect();
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => return invalid_request(Operation::ChangeMessageVisibility, queue, chunk, &e),
        };

        match self
            .client
            .change_message_visibility_batch()
            .queue_url(queue_url.as_str())
            .set_entries(Some(entries))
            .send()
            .await
        {
            Ok(output) => split_failure_and_success(
                SqsFailure::PartialFailure {
                    operation: Operation::ChangeMessageVisibility,
                    queue,
                },
                chunk,
                output.failed().iter().map(error_entry).collect(),
            ),
            Err(e) => {
                let failure = classify(Operation::ChangeMessageVisibility, queue, &e);
                batch_call_failed(failure, unzip_items(chunk), None)
            }
        }
    }
}

#[async_trait]
impl SqsConnector for AwsSqsConnector {
    async fn get_queue(&self, name: &QueueName) -> Result<Queue, SqsFailure> {
        let url = self.queue_url(name, None).await?;
        let queue = Queue::new(name.clone(), url.clone());

        Ok(match self.resolve_dlq(&url).await? {
            Some(dlq) => queue.with_dlq(dlq),
            None => queue,
        })
    }

    async fn get_or_create_queue(
        &self,
        name: &QueueName,
        create_dlq: bool,
    ) -> Result<Queue, SqsFailure> {
        let url = self.create_queue(name).await?;
        let queue = Queue::new(name.clone(), url.clone());

        let dlq = match (self.resolve_dlq(&url).await?, create_dlq) {
            (Some(dlq), true) => Some(dlq),
            (Some(dlq), false) => {
                warn!(
                    sqs.queue.name = %name,
                    sqs.dlq.name = %dlq.name(),
                    "Queue already has a dead-letter queue configured, it will not be removed"
                );
                Some(dlq)
            }
            (None, false) => None,
            (None, true) => {
                let dlq_name = name.dlq_name();
                let dlq_url = self.create_queue(&dlq_name).await?;
                self.attach_dlq(&url, &dlq_url).await?;
                info!(
                    sqs.queue.name = %name,
                    sqs.dlq.name = %dlq_name,
                    max_receive_count = self.max_receive_count,
                    "Created dead-letter queue"
                );
                Some(Queue::new(dlq_name, dlq_url))
            }
        };

        Ok(match dlq {
            Some(dlq) => queue.with_dlq(dlq),
            None => queue,
        })
    }

    async fn receive_messages(
        &self,
        queue: &Arc<Queue>,
        receive_timeout: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, SqsFailure> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue.url().as_str())
            .max_number_of_messages(SQS_BATCH_SIZE as i32)
            .wait_time_seconds(whole_seconds(receive_timeout))
            .visibility_timeout(visibility_seconds(visibility_timeout))
            .message_attribute_names("All")
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| classify(Operation::ReceiveMessages, queue.id(), &e))?;

        let mut messages = Vec::with_capacity(output.messages().len());
        for received in output.messages() {
            let (Some(id), Some(handle)) = (received.message_id(), received.receipt_handle())
            else {
                warn!(
                    sqs.queue.url = %queue.url(),
                    "Received a message without id or receipt handle, skipping it"
                );
                continue;
            };

            let attributes = merge_attributes(received.message_attributes(), received.attributes());
            let fifo = if queue.is_fifo() {
                fifo_metadata(&attributes)
            } else {
                None
            };

            messages.push(Message::new(
                MessageId::new(id),
                ReceiptHandle::new(handle),
                attributes,
                received.body().unwrap_or_default().to_string(),
                Arc::clone(queue),
                fifo,
            ));
        }

        debug!(
            sqs.queue.url = %queue.url(),
            sqs.messages.count = messages.len(),
            "Received messages"
        );
        Ok(messages)
    }

    async fn send_messages(
        &self,
        queue_url: &QueueUrl,
        messages: Vec<OutboundMessage>,
    ) -> BatchResult<SqsFailure, OutboundMessage> {
        let mut results = Vec::new();
        for chunk in chunk_for_batching(messages, SQS_BATCH_SIZE) {
            results.push(self.send_chunk(queue_url, chunk).await);
        }
        aggregate(results)
    }

    async fn delete_messages(
        &self,
        queue_url: &QueueUrl,
        handles: Vec<ReceiptHandle>,
    ) -> BatchResult<SqsFailure, ReceiptHandle> {
        let mut results = Vec::new();
        for chunk in chunk_for_batching(handles, SQS_BATCH_SIZE) {
            results.push(self.delete_chunk(queue_url, chunk).await);
        }
        aggregate(results)
    }

    async fn extend_message_visibility(
        &self,
        queue_url: &QueueUrl,
        handles: Vec<ReceiptHandle>,
        duration: Duration,
    ) -> BatchResult<SqsFailure, ReceiptHandle> {
        let seconds = visibility_seconds(duration);
        let mut results = Vec::new();
        for chunk in chunk_for_batching(handles, SQS_BATCH_SIZE) {
            results.push(self.change_visibility_chunk(queue_url, chunk, seconds).await);
        }
        extract_already_deleted(aggregate(results), &QueueId::Url(queue_url.clone()))
    }
}

fn classify<E, R>(operation: Operation, queue: QueueId, err: &SdkError<E, R>) -> SqsFailure
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    classify_error_code(
        operation,
        queue,
        err.code(),
        DisplayErrorContext(err).to_string(),
    )
}

fn error_entry(entry: &BatchResultErrorEntry) -> BatchErrorEntry {
    BatchErrorEntry {
        id: entry.id().to_string(),
        code: entry.code().to_string(),
        message: entry.message().map(str::to_string),
        sender_fault: entry.sender_fault(),
    }
}

fn unzip_items<T>(chunk: Vec<(String, T)>) -> Vec<T> {
    chunk.into_iter().map(|(_, item)| item).collect()
}

fn invalid_request<T>(
    operation: Operation,
    queue: QueueId,
    chunk: Vec<(String, T)>,
    err: &BuildError,
) -> BatchResult<SqsFailure, T> {
    let failure = SqsFailure::UnknownFailure {
        operation,
        queue,
        message: format!("could not build batch request: {err}"),
    };
    batch_call_failed(failure, unzip_items(chunk), Some(true))
}

fn send_entry(id: &str, message: &OutboundMessage) -> Result<SendMessageBatchRequestEntry, BuildError> {
    let attributes = message
        .attributes
        .iter()
        .map(|(key, value)| {
            MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map(|value| (key.clone(), value))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    SendMessageBatchRequestEntry::builder()
        .id(id)
        .message_body(&message.content)
        .set_message_attributes((!attributes.is_empty()).then_some(attributes))
        .set_message_group_id(message.fifo.as_ref().map(|fifo| fifo.group_id.0.clone()))
        .set_message_deduplication_id(
            message
                .fifo
                .as_ref()
                .map(|fifo| fifo.deduplication_id.0.clone()),
        )
        .build()
}

/// Custom string attributes and system attributes in one map. Blank values are dropped.
fn merge_attributes(
    custom: Option<&HashMap<String, MessageAttributeValue>>,
    system: Option<&HashMap<MessageSystemAttributeName, String>>,
) -> HashMap<String, String> {
    let custom = custom.into_iter().flatten().filter_map(|(key, value)| {
        value
            .string_value()
            .map(|text| (key.clone(), text.to_string()))
    });
    let system = system
        .into_iter()
        .flatten()
        .map(|(key, value)| (key.as_str().to_string(), value.clone()));

    custom
        .chain(system)
        .filter(|(_, value)| !value.trim().is_empty())
        .collect()
}

fn fifo_metadata(attributes: &HashMap<String, String>) -> Option<FifoMetadata> {
    let group_id = attributes.get(MessageSystemAttributeName::MessageGroupId.as_str())?;
    let deduplication_id =
        attributes.get(MessageSystemAttributeName::MessageDeduplicationId.as_str())?;

    Some(FifoMetadata {
        group_id: GroupId(group_id.clone()),
        deduplication_id: DeduplicationId(deduplication_id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_attributes_drops_blank_values() {
        let custom = HashMap::from([
            (
                "trace".to_string(),
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("abc")
                    .build()
                    .unwrap(),
            ),
            (
                "empty".to_string(),
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("  ")
                    .build()
                    .unwrap(),
            ),
        ]);
        let system = HashMap::from([(
            MessageSystemAttributeName::ApproximateReceiveCount,
            "2".to_string(),
        )]);

        let merged = merge_attributes(Some(&custom), Some(&system));

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["trace"], "abc");
        assert_eq!(merged["ApproximateReceiveCount"], "2");
    }

    #[test]
    fn test_fifo_metadata_requires_both_ids() {
        let mut attributes = HashMap::from([("MessageGroupId".to_string(), "g".to_string())]);
        assert!(fifo_metadata(&attributes).is_none());

        attributes.insert("MessageDeduplicationId".to_string(), "d".to_string());
        let fifo = fifo_metadata(&attributes).unwrap();
        assert_eq!(fifo.group_id, GroupId("g".to_string()));
        assert_eq!(fifo.deduplication_id, DeduplicationId("d".to_string()));
    }

    #[test]
    fn test_send_entry_carries_fifo_ids() {
        let message = OutboundMessage::new("body")
            .with_attribute("k", "v")
            .with_fifo(GroupId("g".to_string()), DeduplicationId("d".to_string()));

        let entry = send_entry("0", &message).unwrap();

        assert_eq!(entry.id(), "0");
        assert_eq!(entry.message_body(), "body");
        assert_eq!(entry.message_group_id(), Some("g"));
        assert_eq!(entry.message_deduplication_id(), Some("d"));
        assert!(entry.message_attributes().unwrap().contains_key("k"));
    }
}
