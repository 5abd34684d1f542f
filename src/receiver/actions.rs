use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::functions::Action;
use super::visibility::VisibilityManager;
use crate::batch::{BatchResult, FailedBatchEntry, aggregate, batch_call_failed};
use crate::connector::SqsConnector;
use crate::errors::{Operation, SqsFailure};
use crate::message::{MessageBound, OutboundMessage, ReceiptHandle};
use crate::queue::{Queue, QueueUrl};

/// Executes handler verdicts against the queue and retires the affected messages from
/// visibility tracking.
///
/// Actions are grouped by queue, then by kind: dead-letter moves first, deletes second, retries
/// last with one visibility call per distinct backoff. Every action ends up in the returned
/// result exactly once, and every message is untracked once its call resolved.
pub(crate) async fn execute_actions<C: SqsConnector>(
    connector: &C,
    visibility: &VisibilityManager<C>,
    actions: Vec<Action>,
) -> BatchResult<SqsFailure, Action> {
    let mut by_queue: HashMap<QueueUrl, (Arc<Queue>, Vec<Action>)> = HashMap::new();
    for action in actions {
        let queue = action.message().queue_ref();
        by_queue
            .entry(queue.url().clone())
            .or_insert_with(|| (Arc::clone(queue), Vec::new()))
            .1
            .push(action);
    }

    let mut results = Vec::with_capacity(by_queue.len());
    for (queue, actions) in by_queue.into_values() {
        results.push(execute_for_queue(connector, &queue, actions).await);
    }
    let result = aggregate(results);

    let handled = result
        .successes()
        .iter()
        .chain(result.failed_entries().map(|(_, entry)| &entry.reference));
    for action in handled {
        visibility.stop_tracking(action.receipt_handle()).await;
    }

    result
}

async fn execute_for_queue<C: SqsConnector>(
    connector: &C,
    queue: &Queue,
    actions: Vec<Action>,
) -> BatchResult<SqsFailure, Action> {
    let mut to_dlq = Vec::new();
    let mut to_delete = Vec::new();
    let mut to_retry: BTreeMap<Duration, Vec<Action>> = BTreeMap::new();
    for action in actions {
        match action {
            Action::MoveMessageToDlq(_) => to_dlq.push(action),
            Action::DeleteMessage(_) => to_delete.push(action),
            Action::RetryBackoff { backoff, .. } => to_retry.entry(backoff).or_default().push(action),
        }
    }

    let mut results = Vec::new();
    if !to_dlq.is_empty() {
        results.push(log_outcome("MoveMessageToDlq", move_to_dlq(connector, queue, to_dlq).await));
    }
    if !to_delete.is_empty() {
        results.push(log_outcome("DeleteMessage", delete(connector, queue.url(), to_delete).await));
    }
    if !to_retry.is_empty() {
        let mut retried = Vec::with_capacity(to_retry.len());
        for (backoff, actions) in to_retry {
            let handles = by_handle(actions);
            let result = connector
                .extend_message_visibility(queue.url(), handles.keys().cloned().collect(), backoff)
                .await;
            retried.push(rebind(result, handles));
        }
        results.push(log_outcome("RetryBackoff", aggregate(retried)));
    }

    aggregate(results)
}

async fn delete<C: SqsConnector>(
    connector: &C,
    queue_url: &QueueUrl,
    actions: Vec<Action>,
) -> BatchResult<SqsFailure, Action> {
    let handles = by_handle(actions);
    let result = connector
        .delete_messages(queue_url, handles.keys().cloned().collect())
        .await;
    rebind(result, handles)
}

/// Sends copies to the dead-letter queue and deletes the originals that were sent. Without a
/// dead-letter queue nothing is sent or deleted.
async fn move_to_dlq<C: SqsConnector>(
    connector: &C,
    queue: &Queue,
    actions: Vec<Action>,
) -> BatchResult<SqsFailure, Action> {
    let Some(dlq) = queue.dlq() else {
        let failure = SqsFailure::QueueDoesNotExist {
            operation: Operation::SendMessages,
            queue: queue.id(),
            message: "The queue does not have a dead-letter queue, messages will be retried instead"
                .to_string(),
        };
        return batch_call_failed(failure, actions, Some(true));
    };

    let mut lookup: Vec<(OutboundMessage, Option<Action>)> = actions
        .into_iter()
        .map(|action| (OutboundMessage::from_message(action.message()), Some(action)))
        .collect();
    let outbound = lookup.iter().map(|(message, _)| message.clone()).collect();

    let sent = connector.send_messages(dlq.url(), outbound).await;
    let (failed, succeeded) = sent.into_parts();

    let mut result = BatchResult::empty();
    for (cause, entries) in failed {
        let entries = entries
            .into_iter()
            .filter_map(|entry| {
                take_matching(&mut lookup, &entry.reference).map(|action| FailedBatchEntry {
                    reference: action,
                    code: entry.code,
                    message: entry.message,
                    sender_fault: entry.sender_fault,
                })
            })
            .collect();
        result.add_failures(cause, entries);
    }

    let copied: Vec<Action> = succeeded
        .iter()
        .filter_map(|message| take_matching(&mut lookup, message))
        .collect();
    if copied.is_empty() {
        return result;
    }
    result.merge(delete(connector, queue.url(), copied).await)
}

// Equal outbound messages are interchangeable, so any unclaimed action with the same copy will do.
fn take_matching(
    lookup: &mut [(OutboundMessage, Option<Action>)],
    message: &OutboundMessage,
) -> Option<Action> {
    lookup
        .iter_mut()
        .find(|(candidate, action)| action.is_some() && candidate == message)
        .and_then(|(_, action)| action.take())
}

fn by_handle(actions: Vec<Action>) -> HashMap<ReceiptHandle, Action> {
    actions
        .into_iter()
        .map(|action| (action.receipt_handle().clone(), action))
        .collect()
}

/// Maps a result over receipt handles back onto the actions they were taken from.
fn rebind(
    result: BatchResult<SqsFailure, ReceiptHandle>,
    mut actions: HashMap<ReceiptHandle, Action>,
) -> BatchResult<SqsFailure, Action> {
    let (failed, succeeded) = result.into_parts();

    let mut rebound = BatchResult::empty();
    for (cause, entries) in failed {
        let entries = entries
            .into_iter()
            .filter_map(|entry| {
                actions.remove(&entry.reference).map(|action| FailedBatchEntry {
                    reference: action,
                    code: entry.code,
                    message: entry.message,
                    sender_fault: entry.sender_fault,
                })
            })
            .collect();
        rebound.add_failures(cause, entries);
    }
    for handle in succeeded {
        if let Some(action) = actions.remove(&handle) {
            rebound.add_success(action);
        }
    }
    rebound
}

fn log_outcome(
    action: &'static str,
    result: BatchResult<SqsFailure, Action>,
) -> BatchResult<SqsFailure, Action> {
    if !result.successes().is_empty() {
        debug!(
            sqs.action = action,
            sqs.messages.count = result.successes().len(),
            "Action succeeded"
        );
    }
    for (cause, entries) in result.failures() {
        warn!(
            sqs.action = action,
            sqs.messages.count = entries.len(),
            sqs.failure.kind = cause.kind(),
            sqs.operation = %cause.operation(),
            sqs.queue = %cause.queue(),
            error = %cause,
            "Action failed"
        );
    }
    result
}
