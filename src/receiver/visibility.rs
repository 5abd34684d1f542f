//! Just-in-time visibility renewal for in-flight messages.
//!
//! Every received batch is registered in one tracking table and gets a renewal task. The task
//! wakes shortly before the batch's visibility deadline, reads the handles still live in the
//! batch and pushes their deadline out by the visibility timeout. Handles leave the table when
//! their action has been executed or when their renewal failed; a batch whose last handle leaves
//! is retired and its task ends.
//!
//! Registration, removal and the renewal read all go through the table's mutex, and the renewal
//! call is made while the mutex is held. Once [`VisibilityManager::stop_tracking`] returns, no
//! renewal can reference the removed handle anymore.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::config::ConsumeConfig;
use crate::connector::SqsConnector;
use crate::errors::SqsFailure;
use crate::message::{Message, MessageBound, ReceiptHandle};
use crate::queue::QueueUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BatchId(u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct TrackedBatch {
    queue_url: QueueUrl,
    handles: HashSet<ReceiptHandle>,
    emptied: Arc<Notify>,
}

#[derive(Debug, Default)]
struct TrackingTable {
    next_id: u64,
    handles: HashMap<ReceiptHandle, BatchId>,
    batches: HashMap<BatchId, TrackedBatch>,
}

impl TrackingTable {
    fn register(&mut self, queue_url: QueueUrl, handles: HashSet<ReceiptHandle>) -> (BatchId, Arc<Notify>) {
        let id = BatchId(self.next_id);
        self.next_id += 1;

        for handle in &handles {
            self.handles.insert(handle.clone(), id);
        }
        let emptied = Arc::new(Notify::new());
        self.batches.insert(
            id,
            TrackedBatch {
                queue_url,
                handles,
                emptied: Arc::clone(&emptied),
            },
        );
        (id, emptied)
    }

    fn remove(&mut self, handle: &ReceiptHandle) {
        let Some(id) = self.handles.remove(handle) else {
            return;
        };
        let Some(batch) = self.batches.get_mut(&id) else {
            return;
        };

        batch.handles.remove(handle);
        if batch.handles.is_empty() {
            if let Some(batch) = self.batches.remove(&id) {
                batch.emptied.notify_one();
            }
        }
    }
}

/// Renewal parameters shared by every renewal task.
#[derive(Debug, Clone, Copy)]
struct Renewal {
    interval: Duration,
    extension: Duration,
    retries: u32,
    /// Upper bound of one renewal round, retries included. Past it the messages become
    /// visible anyway.
    call_timeout: Duration,
}

/// Tracks in-flight receipt handles of one pipeline and renews their visibility.
pub(crate) struct VisibilityManager<C> {
    connector: Arc<C>,
    table: Arc<Mutex<TrackingTable>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    renewal: Renewal,
    enabled: bool,
}

impl<C: SqsConnector> VisibilityManager<C> {
    /// Renewal tasks stop when `shutdown` is cancelled.
    pub(crate) fn new(connector: Arc<C>, config: &ConsumeConfig, shutdown: CancellationToken) -> Self {
        Self {
            connector,
            table: Arc::new(Mutex::new(TrackingTable::default())),
            tasks: TaskTracker::new(),
            shutdown,
            renewal: Renewal {
                interval: config.renewal_interval(),
                extension: config.visibility_timeout,
                retries: config.renewal_retries,
                call_timeout: config.extension_threshold(),
            },
            enabled: config.automatic_visibility_extension,
        }
    }

    /// Registers freshly received messages, one batch per owning queue.
    pub(crate) async fn start_tracking(&self, messages: &[Message]) {
        if !self.enabled || messages.is_empty() {
            return;
        }

        let mut groups: HashMap<QueueUrl, HashSet<ReceiptHandle>> = HashMap::new();
        for message in messages {
            groups
                .entry(message.queue().url().clone())
                .or_default()
                .insert(message.receipt_handle().clone());
        }

        let mut table = self.table.lock().await;
        for (queue_url, handles) in groups {
            let count = handles.len();
            let (id, emptied) = table.register(queue_url.clone(), handles);
            debug!(
                visibility_batch.id = %id,
                sqs.queue.url = %queue_url,
                sqs.messages.count = count,
                "Tracking visibility of received messages"
            );

            self.tasks.spawn(renew_until_retired(
                Arc::clone(&self.connector),
                Arc::clone(&self.table),
                id,
                emptied,
                self.renewal,
                self.shutdown.clone(),
            ));
        }
    }

    /// Removes a handle from tracking. Idempotent.
    pub(crate) async fn stop_tracking(&self, handle: &ReceiptHandle) {
        if !self.enabled {
            return;
        }
        self.table.lock().await.remove(handle);
    }

    /// Number of handles currently tracked.
    pub(crate) async fn tracked_count(&self) -> usize {
        self.table.lock().await.handles.len()
    }

    /// Stops every renewal task and waits for them to exit.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn renew_until_retired<C: SqsConnector>(
    connector: Arc<C>,
    table: Arc<Mutex<TrackingTable>>,
    id: BatchId,
    emptied: Arc<Notify>,
    renewal: Renewal,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = emptied.notified() => {
                debug!(visibility_batch.id = %id, "All messages of batch handled, stopping renewal");
                return;
            }
            _ = tokio::time::sleep(renewal.interval) => {}
        }

        let mut guard = table.lock().await;
        let Some(batch) = guard.batches.get(&id) else {
            return;
        };
        if batch.handles.is_empty() {
            return;
        }

        let queue_url = batch.queue_url.clone();
        let handles: Vec<ReceiptHandle> = batch.handles.iter().cloned().collect();
        let dropped = match timeout(
            renewal.call_timeout,
            renew(connector.as_ref(), &queue_url, handles.clone(), id, renewal),
        )
        .await
        {
            Ok(dropped) => dropped,
            Err(_) => {
                warn!(
                    visibility_batch.id = %id,
                    sqs.messages.count = handles.len(),
                    timeout = ?renewal.call_timeout,
                    "Extending message visibility timed out, messages may be redelivered"
                );
                handles
            }
        };
        for handle in &dropped {
            guard.remove(handle);
        }
        drop(guard);
    }
}

/// Extends the visibility of `handles`, retrying non-benign failures up to `renewal.retries`
/// times. Returns the handles that could not be extended; they are no longer renewed.
async fn renew<C: SqsConnector>(
    connector: &C,
    queue_url: &QueueUrl,
    handles: Vec<ReceiptHandle>,
    id: BatchId,
    renewal: Renewal,
) -> Vec<ReceiptHandle> {
    let mut pending = handles;
    let mut dropped = Vec::new();
    let mut attempt = 0;

    loop {
        debug!(
            visibility_batch.id = %id,
            sqs.messages.count = pending.len(),
            extension = ?renewal.extension,
            "Extending message visibility"
        );
        let result = connector
            .extend_message_visibility(queue_url, pending, renewal.extension)
            .await;
        let (failed, _) = result.into_parts();

        let mut retryable = Vec::new();
        for (cause, entries) in failed {
            let handles = entries.into_iter().map(|entry| entry.reference);
            if let SqsFailure::MessageAlreadyDeleted { .. } = cause {
                debug!(
                    visibility_batch.id = %id,
                    sqs.messages.count = handles.len(),
                    "Messages were already deleted, no longer extending them"
                );
                dropped.extend(handles);
            } else if attempt < renewal.retries {
                retryable.extend(handles);
            } else {
                warn!(
                    visibility_batch.id = %id,
                    sqs.failure.kind = cause.kind(),
                    sqs.operation = %cause.operation(),
                    sqs.messages.count = handles.len(),
                    error = %cause,
                    "Failed to extend message visibility, messages may be redelivered"
                );
                dropped.extend(handles);
            }
        }

        if retryable.is_empty() {
            return dropped;
        }
        attempt += 1;
        pending = retryable;
    }
}
