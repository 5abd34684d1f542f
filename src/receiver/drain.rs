use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::ConsumerError;

/// Controls a running consumption pipeline.
///
/// Draining stops new receives and lets every message already received finish its cycle:
/// handler, action, stop of tracking. Aborting cancels everything at once; messages in flight
/// become visible again once their visibility timeout lapses.
///
/// Dropping the handle does not stop the pipeline.
#[derive(Debug)]
pub struct DrainHandle {
    drain: CancellationToken,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl DrainHandle {
    pub(crate) fn new(
        drain: CancellationToken,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            drain,
            shutdown,
            task,
        }
    }

    /// Stops receiving new messages. Idempotent.
    pub fn drain(&self) {
        if !self.drain.is_cancelled() {
            info!("Draining consumer");
        }
        self.drain.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Whether the pipeline has fully stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the pipeline to stop, without initiating a drain.
    pub async fn join(self) -> Result<(), ConsumerError> {
        match self.task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(ConsumerError::Aborted),
            Err(e) => Err(ConsumerError::TaskFailed(e.to_string())),
        }
    }

    pub async fn drain_and_join(self) -> Result<(), ConsumerError> {
        self.drain();
        self.join().await
    }

    /// Cancels the pipeline without waiting for in-flight messages.
    pub fn abort(&self) {
        self.drain.cancel();
        self.shutdown.cancel();
        self.task.abort();
    }

    /// A token that drains the pipeline when cancelled.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }
}
