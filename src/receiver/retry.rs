use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::{BackoffPolicy, ConsumeConfig};
use crate::connector::SqsConnector;
use crate::errors::SqsFailure;
use crate::queue::{Queue, QueueName};

/// Repeats `operation` until it succeeds, sleeping according to `backoff` in between.
///
/// Returns `None` if `cancel` fires first.
pub(crate) async fn retry_indefinitely<T, F, Fut>(
    what: &'static str,
    backoff: &BackoffPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SqsFailure>>,
{
    let mut attempt = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = operation() => outcome,
        };

        let failure = match outcome {
            Ok(value) => return Some(value),
            Err(failure) => failure,
        };

        let delay = backoff.delay(attempt);
        warn!(
            operation = what,
            attempt = attempt + 1,
            retry_in = ?delay,
            sqs.failure.kind = failure.kind(),
            sqs.queue = %failure.queue(),
            error = %failure,
            "Call failed, retrying"
        );
        attempt = attempt.saturating_add(1);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Where a pipeline takes its messages from.
#[derive(Debug, Clone)]
pub enum QueueSource {
    /// An already resolved queue.
    Resolved(Queue),
    /// A queue name, resolved (with retries) when the pipeline starts.
    Name(QueueName),
}

impl From<Queue> for QueueSource {
    fn from(queue: Queue) -> Self {
        Self::Resolved(queue)
    }
}

impl From<QueueName> for QueueSource {
    fn from(name: QueueName) -> Self {
        Self::Name(name)
    }
}

impl From<&str> for QueueSource {
    fn from(name: &str) -> Self {
        Self::Name(QueueName::new(name))
    }
}

/// Resolves the source to a queue, retrying lookups indefinitely.
pub(crate) async fn resolve_queue<C: SqsConnector>(
    connector: &C,
    source: QueueSource,
    config: &ConsumeConfig,
    cancel: &CancellationToken,
) -> Option<Arc<Queue>> {
    let name = match source {
        QueueSource::Resolved(queue) => return Some(Arc::new(queue)),
        QueueSource::Name(name) => name,
    };

    let queue = retry_indefinitely("resolve queue", &config.resolve_backoff, cancel, || {
        connector.get_queue(&name)
    })
    .await?;

    info!(
        sqs.queue.name = %queue.name(),
        sqs.queue.url = %queue.url(),
        sqs.dlq.name = queue.dlq().map(|dlq| dlq.name().as_str()),
        "Resolved queue"
    );
    Some(Arc::new(queue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::memory::{InMemorySqs, RecordedCall};
    use crate::errors::Operation;
    use crate::queue::QueueId;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_resolve_waits_for_queue_to_appear() {
        let sqs = Arc::new(InMemorySqs::new());
        let config = ConsumeConfig::default().with_resolve_backoff(
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(4)).without_jitter(),
        );
        let creator = {
            let sqs = Arc::clone(&sqs);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                sqs.create_queue("late");
            })
        };

        let queue = resolve_queue(
            sqs.as_ref(),
            QueueSource::from("late"),
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        creator.await.unwrap();

        let lookups = sqs
            .calls()
            .iter()
            .filter(|call| matches!(call, RecordedCall::GetQueue { .. }))
            .count();
        assert_eq!(queue.name().as_str(), "late");
        // 0s, 1s, 3s, 7s, 11s
        assert_eq!(lookups, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retrying() {
        let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            })
        };

        let outcome: Option<()> = retry_indefinitely("receive", &backoff, &cancel, || async {
            Err(SqsFailure::Throttled {
                operation: Operation::ReceiveMessages,
                queue: QueueId::Name(QueueName::new("orders")),
            })
        })
        .await;
        canceller.await.unwrap();

        assert!(outcome.is_none());
    }
}
