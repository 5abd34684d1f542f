use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::batch::SQS_BATCH_SIZE;
use crate::connector::SqsConnector;
use crate::errors::{ConfigError, ConsumerError};
use crate::message::Message;
use crate::queue::Queue;

mod actions;
mod chunked;
pub mod config;
mod drain;
mod functions;
mod retry;
mod visibility;

pub use config::{BackoffPolicy, ConsumeConfig, ConsumerConfiguration};
pub use drain::DrainHandle;
pub use functions::{
    Action, BatchConsumer, BatchConsumerFn, FAILURE_BACKOFF, HandlerError, IndividualConsumer,
    IndividualConsumerFn, MessageConsumer,
};
pub use retry::QueueSource;

use actions::execute_actions;
use chunked::next_chunk;
use functions::{dispatch_batch, dispatch_individual};
use retry::{resolve_queue, retry_indefinitely};
use visibility::VisibilityManager;

/// Starts consuming `source` with `consumer` on the current tokio runtime.
///
/// The pipeline resolves the queue (retrying until it exists), then receives batches, tracks
/// their visibility, hands them to the consumer and executes the returned actions. It runs until
/// the returned handle drains or aborts it.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rs_sqs_consumer::client::create_connector_from_env;
/// use rs_sqs_consumer::receiver::{consume, Action, ConsumeConfig, MessageConsumer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let connector = Arc::new(create_connector_from_env().await);
///     let consumer = MessageConsumer::individual_fn(
///         |message, _: ()| async move {
///             println!("Processing message: {}", message.content());
///             Ok(Action::delete(message))
///         },
///         (),
///     );
///
///     let handle = consume(connector, "orders", consumer, ConsumeConfig::default())?;
///     tokio::signal::ctrl_c().await?;
///     handle.drain_and_join().await?;
///     Ok(())
/// }
/// ```
pub fn consume<C: SqsConnector>(
    connector: Arc<C>,
    source: impl Into<QueueSource>,
    consumer: MessageConsumer,
    config: ConsumeConfig,
) -> Result<DrainHandle, ConfigError> {
    config.validate()?;
    consumer.configuration().validate()?;

    let source = source.into();
    let span = match &source {
        QueueSource::Resolved(queue) => info_span!(
            "sqs_consumer",
            sqs.queue.name = %queue.name(),
            sqs.queue.url = %queue.url()
        ),
        QueueSource::Name(name) => info_span!("sqs_consumer", sqs.queue.name = %name),
    };

    let drain = CancellationToken::new();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(
        run_subscription(
            connector,
            source,
            consumer,
            config,
            drain.clone(),
            shutdown.clone(),
        )
        .instrument(span),
    );

    Ok(DrainHandle::new(drain, shutdown, task))
}

/// Everything one pipeline needs, shared by its receive loop and its handler tasks.
struct Pipeline<C> {
    connector: Arc<C>,
    queue: Arc<Queue>,
    config: ConsumeConfig,
    visibility: Arc<VisibilityManager<C>>,
    drain: CancellationToken,
}

impl<C: SqsConnector> Pipeline<C> {
    /// Receives the next non-empty batch and registers it for visibility tracking. Returns
    /// `None` once draining.
    async fn next_batch(&self) -> Option<Vec<Message>> {
        loop {
            let messages = retry_indefinitely(
                "receive messages",
                &self.config.receive_backoff,
                &self.drain,
                || {
                    self.connector.receive_messages(
                        &self.queue,
                        self.config.receive_timeout,
                        self.config.visibility_timeout,
                    )
                },
            )
            .await?;

            if messages.is_empty() {
                debug!("No messages received");
                continue;
            }
            debug!(sqs.messages.count = messages.len(), "Received messages");
            self.visibility.start_tracking(&messages).await;
            return Some(messages);
        }
    }
}

async fn run_subscription<C: SqsConnector>(
    connector: Arc<C>,
    source: QueueSource,
    consumer: MessageConsumer,
    config: ConsumeConfig,
    drain: CancellationToken,
    shutdown: CancellationToken,
) {
    let Some(queue) = resolve_queue(connector.as_ref(), source, &config, &drain).await else {
        info!("Consumer drained before the queue was resolved");
        return;
    };

    let visibility = Arc::new(VisibilityManager::new(
        Arc::clone(&connector),
        &config,
        shutdown.child_token(),
    ));
    let pipeline = Arc::new(Pipeline {
        connector,
        queue,
        config,
        visibility: Arc::clone(&visibility),
        drain,
    });

    info!(
        sqs.queue.url = %pipeline.queue.url(),
        parallelism = consumer.configuration().parallelism,
        "Consumer started"
    );
    match consumer {
        MessageConsumer::Individual {
            consumer,
            configuration,
        } => run_individual(Arc::clone(&pipeline), consumer, configuration.parallelism).await,
        MessageConsumer::Batch {
            consumer,
            configuration,
        } => run_batch(Arc::clone(&pipeline), consumer, configuration.parallelism).await,
    }

    let leftover = visibility.tracked_count().await;
    if leftover > 0 {
        warn!(
            sqs.messages.count = leftover,
            "Consumer stopped with tracked messages left, they will be redelivered"
        );
    }
    visibility.shutdown().await;
    info!("Consumer stopped");
}

/// Dispatches messages one by one to at most `parallelism` concurrent handler invocations. The
/// resulting actions are collected into chunks before being executed.
async fn run_individual<C: SqsConnector>(
    pipeline: Arc<Pipeline<C>>,
    consumer: Arc<dyn IndividualConsumer>,
    parallelism: usize,
) {
    let (tx, rx) = mpsc::channel::<Action>(parallelism.max(SQS_BATCH_SIZE));
    let collector = collect_actions(Arc::clone(&pipeline), rx);

    let receiving = async move {
        let permits = Arc::new(Semaphore::new(parallelism));
        let mut handlers = JoinSet::new();

        while let Some(messages) = pipeline.next_batch().await {
            for message in messages {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let consumer = Arc::clone(&consumer);
                let tx = tx.clone();
                handlers.spawn(
                    async move {
                        let action = dispatch_individual(&consumer, message).await;
                        if tx.send(action).await.is_err() {
                            error!("Action collector stopped, message will be redelivered");
                        }
                        drop(permit);
                    }
                    .in_current_span(),
                );
            }
            reap_finished(&mut handlers);
        }

        info!("Draining, waiting for in-flight messages");
        join_all(&mut handlers).await;
    };

    tokio::join!(receiving, collector);
}

async fn collect_actions<C: SqsConnector>(pipeline: Arc<Pipeline<C>>, mut rx: mpsc::Receiver<Action>) {
    let window = pipeline.config.chunk_window();
    while let Some(chunk) = next_chunk(&mut rx, SQS_BATCH_SIZE, window).await {
        execute_actions(pipeline.connector.as_ref(), &pipeline.visibility, chunk).await;
    }
}

/// Hands whole batches to at most `parallelism` concurrent handler invocations and executes
/// their actions right away.
async fn run_batch<C: SqsConnector>(
    pipeline: Arc<Pipeline<C>>,
    consumer: Arc<dyn BatchConsumer>,
    parallelism: usize,
) {
    let permits = Arc::new(Semaphore::new(parallelism));
    let mut handlers = JoinSet::new();

    loop {
        // Receive only with a free slot so no batch waits idle while its visibility ticks.
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(messages) = pipeline.next_batch().await else {
            break;
        };

        let consumer = Arc::clone(&consumer);
        let pipeline = Arc::clone(&pipeline);
        handlers.spawn(
            async move {
                let actions = dispatch_batch(&consumer, messages).await;
                execute_actions(pipeline.connector.as_ref(), &pipeline.visibility, actions).await;
                drop(permit);
            }
            .in_current_span(),
        );
        reap_finished(&mut handlers);
    }

    info!("Draining, waiting for in-flight batches");
    join_all(&mut handlers).await;
}

fn reap_finished(handlers: &mut JoinSet<()>) {
    while let Some(outcome) = handlers.try_join_next() {
        if let Err(e) = outcome {
            error!(error = %e, "Handler task failed");
        }
    }
}

async fn join_all(handlers: &mut JoinSet<()>) {
    while let Some(outcome) = handlers.join_next().await {
        if let Err(e) = outcome {
            error!(error = %e, "Handler task failed");
        }
    }
}

/// A consumer registered on [`SqsReceiver`].
struct Subscription {
    source: QueueSource,
    consumer: MessageConsumer,
    config: ConsumeConfig,
}

/// Runs consumers for several queues over one connector.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rs_sqs_consumer::client::create_connector_from_env;
/// use rs_sqs_consumer::receiver::{Action, SqsReceiver};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let connector = Arc::new(create_connector_from_env().await);
///     let mut receiver = SqsReceiver::new(connector);
///     receiver.add_handler_fn(
///         "orders",
///         |message, counter: Arc<std::sync::atomic::AtomicUsize>| async move {
///             counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///             Ok(Action::delete(message))
///         },
///         Arc::new(std::sync::atomic::AtomicUsize::new(0)),
///         None,
///     );
///
///     receiver
///         .run_until_shutdown(async {
///             tokio::signal::ctrl_c().await.ok();
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct SqsReceiver<C> {
    connector: Arc<C>,
    subscriptions: Vec<Subscription>,
}

impl<C: SqsConnector> SqsReceiver<C> {
    pub fn new(connector: Arc<C>) -> Self {
        SqsReceiver {
            connector,
            subscriptions: Vec::new(),
        }
    }

    /// Registers a consumer. `config` defaults to [`ConsumeConfig::default`].
    pub fn add_consumer(
        &mut self,
        source: impl Into<QueueSource>,
        consumer: MessageConsumer,
        config: Option<ConsumeConfig>,
    ) -> &mut Self {
        self.subscriptions.push(Subscription {
            source: source.into(),
            consumer,
            config: config.unwrap_or_default(),
        });
        self
    }

    /// Registers an async function handling each message with a clone of `shared_resources`.
    pub fn add_handler_fn<RFn, Fut, TShared>(
        &mut self,
        source: impl Into<QueueSource>,
        rv_fn: RFn,
        shared_resources: TShared,
        config: Option<ConsumeConfig>,
    ) -> &mut Self
    where
        RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action, HandlerError>> + Send + 'static,
        TShared: Clone + Send + Sync + 'static,
    {
        self.add_consumer(
            source,
            MessageConsumer::individual_fn(rv_fn, shared_resources),
            config,
        )
    }

    /// Starts every registered consumer. Nothing is started if any configuration is invalid.
    pub fn start_all(self) -> Result<Vec<DrainHandle>, ConfigError> {
        for subscription in &self.subscriptions {
            subscription.config.validate()?;
            subscription.consumer.configuration().validate()?;
        }

        self.subscriptions
            .into_iter()
            .map(|subscription| {
                consume(
                    Arc::clone(&self.connector),
                    subscription.source,
                    subscription.consumer,
                    subscription.config,
                )
            })
            .collect()
    }

    /// Starts every registered consumer, waits for `shutdown`, then drains all of them.
    ///
    /// Returns the first error reported by a consumer, after every consumer has stopped.
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ConsumerError> {
        let handles = self.start_all()?;
        info!(consumers = handles.len(), "All consumers started");

        shutdown.await;
        info!("Shutdown requested, draining all consumers");
        for handle in &handles {
            handle.drain();
        }

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.join().await {
                error!(error = %e, "Consumer stopped with an error");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
