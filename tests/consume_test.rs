use rs_sqs_consumer::connector::SqsConnector;
use rs_sqs_consumer::connector::memory::{InMemorySqs, RecordedCall};
use rs_sqs_consumer::errors::{ConfigError, ConsumerError, GenericError};
use rs_sqs_consumer::message::{Message, OutboundMessage};
use rs_sqs_consumer::queue::QueueName;
use rs_sqs_consumer::receiver::{
    Action, BackoffPolicy, ConsumeConfig, HandlerError, MessageConsumer, SqsReceiver, consume,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

#[derive(Clone)]
struct SharedCounter {
    count: Arc<Mutex<i32>>,
}

impl SharedCounter {
    fn new() -> Self {
        Self {
            count: Arc::new(Mutex::new(0)),
        }
    }

    async fn increment(&self) {
        let mut count = self.count.lock().await;
        *count += 1;
    }

    async fn get_count(&self) -> i32 {
        *self.count.lock().await
    }
}

async fn count_and_delete(message: Message, shared: SharedCounter) -> Result<Action, HandlerError> {
    shared.increment().await;
    Ok(Action::delete(message))
}

/// Polls `condition` every 100ms for up to a minute of (virtual) time.
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn bodies(prefix: &str, count: usize) -> Vec<OutboundMessage> {
    (0..count)
        .map(|i| OutboundMessage::new(format!("{prefix}-{i}")))
        .collect()
}

fn config() -> ConsumeConfig {
    ConsumeConfig::default().with_chunk_window(Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn test_individual_consumer_deletes_every_message() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), bodies("order", 25));
    let counter = SharedCounter::new();

    let consumer =
        MessageConsumer::individual_fn(count_and_delete, counter.clone()).with_parallelism(4);
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, config()).unwrap();

    eventually("all messages deleted", || sqs.message_count(queue.url()) == 0).await;
    handle.drain_and_join().await.unwrap();

    assert_eq!(counter.get_count().await, 25);
    let deletes: Vec<usize> = sqs
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::Delete { handles, .. } => Some(handles.len()),
            _ => None,
        })
        .collect();
    assert!(deletes.iter().all(|&count| count <= 10));
    assert_eq!(deletes.iter().sum::<usize>(), 25);
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_and_panic_are_retried_after_a_minute() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(
        queue.url(),
        [
            OutboundMessage::new("ok"),
            OutboundMessage::new("bad"),
            OutboundMessage::new("boom"),
        ],
    );

    let consumer = MessageConsumer::individual_fn(
        |message: Message, _: ()| async move {
            match message.content().as_str() {
                "bad" => Err(GenericError::new("cannot process").into()),
                "boom" => panic!("handler blew up"),
                _ => Ok(Action::delete(message)),
            }
        },
        (),
    );
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, config()).unwrap();

    eventually("ok message deleted", || sqs.message_count(queue.url()) == 2).await;
    sleep(Duration::from_secs(2)).await;
    handle.drain_and_join().await.unwrap();

    let retried: usize = sqs
        .visibility_changes()
        .iter()
        .filter(|change| change.duration == Duration::from_secs(60))
        .map(|change| change.handles.len())
        .sum();
    let mut left = sqs.bodies(queue.url());
    left.sort();
    assert_eq!(retried, 2);
    assert_eq!(left, vec!["bad".to_string(), "boom".to_string()]);
    assert_eq!(sqs.in_flight_count(queue.url()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_move_to_dlq() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue_with_dlq("orders");
    let dlq = queue.dlq().unwrap().clone();
    sqs.push(
        queue.url(),
        [OutboundMessage::new("fine"), OutboundMessage::new("poison")],
    );

    let consumer = MessageConsumer::individual_fn(
        |message: Message, _: ()| async move {
            if message.content() == "poison" {
                Ok(Action::move_to_dlq(message))
            } else {
                Ok(Action::delete(message))
            }
        },
        (),
    );
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, config()).unwrap();

    eventually("queue emptied", || sqs.message_count(queue.url()) == 0).await;
    handle.drain_and_join().await.unwrap();

    assert_eq!(sqs.bodies(dlq.url()), vec!["poison".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_move_to_dlq_without_dlq_keeps_the_message() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), [OutboundMessage::new("poison")]);
    let counter = SharedCounter::new();

    let consumer = MessageConsumer::individual_fn(
        |message: Message, shared: SharedCounter| async move {
            shared.increment().await;
            Ok(Action::move_to_dlq(message))
        },
        counter.clone(),
    );
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, config()).unwrap();

    eventually("message handled", || {
        sqs.calls().iter().any(|call| matches!(call, RecordedCall::Receive { received: 1, .. }))
    })
    .await;
    sleep(Duration::from_secs(5)).await;
    handle.drain_and_join().await.unwrap();

    assert_eq!(counter.get_count().await, 1);
    assert_eq!(sqs.message_count(queue.url()), 1);
    assert!(
        !sqs.calls()
            .iter()
            .any(|call| matches!(call, RecordedCall::Send { .. } | RecordedCall::Delete { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_keeps_message_invisible() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), [OutboundMessage::new("slow")]);
    let counter = SharedCounter::new();
    let visibility = Duration::from_secs(3);

    let consumer = MessageConsumer::individual_fn(
        |message: Message, shared: SharedCounter| async move {
            shared.increment().await;
            sleep(Duration::from_secs(7)).await;
            Ok(Action::delete(message))
        },
        counter.clone(),
    );
    let config = ConsumeConfig::default().with_visibility_timeout(visibility);
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, config).unwrap();

    eventually("message deleted", || sqs.message_count(queue.url()) == 0).await;
    sleep(Duration::from_secs(10)).await;
    handle.drain_and_join().await.unwrap();

    let extensions = sqs
        .visibility_changes()
        .into_iter()
        .filter(|change| change.duration == visibility)
        .count();
    assert!(extensions >= 2, "expected at least 2 extensions, got {extensions}");
    assert_eq!(counter.get_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drain_is_idempotent_and_waits_for_in_flight_messages() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), [OutboundMessage::new("in-flight")]);
    let counter = SharedCounter::new();

    let consumer = MessageConsumer::individual_fn(
        |message: Message, shared: SharedCounter| async move {
            shared.increment().await;
            sleep(Duration::from_secs(5)).await;
            Ok(Action::delete(message))
        },
        counter.clone(),
    );
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, ConsumeConfig::default()).unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(counter.get_count().await, 1);
    let drained_at = Instant::now();
    handle.drain();
    handle.drain();
    assert!(handle.is_draining());
    assert!(!handle.is_finished());

    handle.drain_and_join().await.unwrap();

    assert!(drained_at.elapsed() >= Duration::from_secs(4));
    assert_eq!(sqs.message_count(queue.url()), 0);
    sqs.push(queue.url(), [OutboundMessage::new("after-drain")]);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(counter.get_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_everything() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), [OutboundMessage::new("stuck")]);

    let consumer = MessageConsumer::individual_fn(
        |message: Message, _: ()| async move {
            std::future::pending::<()>().await;
            Ok(Action::delete(message))
        },
        (),
    );
    let handle = consume(
        Arc::clone(&sqs),
        queue.clone(),
        consumer,
        ConsumeConfig::default().with_visibility_timeout(Duration::from_secs(5)),
    )
    .unwrap();

    sleep(Duration::from_secs(10)).await;
    handle.abort();
    let renewals = sqs.visibility_changes().len();
    let result = handle.join().await;
    sleep(Duration::from_secs(30)).await;

    assert!(matches!(result, Err(ConsumerError::Aborted)));
    assert!(renewals >= 2);
    assert_eq!(sqs.visibility_changes().len(), renewals);
}

#[tokio::test(start_paused = true)]
async fn test_batch_consumer_missing_actions_are_retried() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), bodies("item", 4));

    let consumer = MessageConsumer::batch_fn(
        |messages: Vec<Message>, _: ()| async move {
            Ok(messages
                .into_iter()
                .filter(|message| message.content() == "item-0")
                .map(Action::delete)
                .collect())
        },
        (),
    );
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, ConsumeConfig::default()).unwrap();

    eventually("first message deleted", || sqs.message_count(queue.url()) == 3).await;
    handle.drain_and_join().await.unwrap();

    let retried: usize = sqs
        .visibility_changes()
        .iter()
        .filter(|change| change.duration == Duration::from_secs(60))
        .map(|change| change.handles.len())
        .sum();
    assert_eq!(retried, 3);
    assert_eq!(sqs.in_flight_count(queue.url()), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_durations_are_grouped_into_one_call_each() {
    let sqs = Arc::new(InMemorySqs::new());
    let queue = sqs.create_queue("orders");
    sqs.push(queue.url(), bodies("item", 6));

    let consumer = MessageConsumer::batch_fn(
        |messages: Vec<Message>, _: ()| async move {
            Ok(messages
                .into_iter()
                .enumerate()
                .map(|(i, message)| {
                    let backoff = if i % 2 == 0 { 10 } else { 20 };
                    Action::retry(message, Duration::from_secs(backoff))
                })
                .collect())
        },
        (),
    );
    let config = ConsumeConfig::default().with_automatic_visibility_extension(false);
    let handle = consume(Arc::clone(&sqs), queue.clone(), consumer, config).unwrap();

    eventually("retries issued", || sqs.visibility_changes().len() >= 2).await;
    handle.drain_and_join().await.unwrap();

    let changes = sqs.visibility_changes();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].duration, Duration::from_secs(10));
    assert_eq!(changes[0].handles.len(), 3);
    assert_eq!(changes[1].duration, Duration::from_secs(20));
    assert_eq!(changes[1].handles.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_queue_name_is_resolved_once_it_exists() {
    let sqs = Arc::new(InMemorySqs::new());
    let counter = SharedCounter::new();
    let config = config().with_resolve_backoff(
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(2)).without_jitter(),
    );

    let consumer = MessageConsumer::individual_fn(count_and_delete, counter.clone());
    let handle = consume(Arc::clone(&sqs), "late", consumer, config).unwrap();

    sleep(Duration::from_secs(5)).await;
    let queue = sqs.create_queue("late");
    sqs.push(queue.url(), bodies("late", 2));

    eventually("messages consumed", || sqs.message_count(queue.url()) == 0).await;
    handle.drain_and_join().await.unwrap();

    let lookups = sqs
        .calls()
        .iter()
        .filter(|call| matches!(call, RecordedCall::GetQueue { .. }))
        .count();
    assert!(lookups >= 3);
    assert_eq!(counter.get_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_drain_before_queue_exists_stops_cleanly() {
    let sqs = Arc::new(InMemorySqs::new());
    let consumer = MessageConsumer::individual_fn(count_and_delete, SharedCounter::new());
    let handle = consume(Arc::clone(&sqs), "missing", consumer, ConsumeConfig::default()).unwrap();

    sleep(Duration::from_secs(30)).await;
    handle.drain_and_join().await.unwrap();

    assert!(sqs.get_queue(&QueueName::new("missing")).await.is_err());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let sqs = Arc::new(InMemorySqs::new());
    let consumer = MessageConsumer::individual_fn(count_and_delete, SharedCounter::new());

    let zero_visibility = consume(
        Arc::clone(&sqs),
        "orders",
        consumer.clone(),
        ConsumeConfig::default().with_visibility_timeout(Duration::ZERO),
    );
    let zero_parallelism = consume(
        Arc::clone(&sqs),
        "orders",
        consumer.with_parallelism(0),
        ConsumeConfig::default(),
    );

    assert!(matches!(
        zero_visibility,
        Err(ConfigError::InvalidVisibilityTimeout(_))
    ));
    assert!(matches!(
        zero_parallelism,
        Err(ConfigError::InvalidParallelism)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_receiver_runs_all_consumers_until_shutdown() {
    let sqs = Arc::new(InMemorySqs::new());
    let first = sqs.create_queue("first");
    let second = sqs.create_queue("second");
    sqs.push(first.url(), bodies("a", 3));
    sqs.push(second.url(), bodies("b", 2));

    let first_counter = SharedCounter::new();
    let second_counter = SharedCounter::new();

    let mut receiver = SqsReceiver::new(Arc::clone(&sqs));
    receiver
        .add_handler_fn(first.clone(), count_and_delete, first_counter.clone(), Some(config()))
        .add_handler_fn("second", count_and_delete, second_counter.clone(), None);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let receive_task = tokio::spawn(receiver.run_until_shutdown(async move {
        shutdown_rx.await.ok();
    }));

    eventually("both queues emptied", || {
        sqs.message_count(first.url()) == 0 && sqs.message_count(second.url()) == 0
    })
    .await;
    let _ = shutdown_tx.send(());

    receive_task.await.unwrap().unwrap();
    assert_eq!(first_counter.get_count().await, 3);
    assert_eq!(second_counter.get_count().await, 2);
}
