//! Tests against a real queue. Run with `cargo test -- --ignored` and the usual AWS
//! environment plus `TEST_SQS_QUEUE_URL` (a `.env` file is picked up).

use rs_sqs_consumer::client;
use rs_sqs_consumer::message::Message;
use rs_sqs_consumer::queue::QueueName;
use rs_sqs_consumer::receiver::{Action, ConsumeConfig, HandlerError, SqsReceiver};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;

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

async fn test_handler(message: Message, shared: SharedCounter) -> Result<Action, HandlerError> {
    println!("Received message: {}", message.content());
    shared.increment().await;
    Ok(Action::delete(message))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn queue_name_of(queue_url: &str) -> QueueName {
    QueueName::new(queue_url.rsplit('/').next().unwrap_or(queue_url))
}

#[tokio::test]
#[ignore = "needs AWS credentials and TEST_SQS_QUEUE_URL"]
async fn test_sqs_integration() {
    dotenvy::dotenv().ok();
    init_tracing();

    let queue_url = env::var("TEST_SQS_QUEUE_URL").expect("TEST_SQS_QUEUE_URL must be set");
    let sqs_client = client::create_sqs_client_from_env().await;

    for i in 1..=2 {
        let mut request = sqs_client
            .send_message()
            .queue_url(&queue_url)
            .message_body(format!("Test message {i}"));
        if queue_url.ends_with(".fifo") {
            request = request
                .message_deduplication_id(format!("test-message-{i}"))
                .message_group_id("test-group");
        }
        request.send().await.expect("Failed to send test message");
    }
    println!("Sent 2 test messages to queue");

    let shared_counter = SharedCounter::new();
    let connector = Arc::new(client::create_connector_from_env().await);
    let mut receiver = SqsReceiver::new(connector);
    receiver.add_handler_fn(
        queue_name_of(&queue_url),
        test_handler,
        shared_counter.clone(),
        Some(ConsumeConfig::default().with_receive_timeout(Duration::from_secs(5))),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let receive_task = tokio::spawn(receiver.run_until_shutdown(async move {
        shutdown_rx.await.ok();
    }));

    let timeout_result = timeout(Duration::from_secs(30), async {
        loop {
            let count = shared_counter.get_count().await;
            println!("Current message count: {}", count);
            if count >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await;

    let _ = shutdown_tx.send(());
    receive_task
        .await
        .expect("receiver task panicked")
        .expect("receiver stopped with an error");

    match timeout_result {
        Ok(_) => {
            let final_count = shared_counter.get_count().await;
            println!("Successfully processed {} messages", final_count);
            assert!(
                final_count >= 2,
                "Should have processed at least 2 messages"
            );
        }
        Err(_) => {
            let final_count = shared_counter.get_count().await;
            panic!("Test timed out. Only processed {} messages", final_count);
        }
    }
}

#[tokio::test]
#[ignore = "needs AWS credentials"]
async fn test_get_or_create_queue_with_dlq() {
    use rs_sqs_consumer::connector::SqsConnector;

    dotenvy::dotenv().ok();
    init_tracing();

    let connector = client::create_connector_from_env().await;
    let queue = connector
        .get_or_create_queue(&QueueName::new("rs-sqs-consumer-it"), true)
        .await
        .expect("Failed to create queue");

    let dlq = queue.dlq().expect("queue should have a DLQ");
    assert_eq!(dlq.name().as_str(), "rs-sqs-consumer-it_dlq");

    let again = connector
        .get_queue(&QueueName::new("rs-sqs-consumer-it"))
        .await
        .expect("Failed to look up queue");
    assert_eq!(again.url(), queue.url());
    assert_eq!(again.dlq().map(|dlq| dlq.url()), Some(dlq.url()));
}
