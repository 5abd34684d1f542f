//! # AWS SQS Consumer
//!
//! An asynchronous AWS SQS consumption runtime: it receives messages, dispatches them to user
//! handlers, keeps in-flight messages invisible while their handlers run, and turns handler
//! verdicts into deletes, retries or dead-letter moves.
//!
//! ## Features
//!
//! - Individual and batch consumers, as trait objects or as async functions with a shared
//!   resource
//! - Automatic, just-in-time visibility extension of in-flight messages
//! - Batched wire operations (at most 10 entries per call) with per-entry failure reporting
//! - Retry with backoff on handler errors and panics, dead-letter moves on request
//! - Graceful draining: stop receiving, finish every message already received
//! - An in-memory connector for tests and local development
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rs_sqs_consumer::client::create_connector_from_env;
//! use rs_sqs_consumer::receiver::{consume, Action, ConsumeConfig, MessageConsumer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = Arc::new(create_connector_from_env().await);
//!     let shared_data = "shared state".to_string();
//!
//!     let consumer = MessageConsumer::individual_fn(
//!         |message, shared: String| async move {
//!             println!("Processing message: {} with shared: {}", message.content(), shared);
//!             Ok(Action::delete(message))
//!         },
//!         shared_data,
//!     );
//!
//!     let handle = consume(connector, "queue-name", consumer, ConsumeConfig::default())?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.drain_and_join().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod connector;
pub mod errors;
pub mod message;
pub mod queue;
pub mod receiver;
