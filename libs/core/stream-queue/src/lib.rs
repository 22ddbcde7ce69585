//! Reliable work queues on Redis Streams.
//!
//! Producers append opaque field maps to a stream; consumers join a consumer
//! group and receive each entry with at-least-once semantics:
//!
//! - entries are acked only after the handler returns `Ok(true)`,
//! - entries a crashed consumer left unacked are claimed by others after an idle threshold,
//! - failing entries are retried and, after `max_retries`, moved to `{stream}.deadletter`,
//! - stopping a listener lets its in-flight handlers finish.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stream_queue::{connect, handler_fn, ListenOptions, QueueListener, QueueProducer, RedisStreamClient};
//!
//! let client = Arc::new(RedisStreamClient::new(connect("redis://127.0.0.1:6379").await?));
//!
//! let producer = QueueProducer::new(client.clone());
//! producer.enqueue("jobs", [("job".to_string(), "1".to_string())].into()).await?;
//!
//! let listener = QueueListener::new(client);
//! let handle = listener
//!     .listen("jobs", "workers", None, Arc::new(handler_fn(|envelope, _cancel| async move {
//!         println!("{:?}", envelope.fields);
//!         Ok(true)
//!     })), ListenOptions::default())
//!     .await?;
//!
//! handle.stop().await?;
//! ```

pub mod client;
pub mod connection;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod options;
pub mod producer;
pub mod registry;
pub mod service;

pub use client::{PendingEntry, RedisStreamClient, RedisStreamInfo, StreamClient};
pub use connection::{connect, connect_with_retry, RetryConfig};
pub use dlq::{
    dead_letter_key, DeadLetterEntry, DeadLetterField, DeadLetterQueue, DeadLetterStats,
    SHADOWED_FIELD_PREFIX,
};
pub use envelope::{MessageEnvelope, TYPE_FIELD};
pub use error::{ErrorCategory, QueueError, QueueResult};
pub use health::{admin_router, dead_letter_router, health_router, AdminState};
pub use listener::{handler_fn, FnHandler, ListenHandle, ListenerState, MessageHandler, QueueListener};
pub use metrics::{init_metrics, render_metrics, QueueMetrics};
pub use options::{default_consumer_name, ListenOptions};
pub use producer::{ProducerOptions, QueueProducer, PAYLOAD_FIELD};
pub use registry::{HandlerRegistry, QueueDef};
pub use service::{
    results_key, LogNotifier, Notifier, NotifyingHandler, QueueHost, QueueRegistration, StreamNotifier,
};

pub use tokio_util::sync::CancellationToken;
