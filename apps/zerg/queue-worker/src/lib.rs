//! Queue Worker Service
//!
//! Consumes one or more Redis streams through a shared consumer group and
//! relays every processed entry to `{stream}.results`.
//!
//! ```text
//! Redis Stream (chat:requests)
//!   ↓ (Consumer Group: executors)
//! QueueHost → RelayHandler
//!   ├─ ack → Redis Stream (chat:requests.results)
//!   └─ max retries → Redis Stream (chat:requests.deadletter)
//! ```
//!
//! Health, readiness, metrics and dead-letter admin endpoints are served on
//! `HEALTH_PORT` (default 8082).

use async_trait::async_trait;
use axum::Router;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::{app_info, env_or_default, ConfigError, Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use stream_queue::{
    admin_router, connect_with_retry, init_metrics, AdminState, CancellationToken, ListenOptions,
    MessageEnvelope, MessageHandler, QueueHost, QueueListener, QueueRegistration, QueueResult,
    RedisStreamClient, RetryConfig, StreamClient, StreamNotifier,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Worker settings read from the environment
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    /// Streams to consume (`QUEUE_STREAMS`, comma separated)
    pub streams: Vec<String>,
    /// Consumer group shared by all replicas (`QUEUE_GROUP`)
    pub group: String,
    /// Stable consumer name (`QUEUE_CONSUMER`); generated per stream when unset
    pub consumer: Option<String>,
    pub listen: ListenOptions,
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let streams: Vec<String> = env_or_default("QUEUE_STREAMS", "chat:requests")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        if streams.is_empty() {
            return Err(ConfigError::ParseError {
                key: "QUEUE_STREAMS".to_string(),
                details: "at least one stream is required".to_string(),
            });
        }

        let consumer = std::env::var("QUEUE_CONSUMER")
            .ok()
            .filter(|c| !c.trim().is_empty());

        Ok(Self {
            streams,
            group: env_or_default("QUEUE_GROUP", "executors"),
            consumer,
            listen: ListenOptions::from_env()?,
        })
    }
}

impl WorkerConfig {
    /// One registration per configured stream, all sharing `handler`
    pub fn registrations(&self, handler: Arc<dyn MessageHandler>) -> Vec<QueueRegistration> {
        self.streams
            .iter()
            .map(|stream| {
                let registration = QueueRegistration::new(stream, &self.group, handler.clone())
                    .with_options(self.listen.clone());
                match &self.consumer {
                    Some(consumer) => registration.with_consumer_name(consumer),
                    None => registration,
                }
            })
            .collect()
    }
}

/// Acknowledges typed entries and rejects the rest.
///
/// Untyped entries are retried and end up in the dead-letter stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayHandler;

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle(
        &self,
        envelope: &MessageEnvelope,
        _cancel: &CancellationToken,
    ) -> QueueResult<bool> {
        match envelope.kind() {
            Some(kind) => {
                debug!(
                    stream = %envelope.stream_key,
                    entry_id = %envelope.entry_id,
                    kind,
                    delivery_count = envelope.delivery_count,
                    "Relaying entry"
                );
                Ok(true)
            }
            None => {
                warn!(
                    stream = %envelope.stream_key,
                    entry_id = %envelope.entry_id,
                    delivery_count = envelope.delivery_count,
                    "Entry has no type field, rejecting"
                );
                Ok(false)
            }
        }
    }
}

/// Start the health and admin HTTP server
async fn start_health_server(state: AdminState, config: ServerConfig) -> Result<()> {
    let app: Router = admin_router(state).layer(TraceLayer::new_for_http());

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(%addr, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the queue worker until SIGINT or SIGTERM
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, ?environment, "Starting queue worker");

    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load queue configuration")?;
    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!(
        streams = ?worker_config.streams,
        group = %worker_config.group,
        consumer = ?worker_config.consumer,
        batch_size = worker_config.listen.batch_size,
        concurrency = worker_config.listen.concurrency,
        max_retries = worker_config.listen.max_retries,
        "Worker configuration loaded"
    );

    let conn = connect_with_retry(&redis_config.url, &RetryConfig::default())
        .await
        .wrap_err("Failed to connect to Redis")?;
    let client: Arc<dyn StreamClient> = Arc::new(RedisStreamClient::new(conn));

    let admin_state = AdminState::new(
        client.clone(),
        app_info.name,
        app_info.version,
        worker_config.group.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = start_health_server(admin_state, server_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut host = QueueHost::new(QueueListener::new(client.clone()))
        .with_notifier(Arc::new(StreamNotifier::new(client)));
    for registration in worker_config.registrations(Arc::new(RelayHandler)) {
        host.register(registration);
    }

    host.run_until(shutdown_signal())
        .await
        .wrap_err("Queue host failed")?;

    info!("Queue worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const QUEUE_VARS: [&str; 3] = ["QUEUE_STREAMS", "QUEUE_GROUP", "QUEUE_CONSUMER"];

    #[test]
    fn test_worker_config_defaults() {
        temp_env::with_vars_unset(QUEUE_VARS, || {
            let config = WorkerConfig::from_env().unwrap();
            assert_eq!(config.streams, vec!["chat:requests".to_string()]);
            assert_eq!(config.group, "executors");
            assert_eq!(config.consumer, None);
        });
    }

    #[test]
    fn test_worker_config_multiple_streams() {
        temp_env::with_vars(
            [
                ("QUEUE_STREAMS", Some("jobs, emails,,")),
                ("QUEUE_GROUP", Some("workers")),
                ("QUEUE_CONSUMER", Some("pod-1")),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.streams, vec!["jobs".to_string(), "emails".to_string()]);

                let registrations = config.registrations(Arc::new(RelayHandler));
                assert_eq!(registrations.len(), 2);
                assert_eq!(registrations[1].stream_key, "emails");
                assert_eq!(registrations[1].group, "workers");
                assert_eq!(registrations[0].consumer_name.as_deref(), Some("pod-1"));
            },
        );
    }

    #[test]
    fn test_worker_config_rejects_empty_stream_list() {
        temp_env::with_var("QUEUE_STREAMS", Some(" , "), || {
            let err = WorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_STREAMS"));
        });
    }

    #[tokio::test]
    async fn test_relay_handler_acks_typed_entries() {
        let envelope = MessageEnvelope::new(
            "jobs",
            "1-0",
            HashMap::from([("type".to_string(), "echo".to_string())]),
        );

        let handled = RelayHandler
            .handle(&envelope, &CancellationToken::new())
            .await
            .unwrap();
        assert!(handled);
    }

    #[tokio::test]
    async fn test_relay_handler_rejects_untyped_entries() {
        let envelope = MessageEnvelope::new(
            "jobs",
            "1-0",
            HashMap::from([("body".to_string(), "hi".to_string())]),
        );

        let handled = RelayHandler
            .handle(&envelope, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!handled);
    }
}
