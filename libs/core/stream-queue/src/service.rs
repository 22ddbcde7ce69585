//! Host-side integration glue
//!
//! `QueueHost` owns one listener per registered queue and forwards every
//! successfully processed envelope to an optional `Notifier`, e.g. to relay
//! results back to the service that enqueued the work.

use crate::client::StreamClient;
use crate::envelope::MessageEnvelope;
use crate::error::{QueueError, QueueResult};
use crate::listener::{ListenHandle, MessageHandler, QueueListener};
use crate::options::ListenOptions;
use crate::registry::QueueDef;
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Suffix of the stream `StreamNotifier` publishes to
pub const RESULTS_SUFFIX: &str = ".results";

/// Field linking a published result to the entry that produced it
pub const SOURCE_ENTRY_FIELD: &str = "sourceEntryId";

/// Results stream key for a primary stream
pub fn results_key(stream: &str) -> String {
    format!("{}{}", stream, RESULTS_SUFFIX)
}

/// Receives envelopes whose handler succeeded
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, envelope: &MessageEnvelope) -> QueueResult<()>;
}

/// Republishes processed entries to `{stream}.results`
pub struct StreamNotifier {
    client: Arc<dyn StreamClient>,
    max_len: Option<u64>,
}

impl StreamNotifier {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        Self {
            client,
            max_len: None,
        }
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

#[async_trait]
impl Notifier for StreamNotifier {
    async fn notify(&self, envelope: &MessageEnvelope) -> QueueResult<()> {
        let mut fields = envelope.fields.clone();
        fields.insert(SOURCE_ENTRY_FIELD.to_string(), envelope.entry_id.clone());

        self.client
            .add(&results_key(&envelope.stream_key), &fields, self.max_len)
            .await?;
        Ok(())
    }
}

/// Logs processed entries
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, envelope: &MessageEnvelope) -> QueueResult<()> {
        info!(
            stream = %envelope.stream_key,
            entry_id = %envelope.entry_id,
            kind = ?envelope.kind(),
            delivery_count = envelope.delivery_count,
            "Entry processed"
        );
        Ok(())
    }
}

/// Forwards successes of the inner handler to a notifier.
///
/// A notifier failure is logged; the entry is still acknowledged.
pub struct NotifyingHandler {
    inner: Arc<dyn MessageHandler>,
    notifier: Arc<dyn Notifier>,
}

impl NotifyingHandler {
    pub fn new(inner: Arc<dyn MessageHandler>, notifier: Arc<dyn Notifier>) -> Self {
        Self { inner, notifier }
    }
}

#[async_trait]
impl MessageHandler for NotifyingHandler {
    async fn handle(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> QueueResult<bool> {
        let handled = self.inner.handle(envelope, cancel).await?;
        if handled
            && let Err(e) = self.notifier.notify(envelope).await
        {
            warn!(
                stream = %envelope.stream_key,
                entry_id = %envelope.entry_id,
                error = %e,
                "Notifier failed, acking anyway"
            );
        }
        Ok(handled)
    }
}

/// One queue the host should consume
#[derive(Clone)]
pub struct QueueRegistration {
    pub stream_key: String,
    pub group: String,
    /// Generated per listener when `None`
    pub consumer_name: Option<String>,
    pub handler: Arc<dyn MessageHandler>,
    pub options: ListenOptions,
}

impl QueueRegistration {
    pub fn new(
        stream_key: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            consumer_name: None,
            handler,
            options: ListenOptions::default(),
        }
    }

    /// Registration for a `QueueDef` with its default options
    pub fn from_def<Q: QueueDef>(handler: Arc<dyn MessageHandler>) -> Self {
        Self::new(Q::STREAM_KEY, Q::GROUP, handler).with_options(Q::options())
    }

    pub fn with_options(mut self, options: ListenOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_consumer_name(mut self, consumer_name: impl Into<String>) -> Self {
        self.consumer_name = Some(consumer_name.into());
        self
    }
}

/// Runs one listener per registered queue
pub struct QueueHost {
    listener: QueueListener,
    notifier: Option<Arc<dyn Notifier>>,
    registrations: Vec<QueueRegistration>,
    handles: Vec<ListenHandle>,
}

impl QueueHost {
    pub fn new(listener: QueueListener) -> Self {
        Self {
            listener,
            notifier: None,
            registrations: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Forward successfully handled entries of every queue to `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn register(&mut self, registration: QueueRegistration) -> &mut Self {
        self.registrations.push(registration);
        self
    }

    pub fn register_def<Q: QueueDef>(&mut self, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.register(QueueRegistration::from_def::<Q>(handler))
    }

    pub fn registrations(&self) -> &[QueueRegistration] {
        &self.registrations
    }

    /// Handles of the running listeners
    pub fn handles(&self) -> &[ListenHandle] {
        &self.handles
    }

    /// Start a listener for every registration.
    ///
    /// If any listener fails to start, the ones already running are stopped
    /// and the error is returned.
    pub async fn start(&mut self) -> QueueResult<()> {
        if !self.handles.is_empty() {
            return Err(QueueError::Config("queue host already started".into()));
        }

        for registration in self.registrations.clone() {
            let handler = match &self.notifier {
                Some(notifier) => Arc::new(NotifyingHandler::new(
                    registration.handler.clone(),
                    notifier.clone(),
                )) as Arc<dyn MessageHandler>,
                None => registration.handler.clone(),
            };

            let started = self
                .listener
                .listen(
                    &registration.stream_key,
                    &registration.group,
                    registration.consumer_name.clone(),
                    handler,
                    registration.options.clone(),
                )
                .await;

            match started {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    error!(
                        stream = %registration.stream_key,
                        group = %registration.group,
                        error = %e,
                        "Failed to start listener"
                    );
                    if let Err(stop_err) = self.stop().await {
                        warn!(error = %stop_err, "Failed to stop listeners after startup error");
                    }
                    return Err(e);
                }
            }
        }

        info!(queues = self.handles.len(), "Queue host started");
        Ok(())
    }

    /// Stop all listeners concurrently, waiting for in-flight handlers
    pub async fn stop(&mut self) -> QueueResult<()> {
        if self.handles.is_empty() {
            return Ok(());
        }

        let results = join_all(self.handles.drain(..).map(ListenHandle::stop)).await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Listener did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }

        info!("Queue host stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Start, run until `shutdown` resolves, then stop
    pub async fn run_until<F>(mut self, shutdown: F) -> QueueResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        info!("Shutdown requested, stopping listeners");
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockStreamClient;
    use crate::listener::handler_fn;
    use std::collections::HashMap;

    fn answering(result: bool) -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(move |_, _| async move { Ok(result) }))
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(
            "chat:requests",
            "3-0",
            HashMap::from([("type".to_string(), "chat".to_string())]),
        )
    }

    fn idle_options() -> ListenOptions {
        ListenOptions::new()
            .with_poll_delay_ms(10)
            .with_claim_pending_on_startup(false)
            .with_claim_interval_ms(0)
    }

    #[tokio::test]
    async fn test_stream_notifier_publishes_results() {
        let mut client = MockStreamClient::new();
        client
            .expect_add()
            .withf(|stream, fields, _| {
                stream == "chat:requests.results"
                    && fields.get("sourceEntryId").map(String::as_str) == Some("3-0")
                    && fields.get("type").map(String::as_str) == Some("chat")
            })
            .times(1)
            .returning(|_, _, _| Ok("4-0".into()));

        let notifier = StreamNotifier::new(Arc::new(client));
        notifier.notify(&envelope()).await.unwrap();
    }

    #[tokio::test]
    async fn test_notifier_failure_still_acks() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .times(1)
            .returning(|_| Err(QueueError::Protocol("READONLY".into())));

        let handler = NotifyingHandler::new(answering(true), Arc::new(notifier));
        let handled = handler
            .handle(&envelope(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(handled);
    }

    #[tokio::test]
    async fn test_rejected_entries_are_not_notified() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let handler = NotifyingHandler::new(answering(false), Arc::new(notifier));
        let handled = handler
            .handle(&envelope(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!handled);
    }

    #[tokio::test]
    async fn test_host_starts_and_stops_every_queue() {
        let mut client = MockStreamClient::new();
        client.expect_create_group().times(2).returning(|_, _, _| Ok(true));
        client.expect_consumer_pending().returning(|_, _, _, _| Ok(vec![]));
        client.expect_read_group().returning(|_, _, _, _| Ok(vec![]));

        let mut host = QueueHost::new(QueueListener::new(Arc::new(client)))
            .with_notifier(Arc::new(LogNotifier));
        host.register(QueueRegistration::new("a", "g", answering(true)).with_options(idle_options()))
            .register(
                QueueRegistration::new("b", "g", answering(true))
                    .with_options(idle_options())
                    .with_consumer_name("worker-b"),
            );

        host.start().await.unwrap();
        assert_eq!(host.handles().len(), 2);
        assert_eq!(host.handles()[1].consumer_name(), "worker-b");
        assert!(host.start().await.is_err());

        host.stop().await.unwrap();
        assert!(host.handles().is_empty());
    }

    #[tokio::test]
    async fn test_host_rolls_back_on_startup_failure() {
        let mut client = MockStreamClient::new();
        client.expect_create_group().returning(|stream, _, _| {
            if stream == "broken" {
                Err(QueueError::Protocol("WRONGTYPE".into()))
            } else {
                Ok(true)
            }
        });
        client.expect_consumer_pending().returning(|_, _, _, _| Ok(vec![]));
        client.expect_read_group().returning(|_, _, _, _| Ok(vec![]));

        let mut host = QueueHost::new(QueueListener::new(Arc::new(client)));
        host.register(QueueRegistration::new("ok", "g", answering(true)).with_options(idle_options()))
            .register(QueueRegistration::new("broken", "g", answering(true)));

        assert!(host.start().await.is_err());
        assert!(host.handles().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_returns_after_shutdown() {
        let mut client = MockStreamClient::new();
        client.expect_create_group().returning(|_, _, _| Ok(false));
        client.expect_consumer_pending().returning(|_, _, _, _| Ok(vec![]));
        client.expect_read_group().returning(|_, _, _, _| Ok(vec![]));

        let mut host = QueueHost::new(QueueListener::new(Arc::new(client)));
        host.register(QueueRegistration::new("q", "g", answering(true)).with_options(idle_options()));

        host.run_until(tokio::time::sleep(std::time::Duration::from_millis(20)))
            .await
            .unwrap();
    }
}
