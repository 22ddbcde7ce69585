//! Queue definitions and type-based handler dispatch.
//!
//! This module provides:
//! - `QueueDef` trait for naming a queue and its consumer group in one place
//! - `HandlerRegistry`, a `MessageHandler` that routes entries on their `type` field

use crate::dlq::dead_letter_key;
use crate::envelope::MessageEnvelope;
use crate::error::{QueueError, QueueResult};
use crate::listener::MessageHandler;
use crate::options::ListenOptions;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Queue definition trait.
///
/// Producers and consumers of a queue share one definition so stream and
/// group names cannot drift apart.
///
/// # Example
///
/// ```rust,ignore
/// use stream_queue::QueueDef;
///
/// pub struct ChatRequests;
///
/// impl QueueDef for ChatRequests {
///     const STREAM_KEY: &'static str = "chat:requests";
///     const GROUP: &'static str = "executors";
/// }
/// ```
pub trait QueueDef: Send + Sync {
    /// The Redis stream key
    const STREAM_KEY: &'static str;

    /// The consumer group reading the stream
    const GROUP: &'static str;

    /// Listener options for this queue
    fn options() -> ListenOptions {
        ListenOptions::default()
    }

    /// The dead-letter stream key
    fn dead_letter_key() -> String {
        dead_letter_key(Self::STREAM_KEY)
    }
}

/// Routes entries to handlers by their `type` field.
///
/// Entries with an unknown or missing type go to the fallback handler if one
/// is set; otherwise they fail, are retried and are eventually dead-lettered.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one entry type, replacing any previous one
    pub fn register(mut self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Handler for entries no registered type matches
    pub fn with_fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Registered entry types, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    fn resolve(&self, kind: Option<&str>) -> Option<&Arc<dyn MessageHandler>> {
        kind.and_then(|k| self.handlers.get(k))
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl MessageHandler for HandlerRegistry {
    async fn handle(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> QueueResult<bool> {
        let kind = envelope.kind();
        match self.resolve(kind) {
            Some(handler) => {
                debug!(entry_id = %envelope.entry_id, kind = ?kind, "Routing entry");
                handler.handle(envelope, cancel).await
            }
            None => Err(QueueError::handler(match kind {
                Some(kind) => format!("no handler registered for type '{}'", kind),
                None => "entry has no type field".to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::handler_fn;

    struct TestQueue;
    impl QueueDef for TestQueue {
        const STREAM_KEY: &'static str = "test:queue";
        const GROUP: &'static str = "test_workers";
    }

    fn typed(kind: Option<&str>) -> MessageEnvelope {
        let mut fields = HashMap::from([("job".to_string(), "1".to_string())]);
        if let Some(kind) = kind {
            fields.insert("type".to_string(), kind.to_string());
        }
        MessageEnvelope::new("q", "1-0", fields)
    }

    fn answering(result: bool) -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(move |_, _| async move { Ok(result) }))
    }

    #[test]
    fn test_queue_def() {
        assert_eq!(TestQueue::STREAM_KEY, "test:queue");
        assert_eq!(TestQueue::GROUP, "test_workers");
        assert_eq!(TestQueue::dead_letter_key(), "test:queue.deadletter");
        assert_eq!(TestQueue::options(), ListenOptions::default());
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let registry = HandlerRegistry::new()
            .register("chat", answering(true))
            .register("node", answering(false));
        let cancel = CancellationToken::new();

        assert!(registry.handle(&typed(Some("chat")), &cancel).await.unwrap());
        assert!(!registry.handle(&typed(Some("node")), &cancel).await.unwrap());
        assert_eq!(registry.kinds(), vec!["chat", "node"]);
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let registry = HandlerRegistry::new().register("chat", answering(true));
        let cancel = CancellationToken::new();

        let err = registry.handle(&typed(Some("video")), &cancel).await.unwrap_err();
        assert!(err.to_string().contains("video"));

        let err = registry.handle(&typed(None), &cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::Handler(_)));
    }

    #[tokio::test]
    async fn test_fallback() {
        let registry = HandlerRegistry::new()
            .register("chat", answering(false))
            .with_fallback(answering(true));
        let cancel = CancellationToken::new();

        assert!(registry.handle(&typed(None), &cancel).await.unwrap());
        assert!(registry.handle(&typed(Some("other")), &cancel).await.unwrap());
        assert!(!registry.handle(&typed(Some("chat")), &cancel).await.unwrap());
    }
}
