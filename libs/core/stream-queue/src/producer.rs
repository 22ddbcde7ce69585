//! Queue producer
//!
//! Any service can enqueue work without a consumer running: entries are
//! appended with `XADD`, and the consumer group can optionally be created up
//! front so entries written before the first listener starts are not skipped.
//!
//! # Example
//!
//! ```rust,ignore
//! use stream_queue::{ProducerOptions, QueueProducer};
//!
//! let producer = QueueProducer::new(client)
//!     .with_options(ProducerOptions::new().with_group("executors"));
//!
//! let id = producer
//!     .enqueue_typed("chat:requests", "chat", &request)
//!     .await?;
//! ```

use crate::client::StreamClient;
use crate::envelope::TYPE_FIELD;
use crate::error::QueueResult;
use crate::registry::QueueDef;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Field holding the JSON body written by `enqueue_typed`
pub const PAYLOAD_FIELD: &str = "payload";

/// Producer behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerOptions {
    /// Create the stream and `group` before the first write to each stream
    pub create_stream_if_missing: bool,

    /// Group to pre-create; ignored unless `create_stream_if_missing`
    pub group: Option<String>,

    /// Approximate stream length cap (`MAXLEN ~`)
    pub max_len: Option<u64>,
}

impl ProducerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create `group` (and the stream) on first use
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self.create_stream_if_missing = true;
        self
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

/// Appends entries to queue streams
pub struct QueueProducer {
    client: Arc<dyn StreamClient>,
    options: ProducerOptions,
    /// Streams whose group has already been ensured by this producer
    prepared: Mutex<HashSet<String>>,
}

impl QueueProducer {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        Self {
            client,
            options: ProducerOptions::default(),
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Producer that pre-creates the group of a queue definition
    pub fn for_queue<Q: QueueDef>(client: Arc<dyn StreamClient>) -> Self {
        Self::new(client).with_options(ProducerOptions::new().with_group(Q::GROUP))
    }

    pub fn with_options(mut self, options: ProducerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Append an entry. Returns the broker-assigned entry ID.
    pub async fn enqueue(&self, stream: &str, fields: HashMap<String, String>) -> QueueResult<String> {
        self.prepare(stream).await?;

        let id = self.client.add(stream, &fields, self.options.max_len).await?;
        debug!(stream = %stream, entry_id = %id, "Enqueued entry");
        Ok(id)
    }

    /// Append `{type: kind, payload: <json>}`
    pub async fn enqueue_typed<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        kind: &str,
        payload: &T,
    ) -> QueueResult<String> {
        let fields = HashMap::from([
            (TYPE_FIELD.to_string(), kind.to_string()),
            (PAYLOAD_FIELD.to_string(), serde_json::to_string(payload)?),
        ]);
        self.enqueue(stream, fields).await
    }

    /// Append several entries in order, stopping at the first failure
    pub async fn enqueue_batch(
        &self,
        stream: &str,
        entries: Vec<HashMap<String, String>>,
    ) -> QueueResult<Vec<String>> {
        let mut ids = Vec::with_capacity(entries.len());
        for fields in entries {
            ids.push(self.enqueue(stream, fields).await?);
        }
        Ok(ids)
    }

    /// Ensure the configured group exists, once per stream
    async fn prepare(&self, stream: &str) -> QueueResult<()> {
        if !self.options.create_stream_if_missing {
            return Ok(());
        }
        let Some(group) = self.options.group.as_deref() else {
            return Ok(());
        };

        let mut prepared = self.prepared.lock().await;
        if prepared.contains(stream) {
            return Ok(());
        }

        self.client.create_group(stream, group, true).await?;
        prepared.insert(stream.to_string());
        Ok(())
    }
}
