//! Stream client for Redis operations
//!
//! Thin, retry-free wrappers over the Redis Streams commands the queue needs.
//! The `StreamClient` trait is the seam the listener, producer and dead-letter
//! queue are written against; `RedisStreamClient` is the production
//! implementation over a shared `ConnectionManager`.

use crate::envelope::MessageEnvelope;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Raw entry as returned by XREADGROUP/XCLAIM/XRANGE; fields are nil for deleted entries
type RawEntry = (String, Option<Vec<(String, String)>>);

/// XREADGROUP reply: one `(stream, entries)` pair per requested stream
type ReadReply = Option<Vec<(String, Vec<RawEntry>)>>;

/// One row of the extended XPENDING form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub entry_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u32,
}

/// Read-only snapshot of a stream and one of its groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedisStreamInfo {
    /// Total entries in the stream
    pub length: i64,
    /// Delivered but unacknowledged entries in the group
    pub total_pending: i64,
    /// Pending entries per consumer
    pub consumer_pending: HashMap<String, i64>,
}

/// Redis Streams operations used by the queue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Append an entry, optionally trimming the stream to roughly `max_len` entries
    async fn add(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        max_len: Option<u64>,
    ) -> QueueResult<String>;

    /// Create a consumer group starting at the beginning of the stream.
    ///
    /// Returns `false` when the group already exists.
    async fn create_group(&self, stream: &str, group: &str, create_stream: bool)
        -> QueueResult<bool>;

    /// Read up to `count` never-delivered entries for `consumer`
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>>;

    /// Re-read up to `count` entries already delivered to `consumer` and not yet acked
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>>;

    /// Pending entries of the whole group, oldest first
    async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>>;

    /// Pending entries owned by one consumer, oldest first
    async fn consumer_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>>;

    /// Take ownership of the given pending entries if they are still idle for `min_idle_ms`
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        pending: &[PendingEntry],
    ) -> QueueResult<Vec<MessageEnvelope>>;

    /// Claim up to `count` entries of any consumer that have been idle for `min_idle_ms`
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>>;

    /// Acknowledge an entry. Returns `false` if it was not pending.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> QueueResult<bool>;

    /// Delete an entry from the stream. Returns `false` if it did not exist.
    async fn delete(&self, stream: &str, entry_id: &str) -> QueueResult<bool>;

    /// Entries between `start` and `end` (inclusive, `-`/`+` for the ends)
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>>;

    /// Entries from `end` down to `start`, newest first
    async fn rev_range(
        &self,
        stream: &str,
        end: &str,
        start: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>>;

    /// Trim the stream to exactly `max_len` entries. Returns the number removed.
    async fn trim(&self, stream: &str, max_len: u64) -> QueueResult<u64>;

    /// Stream length; 0 for a missing key
    async fn len(&self, stream: &str) -> QueueResult<u64>;

    /// Length and pending summary for a group
    async fn info(&self, stream: &str, group: &str) -> QueueResult<RedisStreamInfo>;

    /// Round-trip to the broker
    async fn ping(&self) -> QueueResult<()>;
}

/// `StreamClient` backed by a multiplexed, auto-reconnecting connection
#[derive(Clone)]
pub struct RedisStreamClient {
    conn: ConnectionManager,
}

impl RedisStreamClient {
    /// Create a new client over an existing connection
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Get a handle to the underlying connection
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn xpending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: Option<u64>,
        count: usize,
        consumer: Option<&str>,
    ) -> QueueResult<Vec<PendingEntry>> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let rows: Vec<(String, String, u64, u64)> =
            xpending_cmd(stream, group, min_idle_ms, count, consumer)
                .query_async(&mut conn)
                .await?;
        Ok(rows.into_iter().map(pending_from_row).collect())
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn add(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        max_len: Option<u64>,
    ) -> QueueResult<String> {
        if fields.is_empty() {
            return Err(QueueError::Config(format!(
                "cannot add an entry without fields to {}",
                stream
            )));
        }

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream = %stream, entry_id = %id, "Added entry");
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        create_stream: bool,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0");
        if create_stream {
            cmd.arg("MKSTREAM");
        }

        let result: RedisResult<()> = cmd.query_async(&mut conn).await;
        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(true)
            }
            Err(e) if is_busy_group(&e) => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let reply: ReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut envelopes = envelopes_from_read(stream, reply, &HashMap::new());
        envelopes.truncate(count);
        Ok(envelopes)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let reply: ReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg("0")
            .query_async(&mut conn)
            .await?;

        // History reads carry no delivery counts; take them from the PEL afterwards
        let counts: HashMap<String, u32> = self
            .xpending(stream, group, None, count, Some(consumer))
            .await?
            .into_iter()
            .map(|p| (p.entry_id, p.delivery_count))
            .collect();

        Ok(envelopes_from_read(stream, reply, &counts))
    }

    async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        self.xpending(stream, group, None, count, None).await
    }

    async fn consumer_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        self.xpending(stream, group, None, count, Some(consumer)).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        pending: &[PendingEntry],
    ) -> QueueResult<Vec<MessageEnvelope>> {
        if pending.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for entry in pending {
            cmd.arg(&entry.entry_id);
        }

        let claimed: Vec<Option<RawEntry>> = cmd.query_async(&mut conn).await?;

        let previous: HashMap<&str, u32> = pending
            .iter()
            .map(|p| (p.entry_id.as_str(), p.delivery_count))
            .collect();

        let envelopes: Vec<MessageEnvelope> = claimed
            .into_iter()
            .flatten()
            .filter_map(|(id, fields)| {
                let fields = fields?;
                let count = previous.get(id.as_str()).copied().unwrap_or(0) + 1;
                Some(MessageEnvelope::from_pairs(stream, id, fields, count))
            })
            .collect();

        debug!(
            stream = %stream,
            consumer = %consumer,
            requested = pending.len(),
            claimed = envelopes.len(),
            "Claimed entries"
        );
        Ok(envelopes)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        // Broker-side IDLE filter: the scan window holds only idle entries
        let pending = self
            .xpending(stream, group, Some(min_idle_ms), count, None)
            .await?;

        let idle: Vec<PendingEntry> = pending
            .into_iter()
            .filter(|p| p.idle_ms >= min_idle_ms)
            .collect();

        if idle.is_empty() {
            return Ok(vec![]);
        }

        let envelopes = self.claim(stream, group, consumer, min_idle_ms, &idle).await?;
        if !envelopes.is_empty() {
            warn!(
                stream = %stream,
                consumer = %consumer,
                count = envelopes.len(),
                "Claimed abandoned entries"
            );
        }
        Ok(envelopes)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %stream, entry_id = %entry_id, acked = acked > 0, "Acknowledged entry");
        Ok(acked > 0)
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let entries: Vec<RawEntry> = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(envelopes_from_entries(stream, entries, &HashMap::new()))
    }

    async fn rev_range(
        &self,
        stream: &str,
        end: &str,
        start: &str,
        count: usize,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let entries: Vec<RawEntry> = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg(end)
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(envelopes_from_entries(stream, entries, &HashMap::new()))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn len(&self, stream: &str) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN").arg(stream).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn info(&self, stream: &str, group: &str) -> QueueResult<RedisStreamInfo> {
        let length = self.len(stream).await? as i64;

        let mut conn = self.conn.clone();
        let summary: RedisResult<(i64, Option<String>, Option<String>, Option<Vec<(String, i64)>>)> =
            redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .query_async(&mut conn)
                .await;

        let (total_pending, consumer_pending) = match summary {
            Ok((total, _, _, consumers)) => {
                (total, consumers.unwrap_or_default().into_iter().collect())
            }
            Err(e) => match QueueError::from(e) {
                QueueError::MissingGroup(_) => (0, HashMap::new()),
                other => return Err(other),
            },
        };

        Ok(RedisStreamInfo {
            length,
            total_pending,
            consumer_pending,
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn is_busy_group(err: &redis::RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

/// `XPENDING key group [IDLE ms] - + count [consumer]`
fn xpending_cmd(
    stream: &str,
    group: &str,
    min_idle_ms: Option<u64>,
    count: usize,
    consumer: Option<&str>,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(stream).arg(group);
    if let Some(idle) = min_idle_ms {
        cmd.arg("IDLE").arg(idle);
    }
    cmd.arg("-").arg("+").arg(count);
    if let Some(consumer) = consumer {
        cmd.arg(consumer);
    }
    cmd
}

fn pending_from_row((entry_id, consumer, idle_ms, delivered): (String, String, u64, u64)) -> PendingEntry {
    PendingEntry {
        entry_id,
        consumer,
        idle_ms,
        delivery_count: u32::try_from(delivered).unwrap_or(u32::MAX),
    }
}

/// Flatten an XREADGROUP reply for a single stream into envelopes
fn envelopes_from_read(
    stream: &str,
    reply: ReadReply,
    counts: &HashMap<String, u32>,
) -> Vec<MessageEnvelope> {
    reply
        .unwrap_or_default()
        .into_iter()
        .filter(|(key, _)| key == stream)
        .flat_map(|(_, entries)| envelopes_from_entries(stream, entries, counts))
        .collect()
}

/// Convert raw entries, skipping those deleted while still pending
fn envelopes_from_entries(
    stream: &str,
    entries: Vec<RawEntry>,
    counts: &HashMap<String, u32>,
) -> Vec<MessageEnvelope> {
    entries
        .into_iter()
        .filter_map(|(id, fields)| {
            let Some(fields) = fields else {
                debug!(stream = %stream, entry_id = %id, "Skipping deleted entry");
                return None;
            };
            let count = counts.get(&id).copied().unwrap_or(1);
            Some(MessageEnvelope::from_pairs(stream, id, fields, count))
        })
        .collect()
}
