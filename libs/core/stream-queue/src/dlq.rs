//! Dead-letter queue management
//!
//! Entries that exhaust their retry budget are copied to a sibling stream
//! `{stream}.deadletter` together with metadata describing the failure. From
//! there they can be listed, inspected, replayed onto the original stream or
//! discarded.

use crate::client::StreamClient;
use crate::envelope::{parse_entry_timestamp, MessageEnvelope};
use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, error, info, warn};

/// Suffix appended to a stream key to form its dead-letter stream
pub const DEAD_LETTER_SUFFIX: &str = ".deadletter";

/// Dead-letter stream key for a primary stream
pub fn dead_letter_key(stream: &str) -> String {
    format!("{}{}", stream, DEAD_LETTER_SUFFIX)
}

/// Metadata fields added to a dead-lettered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum DeadLetterField {
    OriginalStream,
    OriginalEntryId,
    FailureCount,
    LastError,
    DeadLetteredAt,
}

impl DeadLetterField {
    /// Whether a field name is one of the metadata fields
    pub fn is_metadata(name: &str) -> bool {
        name.parse::<DeadLetterField>().is_ok()
    }
}

/// Prefix for payload fields that would otherwise collide with metadata.
///
/// A payload field `lastError` is stored as `payload.lastError`, and
/// `payload.lastError` as `payload.payload.lastError`, so every name maps back.
pub const SHADOWED_FIELD_PREFIX: &str = "payload.";

fn shadows_metadata(name: &str) -> bool {
    let mut base = name;
    while let Some(rest) = base.strip_prefix(SHADOWED_FIELD_PREFIX) {
        base = rest;
    }
    DeadLetterField::is_metadata(base)
}

/// An entry in a dead-letter stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// ID of the entry in the dead-letter stream
    pub dead_letter_id: String,
    pub original_stream: String,
    pub original_entry_id: String,
    /// Failed attempts before the entry was dead-lettered
    pub failure_count: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
    /// The original payload, without metadata
    pub fields: HashMap<String, String>,
}

impl DeadLetterEntry {
    /// Split a raw dead-letter stream entry into metadata and payload.
    ///
    /// `fallback_stream` is used when the entry carries no `originalStream` field.
    pub fn from_envelope(envelope: MessageEnvelope, fallback_stream: &str) -> Self {
        let mut fields = envelope.fields;
        let mut take = |field: DeadLetterField| fields.remove(field.as_ref());

        let original_stream = take(DeadLetterField::OriginalStream)
            .unwrap_or_else(|| fallback_stream.to_string());
        let original_entry_id = take(DeadLetterField::OriginalEntryId).unwrap_or_default();
        let failure_count = take(DeadLetterField::FailureCount)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let last_error = take(DeadLetterField::LastError).unwrap_or_default();
        let dead_lettered_at = take(DeadLetterField::DeadLetteredAt)
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .or_else(|| parse_entry_timestamp(&envelope.entry_id))
            .unwrap_or_else(Utc::now);

        let fields = fields
            .into_iter()
            .map(|(name, value)| {
                let original = name
                    .strip_prefix(SHADOWED_FIELD_PREFIX)
                    .filter(|rest| shadows_metadata(rest))
                    .map(str::to_string);
                (original.unwrap_or(name), value)
            })
            .collect();

        Self {
            dead_letter_id: envelope.entry_id,
            original_stream,
            original_entry_id,
            failure_count,
            last_error,
            dead_lettered_at,
            fields,
        }
    }
}

/// Dead-letter stream statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// The dead-letter stream key
    pub stream: String,
    pub length: u64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

/// Dead-letter queue operations for any primary stream
#[derive(Clone)]
pub struct DeadLetterQueue {
    client: Arc<dyn StreamClient>,
    max_len: Option<u64>,
}

impl DeadLetterQueue {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        Self {
            client,
            max_len: None,
        }
    }

    /// Approximately cap every dead-letter stream at `max_len` entries
    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Copy a failed entry to `{stream}.deadletter`.
    ///
    /// A failed write is reported as `CapacityExhausted`; the caller must leave
    /// the original entry pending.
    pub async fn write(
        &self,
        envelope: &MessageEnvelope,
        failure_count: u32,
        last_error: &str,
    ) -> QueueResult<String> {
        let key = dead_letter_key(&envelope.stream_key);

        let mut fields =
            HashMap::with_capacity(envelope.fields.len() + DeadLetterField::iter().count());
        for (name, value) in &envelope.fields {
            if shadows_metadata(name) {
                warn!(
                    entry_id = %envelope.entry_id,
                    field = %name,
                    "Payload field collides with dead-letter metadata, storing it prefixed"
                );
                fields.insert(format!("{}{}", SHADOWED_FIELD_PREFIX, name), value.clone());
            } else {
                fields.insert(name.clone(), value.clone());
            }
        }

        let metadata = [
            (DeadLetterField::OriginalStream, envelope.stream_key.clone()),
            (DeadLetterField::OriginalEntryId, envelope.entry_id.clone()),
            (DeadLetterField::FailureCount, failure_count.to_string()),
            (DeadLetterField::LastError, last_error.to_string()),
            (
                DeadLetterField::DeadLetteredAt,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        for (field, value) in metadata {
            fields.insert(field.to_string(), value);
        }

        match self.client.add(&key, &fields, self.max_len).await {
            Ok(id) => {
                info!(
                    stream = %envelope.stream_key,
                    entry_id = %envelope.entry_id,
                    dead_letter_id = %id,
                    failure_count,
                    last_error = %last_error,
                    "Moved entry to dead-letter stream"
                );
                Ok(id)
            }
            Err(e) => {
                error!(
                    stream = %envelope.stream_key,
                    entry_id = %envelope.entry_id,
                    error = %e,
                    "Dead-letter write failed"
                );
                Err(QueueError::CapacityExhausted {
                    entry_id: envelope.entry_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// List dead-lettered entries oldest first, starting at `start` (inclusive)
    pub async fn list(
        &self,
        stream: &str,
        count: usize,
        start: Option<&str>,
    ) -> QueueResult<Vec<DeadLetterEntry>> {
        let key = dead_letter_key(stream);
        let entries = self
            .client
            .range(&key, start.unwrap_or("-"), "+", count)
            .await?;

        Ok(entries
            .into_iter()
            .map(|e| DeadLetterEntry::from_envelope(e, stream))
            .collect())
    }

    /// Look up one dead-lettered entry
    pub async fn get(&self, stream: &str, id: &str) -> QueueResult<Option<DeadLetterEntry>> {
        let key = dead_letter_key(stream);
        let entry = self.client.range(&key, id, id, 1).await?.into_iter().next();
        Ok(entry.map(|e| DeadLetterEntry::from_envelope(e, stream)))
    }

    pub async fn stats(&self, stream: &str) -> QueueResult<DeadLetterStats> {
        let key = dead_letter_key(stream);
        let length = self.client.len(&key).await?;

        let (oldest_entry_id, newest_entry_id) = if length == 0 {
            (None, None)
        } else {
            let oldest = self.client.range(&key, "-", "+", 1).await?;
            let newest = self.client.rev_range(&key, "+", "-", 1).await?;
            (
                oldest.into_iter().next().map(|e| e.entry_id),
                newest.into_iter().next().map(|e| e.entry_id),
            )
        };

        Ok(DeadLetterStats {
            stream: key,
            length,
            oldest_entry_id,
            newest_entry_id,
        })
    }

    /// Re-enqueue a dead-lettered payload onto its original stream.
    ///
    /// Returns the new entry ID, or `None` if `id` is not in the dead-letter stream.
    pub async fn replay(&self, stream: &str, id: &str) -> QueueResult<Option<String>> {
        let Some(entry) = self.get(stream, id).await? else {
            return Ok(None);
        };

        let new_id = self
            .client
            .add(&entry.original_stream, &entry.fields, None)
            .await?;
        self.client.delete(&dead_letter_key(stream), id).await?;

        info!(
            stream = %entry.original_stream,
            dead_letter_id = %id,
            entry_id = %new_id,
            "Replayed dead-lettered entry"
        );
        Ok(Some(new_id))
    }

    /// Remove one dead-lettered entry
    pub async fn discard(&self, stream: &str, id: &str) -> QueueResult<bool> {
        let deleted = self.client.delete(&dead_letter_key(stream), id).await?;
        debug!(stream = %stream, dead_letter_id = %id, deleted, "Discarded dead-lettered entry");
        Ok(deleted)
    }

    /// Remove every dead-lettered entry of a stream. Returns how many were removed.
    pub async fn purge(&self, stream: &str) -> QueueResult<u64> {
        let removed = self.client.trim(&dead_letter_key(stream), 0).await?;
        if removed > 0 {
            info!(stream = %stream, count = removed, "Purged dead-letter stream");
        }
        Ok(removed)
    }
}

/// Names of all metadata fields, in write order
pub fn metadata_fields() -> impl Iterator<Item = DeadLetterField> {
    DeadLetterField::iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockStreamClient;

    fn envelope(stream: &str, id: &str, pairs: &[(&str, &str)]) -> MessageEnvelope {
        MessageEnvelope::new(
            stream,
            id,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_field_names() {
        let names: Vec<String> = metadata_fields().map(|f| f.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "originalStream",
                "originalEntryId",
                "failureCount",
                "lastError",
                "deadLetteredAt"
            ]
        );
        assert!(DeadLetterField::is_metadata("failureCount"));
        assert!(!DeadLetterField::is_metadata("job"));
        assert_eq!(dead_letter_key("q"), "q.deadletter");
    }

    #[tokio::test]
    async fn test_write_adds_metadata() {
        let mut client = MockStreamClient::new();
        client
            .expect_add()
            .withf(|stream, fields, _| {
                stream == "q.deadletter"
                    && fields.get("job").map(String::as_str) == Some("1")
                    && fields.get("originalStream").map(String::as_str) == Some("q")
                    && fields.get("originalEntryId").map(String::as_str) == Some("5-0")
                    && fields.get("failureCount").map(String::as_str) == Some("2")
                    && fields.get("lastError").map(String::as_str) == Some("rejected")
                    && fields.contains_key("deadLetteredAt")
            })
            .times(1)
            .returning(|_, _, _| Ok("9-0".to_string()));

        let dlq = DeadLetterQueue::new(Arc::new(client));
        let id = dlq
            .write(&envelope("q", "5-0", &[("job", "1")]), 2, "rejected")
            .await
            .unwrap();

        assert_eq!(id, "9-0");
    }

    #[tokio::test]
    async fn test_write_keeps_payload_fields_named_like_metadata() {
        let mut client = MockStreamClient::new();
        client
            .expect_add()
            .withf(|_, fields, _| {
                fields.get("lastError").map(String::as_str) == Some("rejected")
                    && fields.get("payload.lastError").map(String::as_str) == Some("from payload")
                    && fields.get("payload.payload.failureCount").map(String::as_str) == Some("7")
                    && fields.get("payload.job").map(String::as_str) == Some("1")
            })
            .times(1)
            .returning(|_, _, _| Ok("9-0".to_string()));

        let dlq = DeadLetterQueue::new(Arc::new(client));
        dlq.write(
            &envelope(
                "q",
                "5-0",
                &[
                    ("lastError", "from payload"),
                    ("payload.failureCount", "7"),
                    ("payload.job", "1"),
                ],
            ),
            2,
            "rejected",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_is_capacity_exhausted() {
        let mut client = MockStreamClient::new();
        client
            .expect_add()
            .returning(|_, _, _| Err(QueueError::Protocol("OOM command not allowed".into())));

        let dlq = DeadLetterQueue::new(Arc::new(client));
        let err = dlq
            .write(&envelope("q", "5-0", &[("job", "1")]), 3, "boom")
            .await
            .unwrap_err();

        match err {
            QueueError::CapacityExhausted { entry_id, reason } => {
                assert_eq!(entry_id, "5-0");
                assert!(reason.contains("OOM"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_entry_from_envelope() {
        let raw = envelope(
            "q.deadletter",
            "1700000000000-0",
            &[
                ("job", "1"),
                ("originalStream", "q"),
                ("originalEntryId", "5-0"),
                ("failureCount", "2"),
                ("lastError", "handler returned false"),
                ("deadLetteredAt", "2024-01-01T00:00:00.000Z"),
            ],
        );

        let entry = DeadLetterEntry::from_envelope(raw, "q");

        assert_eq!(entry.dead_letter_id, "1700000000000-0");
        assert_eq!(entry.original_stream, "q");
        assert_eq!(entry.original_entry_id, "5-0");
        assert_eq!(entry.failure_count, 2);
        assert_eq!(entry.last_error, "handler returned false");
        assert_eq!(entry.dead_lettered_at.timestamp(), 1_704_067_200);
        assert_eq!(entry.fields, HashMap::from([("job".into(), "1".into())]));
    }

    #[tokio::test]
    async fn test_replay_strips_metadata() {
        let mut client = MockStreamClient::new();
        client
            .expect_range()
            .withf(|stream, start, end, count| {
                stream == "q.deadletter" && start == "9-0" && end == "9-0" && *count == 1
            })
            .returning(|_, _, _, _| {
                Ok(vec![envelope(
                    "q.deadletter",
                    "9-0",
                    &[
                        ("job", "1"),
                        ("originalStream", "q"),
                        ("originalEntryId", "5-0"),
                        ("failureCount", "3"),
                        ("lastError", "boom"),
                    ],
                )])
            });
        client
            .expect_add()
            .withf(|stream, fields, _| {
                stream == "q" && fields.len() == 1 && fields.contains_key("job")
            })
            .times(1)
            .returning(|_, _, _| Ok("10-0".to_string()));
        client
            .expect_delete()
            .withf(|stream, id| stream == "q.deadletter" && id == "9-0")
            .times(1)
            .returning(|_, _| Ok(true));

        let dlq = DeadLetterQueue::new(Arc::new(client));
        assert_eq!(dlq.replay("q", "9-0").await.unwrap(), Some("10-0".to_string()));
    }

    #[tokio::test]
    async fn test_replay_restores_payload_fields_named_like_metadata() {
        let mut client = MockStreamClient::new();
        client.expect_range().returning(|_, _, _, _| {
            Ok(vec![envelope(
                "q.deadletter",
                "9-0",
                &[
                    ("payload.lastError", "from payload"),
                    ("payload.payload.failureCount", "7"),
                    ("payload.job", "1"),
                    ("originalStream", "q"),
                    ("failureCount", "3"),
                    ("lastError", "boom"),
                ],
            )])
        });
        client
            .expect_add()
            .withf(|stream, fields, _| {
                stream == "q"
                    && fields.len() == 3
                    && fields.get("lastError").map(String::as_str) == Some("from payload")
                    && fields.get("payload.failureCount").map(String::as_str) == Some("7")
                    && fields.get("payload.job").map(String::as_str) == Some("1")
            })
            .times(1)
            .returning(|_, _, _| Ok("10-0".to_string()));
        client.expect_delete().times(1).returning(|_, _| Ok(true));

        let dlq = DeadLetterQueue::new(Arc::new(client));
        let entry = dlq.get("q", "9-0").await.unwrap().unwrap();
        assert_eq!(entry.last_error, "boom");
        assert_eq!(entry.failure_count, 3);

        assert_eq!(dlq.replay("q", "9-0").await.unwrap(), Some("10-0".to_string()));
    }

    #[tokio::test]
    async fn test_replay_unknown_id() {
        let mut client = MockStreamClient::new();
        client.expect_range().returning(|_, _, _, _| Ok(vec![]));
        client.expect_add().never();

        let dlq = DeadLetterQueue::new(Arc::new(client));
        assert_eq!(dlq.replay("q", "1-0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stats_empty_stream() {
        let mut client = MockStreamClient::new();
        client.expect_len().returning(|_| Ok(0));
        client.expect_range().never();

        let dlq = DeadLetterQueue::new(Arc::new(client));
        let stats = dlq.stats("q").await.unwrap();

        assert_eq!(stats.stream, "q.deadletter");
        assert_eq!(stats.length, 0);
        assert_eq!(stats.oldest_entry_id, None);
    }
}
