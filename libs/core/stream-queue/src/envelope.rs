//! Message envelope
//!
//! One delivered unit of work: the stream it came from, its entry ID,
//! and the opaque field map it carries.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Field conventionally used by hosts to route an entry to a handler.
pub const TYPE_FIELD: &str = "type";

/// A delivered stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Stream the entry was read from
    pub stream_key: String,

    /// Redis stream entry ID (e.g., "1234567890123-0")
    pub entry_id: String,

    /// Field-value payload
    pub fields: HashMap<String, String>,

    /// Number of times the broker has delivered this entry (1 for a first read)
    pub delivery_count: u32,
}

impl MessageEnvelope {
    /// Create a first-delivery envelope
    pub fn new(
        stream_key: impl Into<String>,
        entry_id: impl Into<String>,
        fields: HashMap<String, String>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            entry_id: entry_id.into(),
            fields,
            delivery_count: 1,
        }
    }

    /// Build an envelope from the raw `(field, value)` pairs of a stream reply
    pub(crate) fn from_pairs(
        stream_key: &str,
        entry_id: String,
        pairs: Vec<(String, String)>,
        delivery_count: u32,
    ) -> Self {
        Self {
            stream_key: stream_key.to_string(),
            entry_id,
            fields: pairs.into_iter().collect(),
            delivery_count: delivery_count.max(1),
        }
    }

    /// Set the broker delivery count
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count.max(1);
        self
    }

    /// Look up a single field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The `type` field, if the producer set one
    pub fn kind(&self) -> Option<&str> {
        self.field(TYPE_FIELD)
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// When the entry was appended, parsed from the stream ID.
    ///
    /// Stream IDs are in format "timestamp_ms-sequence".
    pub fn timestamp(&self) -> DateTime<Utc> {
        parse_entry_timestamp(&self.entry_id).unwrap_or_else(Utc::now)
    }

    /// How long ago the entry was appended
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp()
    }
}

/// Parse the millisecond timestamp half of a stream entry ID
pub fn parse_entry_timestamp(entry_id: &str) -> Option<DateTime<Utc>> {
    entry_id
        .split('-')
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_timestamp() {
        let now_ms = Utc::now().timestamp_millis();
        let envelope = MessageEnvelope::new("q", format!("{}-0", now_ms), HashMap::new());

        assert_eq!(envelope.timestamp().timestamp_millis(), now_ms);
        assert!(envelope.age().num_milliseconds() < 1000);
        assert!(!envelope.is_redelivery());
    }

    #[test]
    fn test_unparsable_id_falls_back_to_now() {
        assert!(parse_entry_timestamp("not-an-id").is_none());

        let envelope = MessageEnvelope::new("q", "garbage", HashMap::new());
        assert!(envelope.age().num_seconds() < 5);
    }

    #[test]
    fn test_field_access() {
        let envelope = MessageEnvelope::new(
            "chat:requests",
            "1-0",
            fields(&[("type", "chat"), ("job", "1")]),
        );

        assert_eq!(envelope.kind(), Some("chat"));
        assert_eq!(envelope.field("job"), Some("1"));
        assert_eq!(envelope.field("missing"), None);
    }

    #[test]
    fn test_redelivery() {
        let envelope = MessageEnvelope::from_pairs(
            "q",
            "1234567890123-0".to_string(),
            vec![("job".to_string(), "1".to_string())],
            3,
        );

        assert!(envelope.is_redelivery());
        assert_eq!(envelope.delivery_count, 3);
        assert_eq!(envelope.clone().with_delivery_count(0).delivery_count, 1);
    }
}
