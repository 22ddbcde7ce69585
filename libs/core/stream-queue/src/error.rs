//! Queue error types and error categorization
//!
//! Errors are categorized to determine how the listener reacts:
//! - **Transient**: broker hiccups and handler failures, retried after a backoff
//! - **Permanent**: malformed replies, bad configuration, failed dead-letter writes

use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry with exponential backoff
    Transient,
    /// Not retryable as-is - log and move on
    Permanent,
}

impl ErrorCategory {
    /// Calculate exponential backoff delay for the given consecutive failure count.
    ///
    /// The first failure waits `base_ms`, every further failure doubles it, capped at `max_ms`.
    pub fn backoff_delay_ms(&self, base_ms: u64, consecutive_failures: u32, max_ms: u64) -> u64 {
        if *self == ErrorCategory::Permanent {
            return base_ms.min(max_ms);
        }

        let exponent = consecutive_failures.saturating_sub(1).min(16);
        base_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(max_ms)
    }
}

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Broker unreachable, connection dropped, or command timed out
    #[error("Broker unavailable: {0}")]
    Connection(#[source] redis::RedisError),

    /// The consumer group (or the stream holding it) does not exist
    #[error("Consumer group missing: {0}")]
    MissingGroup(String),

    /// Malformed or unexpected broker reply
    #[error("Broker protocol error: {0}")]
    Protocol(String),

    /// Handler reported a failure for a delivered entry
    #[error("Handler error: {0}")]
    Handler(String),

    /// Writing to the dead-letter stream failed; the entry stays pending
    #[error("Dead-letter write failed for entry {entry_id}: {reason}")]
    CapacityExhausted { entry_id: String, reason: String },

    /// Invalid options or arguments
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (task join failures and the like)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate
pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        QueueError::Handler(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Connection(_) => ErrorCategory::Transient,
            QueueError::MissingGroup(_) => ErrorCategory::Transient,
            QueueError::Handler(_) => ErrorCategory::Transient,
            QueueError::Protocol(_) => ErrorCategory::Permanent,
            QueueError::CapacityExhausted { .. } => ErrorCategory::Permanent,
            QueueError::Config(_) => ErrorCategory::Permanent,
            QueueError::Serialization(_) => ErrorCategory::Permanent,
            QueueError::Internal(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether the caller may retry the failed operation unchanged
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Whether this is a broker connectivity problem
    pub fn is_connection_error(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }

    /// Whether the consumer group needs to be (re)created
    pub fn is_missing_group(&self) -> bool {
        matches!(self, QueueError::MissingGroup(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            return QueueError::Connection(err);
        }

        match err.code() {
            Some("NOGROUP") => QueueError::MissingGroup(err.to_string()),
            _ => QueueError::Protocol(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert!(QueueError::handler("boom").is_transient());
        assert!(QueueError::MissingGroup("NOGROUP".into()).is_transient());
        assert!(!QueueError::Protocol("bad reply".into()).is_transient());
        assert!(!QueueError::Config("batch_size".into()).is_transient());
        assert_eq!(
            QueueError::CapacityExhausted {
                entry_id: "1-0".into(),
                reason: "oom".into()
            }
            .category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_backoff_calculation() {
        // 1s, 2s, 4s, 8s ... capped at 30s
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1000, 1, 30_000), 1000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1000, 2, 30_000), 2000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1000, 3, 30_000), 4000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1000, 10, 30_000), 30_000);

        // Zero failures behaves like the first one
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(500, 0, 30_000), 500);

        // Permanent errors never grow
        assert_eq!(ErrorCategory::Permanent.backoff_delay_ms(1000, 5, 30_000), 1000);
    }

    #[test]
    fn test_capacity_exhausted_message() {
        let err = QueueError::CapacityExhausted {
            entry_id: "1700000000000-0".into(),
            reason: "OOM command not allowed".into(),
        };
        let message = err.to_string();
        assert!(message.contains("1700000000000-0"));
        assert!(message.contains("OOM"));
    }
}
