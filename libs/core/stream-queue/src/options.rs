//! Listener configuration
//!
//! This module provides `ListenOptions` for tuning a consumer-group listener.

use crate::error::{QueueError, QueueResult};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for a single `listen` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    /// Maximum entries read per poll
    pub batch_size: usize,

    /// Number of parallel handler slots
    pub concurrency: usize,

    /// Minimum idle time before an unacked entry may be claimed by another consumer
    pub claim_idle_threshold_ms: u64,

    /// Delivery attempts before an entry is dead-lettered
    pub max_retries: u32,

    /// Sleep duration when a poll returns no entries
    pub poll_delay_ms: u64,

    /// Create the stream and group on first use
    pub create_stream_if_missing: bool,

    /// Recover own pending and abandoned entries before normal polling begins
    pub claim_pending_on_startup: bool,

    /// Remove the entry from the stream after acknowledging it
    pub delete_after_ack: bool,

    /// Minimum idle time of this consumer's own failed entry before it is redelivered
    pub retry_delay_ms: u64,

    /// Period of the running claim sweep (None = claim threshold, Some(0) = disabled)
    pub claim_interval_ms: Option<u64>,

    /// Cap on exponential backoff after consecutive broker errors
    pub max_backoff_ms: u64,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 1,
            claim_idle_threshold_ms: 60_000,
            max_retries: 3,
            poll_delay_ms: 1000,
            create_stream_if_missing: true,
            claim_pending_on_startup: true,
            delete_after_ack: false,
            retry_delay_ms: 1000,
            claim_interval_ms: None,
            max_backoff_ms: 30_000,
        }
    }
}

impl ListenOptions {
    /// Create options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the number of concurrent handler slots
    pub fn with_concurrency(mut self, count: usize) -> Self {
        self.concurrency = count.max(1);
        self
    }

    /// Set the idle threshold for claiming abandoned entries
    pub fn with_claim_idle_threshold_ms(mut self, threshold: u64) -> Self {
        self.claim_idle_threshold_ms = threshold;
        self
    }

    /// Set the maximum delivery attempts
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the idle poll delay
    pub fn with_poll_delay_ms(mut self, delay: u64) -> Self {
        self.poll_delay_ms = delay;
        self
    }

    /// Enable or disable stream/group auto-creation
    pub fn with_create_stream_if_missing(mut self, enable: bool) -> Self {
        self.create_stream_if_missing = enable;
        self
    }

    /// Enable or disable the startup recovery sweep
    pub fn with_claim_pending_on_startup(mut self, enable: bool) -> Self {
        self.claim_pending_on_startup = enable;
        self
    }

    /// Enable or disable deleting entries after ack
    pub fn with_delete_after_ack(mut self, enable: bool) -> Self {
        self.delete_after_ack = enable;
        self
    }

    /// Set the redelivery delay for this consumer's own failed entries
    pub fn with_retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    /// Set the claim sweep period (0 disables the running sweep)
    pub fn with_claim_interval_ms(mut self, interval: u64) -> Self {
        self.claim_interval_ms = Some(interval);
        self
    }

    /// Set the backoff cap for broker errors
    pub fn with_max_backoff_ms(mut self, max: u64) -> Self {
        self.max_backoff_ms = max;
        self
    }

    /// Check the options for values the listener cannot run with
    pub fn validate(&self) -> QueueResult<()> {
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(QueueError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    /// Poll delay as a `Duration`
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    /// Effective claim sweep period, `None` when the running sweep is disabled
    pub fn claim_interval(&self) -> Option<Duration> {
        match self.claim_interval_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(Duration::from_millis(self.claim_idle_threshold_ms)),
        }
    }
}

/// Generate a consumer name unique to this listener instance.
///
/// Format: `{host}-{8 hex chars}`; the host part comes from `HOSTNAME`
/// (or `COMPUTERNAME` on Windows) and falls back to `localhost`.
pub fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host.trim(), &suffix[..8])
}

#[cfg(feature = "config")]
mod env {
    use super::ListenOptions;
    use core_config::{env_parse, ConfigError, FromEnv};

    /// Load ListenOptions from environment variables
    ///
    /// Environment variables (all optional, defaults as in `ListenOptions::default()`):
    /// - `QUEUE_BATCH_SIZE`
    /// - `QUEUE_CONCURRENCY`
    /// - `QUEUE_CLAIM_IDLE_MS`
    /// - `QUEUE_MAX_RETRIES`
    /// - `QUEUE_POLL_DELAY_MS`
    /// - `QUEUE_CREATE_STREAM`
    /// - `QUEUE_CLAIM_ON_STARTUP`
    /// - `QUEUE_DELETE_AFTER_ACK`
    /// - `QUEUE_RETRY_DELAY_MS`
    /// - `QUEUE_CLAIM_INTERVAL_MS`
    /// - `QUEUE_MAX_BACKOFF_MS`
    impl FromEnv for ListenOptions {
        fn from_env() -> Result<Self, ConfigError> {
            let defaults = ListenOptions::default();

            let claim_interval_ms = match std::env::var("QUEUE_CLAIM_INTERVAL_MS") {
                Ok(raw) => Some(raw.parse().map_err(|e| ConfigError::ParseError {
                    key: "QUEUE_CLAIM_INTERVAL_MS".to_string(),
                    details: format!("{}", e),
                })?),
                Err(_) => defaults.claim_interval_ms,
            };

            Ok(Self {
                batch_size: env_parse("QUEUE_BATCH_SIZE", defaults.batch_size)?,
                concurrency: env_parse("QUEUE_CONCURRENCY", defaults.concurrency)?.max(1),
                claim_idle_threshold_ms: env_parse(
                    "QUEUE_CLAIM_IDLE_MS",
                    defaults.claim_idle_threshold_ms,
                )?,
                max_retries: env_parse("QUEUE_MAX_RETRIES", defaults.max_retries)?,
                poll_delay_ms: env_parse("QUEUE_POLL_DELAY_MS", defaults.poll_delay_ms)?,
                create_stream_if_missing: env_parse(
                    "QUEUE_CREATE_STREAM",
                    defaults.create_stream_if_missing,
                )?,
                claim_pending_on_startup: env_parse(
                    "QUEUE_CLAIM_ON_STARTUP",
                    defaults.claim_pending_on_startup,
                )?,
                delete_after_ack: env_parse("QUEUE_DELETE_AFTER_ACK", defaults.delete_after_ack)?,
                retry_delay_ms: env_parse("QUEUE_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
                claim_interval_ms,
                max_backoff_ms: env_parse("QUEUE_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            })
        }
    }
}
