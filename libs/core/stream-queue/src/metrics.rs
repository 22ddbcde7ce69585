//! Prometheus metrics for queue listeners
//!
//! Counters, gauges and histograms are recorded through the `metrics` facade;
//! `init_metrics` installs the Prometheus recorder the `/metrics` route renders.

use crate::error::{QueueError, QueueResult};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> QueueResult<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| QueueError::Internal(format!("failed to install Prometheus recorder: {}", e)))?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle, if `init_metrics` has run
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-listener metrics, labelled by stream and group
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    stream: String,
    group: String,
}

impl QueueMetrics {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }

    /// Entries handed to the dispatcher
    pub fn received(&self, count: usize) {
        counter!(
            "stream_queue_entries_received_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(count as u64);
    }

    /// Entry acknowledged after a successful handler run
    pub fn acked(&self, duration: Duration) {
        counter!(
            "stream_queue_entries_acked_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
        self.handler_duration(duration);
    }

    /// Handler rejected, failed or panicked
    pub fn failed(&self, duration: Duration) {
        counter!(
            "stream_queue_entries_failed_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
        self.handler_duration(duration);
    }

    pub fn dead_lettered(&self) {
        counter!(
            "stream_queue_entries_dead_lettered_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
    }

    /// Entries taken over from idle consumers
    pub fn claimed(&self, count: usize) {
        counter!(
            "stream_queue_entries_claimed_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(count as u64);
    }

    pub fn poll_error(&self, kind: &'static str) {
        counter!(
            "stream_queue_poll_errors_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "stream_queue_in_flight_handlers",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .set(count as f64);
    }

    pub fn pending(&self, count: i64) {
        gauge!(
            "stream_queue_pending_entries",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .set(count as f64);
    }

    fn handler_duration(&self, duration: Duration) {
        histogram!(
            "stream_queue_handler_duration_seconds",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .record(duration.as_secs_f64());
    }
}
