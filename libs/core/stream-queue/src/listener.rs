//! Consumer-group listener
//!
//! `QueueListener::listen` joins a consumer group and spawns one background
//! task that repeatedly:
//!
//! 1. drains its backlog of recovered or claimed entries,
//! 2. sweeps entries abandoned by other consumers (every claim interval),
//! 3. redelivers its own failed entries once they have rested for `retry_delay_ms`,
//! 4. reads new entries with `XREADGROUP >`,
//!
//! and hands each entry to a bounded worker pool. A finished handler frees its
//! slot for the next entry right away, so a slow handler only holds its own
//! slot. Entries are acked only after the handler returns `Ok(true)`; failed
//! entries stay pending until they succeed or exhaust `max_retries`, at which
//! point they are copied to `{stream}.deadletter` and removed from the primary
//! stream. On stop no new entries are dispatched and running handlers finish.
//!
//! Delivery is at-least-once. Handlers must be idempotent: a claim race or a
//! failed ack can hand the same entry to a handler twice.

use crate::client::{PendingEntry, StreamClient};
use crate::dlq::DeadLetterQueue;
use crate::envelope::MessageEnvelope;
use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::options::{default_consumer_name, ListenOptions};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Processes delivered entries.
///
/// Return `Ok(true)` to acknowledge the entry. `Ok(false)` or an error leaves it
/// pending so it is retried later; a panic is treated like an error.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> QueueResult<bool>;
}

/// `MessageHandler` backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// let handler = handler_fn(|envelope, _cancel| async move {
///     tracing::info!(job = ?envelope.field("job"), "processing");
///     Ok(true)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageEnvelope, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = QueueResult<bool>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = QueueResult<bool>> + Send,
{
    async fn handle(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> QueueResult<bool> {
        (self.f)(envelope.clone(), cancel.clone()).await
    }
}

/// Lifecycle of a listener task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ListenerState {
    Starting,
    ClaimingPending,
    Polling,
    Dispatching,
    Stopped,
}

/// Handle to a running listener
#[derive(Debug)]
pub struct ListenHandle {
    stream_key: String,
    group: String,
    consumer_name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<ListenerState>,
}

impl ListenHandle {
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Current listener state
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Token that ends the listener loop when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the listener and wait for its in-flight handlers to finish
    pub async fn stop(self) -> QueueResult<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| QueueError::Internal(format!("listener task failed: {}", e)))
    }
}

/// Starts consumer-group listeners over a shared stream client
#[derive(Clone)]
pub struct QueueListener {
    client: Arc<dyn StreamClient>,
    dead_letters: DeadLetterQueue,
}

impl QueueListener {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        let dead_letters = DeadLetterQueue::new(client.clone());
        Self {
            client,
            dead_letters,
        }
    }

    /// Use a custom dead-letter queue (e.g. one with a length cap)
    pub fn with_dead_letter_queue(mut self, dead_letters: DeadLetterQueue) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Join `group` on `stream_key` and start consuming in the background.
    ///
    /// Fails without spawning anything if the options are invalid or the
    /// consumer group cannot be created. When `consumer_name` is `None` a
    /// unique `{host}-{suffix}` name is generated.
    pub async fn listen(
        &self,
        stream_key: &str,
        group: &str,
        consumer_name: Option<String>,
        handler: Arc<dyn MessageHandler>,
        options: ListenOptions,
    ) -> QueueResult<ListenHandle> {
        options.validate()?;
        if stream_key.is_empty() || group.is_empty() {
            return Err(QueueError::Config(
                "stream key and group must not be empty".into(),
            ));
        }

        let consumer = consumer_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(default_consumer_name);

        let (state_tx, state_rx) = watch::channel(ListenerState::Starting);

        self.client
            .create_group(stream_key, group, options.create_stream_if_missing)
            .await?;

        let cancel = CancellationToken::new();
        let metrics = QueueMetrics::new(stream_key, group);
        let ctx = Arc::new(DispatchContext {
            client: self.client.clone(),
            dead_letters: self.dead_letters.clone(),
            handler,
            stream: stream_key.to_string(),
            group: group.to_string(),
            max_retries: options.max_retries,
            delete_after_ack: options.delete_after_ack,
            cancel: cancel.clone(),
            metrics: metrics.clone(),
            slots: Arc::new(Semaphore::new(options.concurrency)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });

        info!(
            stream = %stream_key,
            group = %group,
            consumer = %consumer,
            batch_size = options.batch_size,
            concurrency = options.concurrency,
            max_retries = options.max_retries,
            "Starting queue listener"
        );

        let span = info_span!("queue_listener", stream = %stream_key, group = %group, consumer = %consumer);
        let task = ListenerTask {
            client: self.client.clone(),
            ctx,
            stream: stream_key.to_string(),
            group: group.to_string(),
            consumer: consumer.clone(),
            options,
            cancel: cancel.clone(),
            state: state_tx,
            metrics,
            tracker: AttemptTracker::default(),
            backlog: VecDeque::new(),
            queued: HashSet::new(),
            tasks: JoinSet::new(),
            running: HashMap::new(),
            last_claim: Instant::now(),
            consecutive_errors: 0,
        };
        let join = tokio::spawn(task.run().instrument(span));

        Ok(ListenHandle {
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            consumer_name: consumer,
            cancel,
            task: join,
            state: state_rx,
        })
    }

    /// Stop a listener started by `listen`
    pub async fn stop_listen(&self, handle: ListenHandle) -> QueueResult<()> {
        handle.stop().await
    }
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    failures: u32,
    last_error: Option<String>,
    dead_lettered: bool,
    last_seen: Instant,
}

/// Local per-entry attempt counts, owned by the listener loop.
///
/// The broker delivery count is authoritative; the local count is a floor so
/// attempts advance even on redelivery paths that do not bump the broker count.
#[derive(Debug, Default)]
pub(crate) struct AttemptTracker {
    records: HashMap<String, AttemptRecord>,
}

impl AttemptTracker {
    /// Attempt number for the next delivery of `entry_id`
    pub(crate) fn attempt_for(&mut self, entry_id: &str, delivery_count: u32) -> u32 {
        let local = match self.records.get_mut(entry_id) {
            Some(record) => {
                record.last_seen = Instant::now();
                record.failures + 1
            }
            None => 1,
        };
        delivery_count.max(local)
    }

    fn record(&mut self, entry_id: &str) -> &mut AttemptRecord {
        let record = self
            .records
            .entry(entry_id.to_string())
            .or_insert_with(|| AttemptRecord {
                failures: 0,
                last_error: None,
                dead_lettered: false,
                last_seen: Instant::now(),
            });
        record.last_seen = Instant::now();
        record
    }

    pub(crate) fn record_failure(&mut self, entry_id: &str, attempt: u32, reason: String) {
        let record = self.record(entry_id);
        record.failures = record.failures.max(attempt);
        record.last_error = Some(reason);
    }

    /// The entry already has a dead-letter copy; only its ack is outstanding
    pub(crate) fn mark_dead_lettered(&mut self, entry_id: &str) {
        self.record(entry_id).dead_lettered = true;
    }

    pub(crate) fn is_dead_lettered(&self, entry_id: &str) -> bool {
        self.records.get(entry_id).is_some_and(|r| r.dead_lettered)
    }

    pub(crate) fn last_error(&self, entry_id: &str) -> Option<&str> {
        self.records
            .get(entry_id)
            .and_then(|r| r.last_error.as_deref())
    }

    pub(crate) fn forget(&mut self, entry_id: &str) {
        self.records.remove(entry_id);
    }

    /// Drop records not seen for `max_age`
    pub(crate) fn prune(&mut self, max_age: Duration) {
        self.records.retain(|_, r| r.last_seen.elapsed() < max_age);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Result of dispatching one entry, reported back to the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Acked,
    /// Handler failed below the retry budget; the entry stays pending
    Retry { reason: String },
    DeadLettered,
    /// The dead-letter write failed; the entry stays pending
    DeadLetterFailed { reason: String },
    /// The dead-letter copy was written but the ack failed; the entry must not be copied again
    DeadLetterUnacked { reason: String },
    /// The entry could not be settled (ack failed, pool closed); it stays pending
    Stranded { reason: String },
}

/// Everything a handler task needs, shared by all tasks of one listener
pub(crate) struct DispatchContext {
    client: Arc<dyn StreamClient>,
    dead_letters: DeadLetterQueue,
    handler: Arc<dyn MessageHandler>,
    stream: String,
    group: String,
    max_retries: u32,
    delete_after_ack: bool,
    cancel: CancellationToken,
    metrics: QueueMetrics,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl DispatchContext {
    /// Run the handler for one entry and settle it
    pub(crate) async fn process(
        &self,
        envelope: MessageEnvelope,
        attempt: u32,
        last_error: Option<String>,
    ) -> DispatchOutcome {
        if attempt > self.max_retries {
            let reason = last_error.unwrap_or_else(|| {
                format!(
                    "delivered {} times, exceeding max retries {}",
                    envelope.delivery_count, self.max_retries
                )
            });
            warn!(
                entry_id = %envelope.entry_id,
                attempt,
                max_retries = self.max_retries,
                "Entry arrived over its retry budget"
            );
            return self.dead_letter(&envelope, attempt - 1, &reason).await;
        }

        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return DispatchOutcome::Stranded {
                    reason: "dispatch pool closed".into(),
                };
            }
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.in_flight(running);

        debug!(
            entry_id = %envelope.entry_id,
            attempt,
            delivery_count = envelope.delivery_count,
            "Dispatching entry"
        );

        let start = Instant::now();
        let result = AssertUnwindSafe(self.handler.handle(&envelope, &self.cancel))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        let running = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.in_flight(running);

        let reason = match result {
            Ok(Ok(true)) => {
                self.metrics.acked(elapsed);
                return self.acknowledge(&envelope).await;
            }
            Ok(Ok(false)) => "handler returned false".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        self.metrics.failed(elapsed);
        warn!(
            entry_id = %envelope.entry_id,
            attempt,
            max_retries = self.max_retries,
            error = %reason,
            "Handler failed"
        );

        if attempt >= self.max_retries {
            self.dead_letter(&envelope, attempt, &reason).await
        } else {
            DispatchOutcome::Retry { reason }
        }
    }

    async fn acknowledge(&self, envelope: &MessageEnvelope) -> DispatchOutcome {
        match self
            .client
            .ack(&self.stream, &self.group, &envelope.entry_id)
            .await
        {
            Ok(acked) => {
                if !acked {
                    debug!(entry_id = %envelope.entry_id, "Entry was no longer pending");
                }
            }
            Err(e) => {
                error!(entry_id = %envelope.entry_id, error = %e, "Failed to ack entry");
                return DispatchOutcome::Stranded {
                    reason: e.to_string(),
                };
            }
        }

        if self.delete_after_ack
            && let Err(e) = self.client.delete(&self.stream, &envelope.entry_id).await
        {
            warn!(entry_id = %envelope.entry_id, error = %e, "Failed to delete acked entry");
        }

        DispatchOutcome::Acked
    }

    async fn dead_letter(
        &self,
        envelope: &MessageEnvelope,
        failure_count: u32,
        reason: &str,
    ) -> DispatchOutcome {
        if let Err(e) = self.dead_letters.write(envelope, failure_count, reason).await {
            error!(
                entry_id = %envelope.entry_id,
                error = %e,
                "Entry stays pending until the dead-letter stream accepts it"
            );
            return DispatchOutcome::DeadLetterFailed {
                reason: reason.to_string(),
            };
        }
        self.metrics.dead_lettered();
        self.retire(envelope).await
    }

    /// Ack and delete an entry whose dead-letter copy is already written
    pub(crate) async fn retire(&self, envelope: &MessageEnvelope) -> DispatchOutcome {
        if let Err(e) = self
            .client
            .ack(&self.stream, &self.group, &envelope.entry_id)
            .await
        {
            error!(entry_id = %envelope.entry_id, error = %e, "Failed to ack dead-lettered entry");
            return DispatchOutcome::DeadLetterUnacked {
                reason: e.to_string(),
            };
        }
        if let Err(e) = self.client.delete(&self.stream, &envelope.entry_id).await {
            warn!(entry_id = %envelope.entry_id, error = %e, "Failed to delete dead-lettered entry");
        }

        DispatchOutcome::DeadLettered
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

type Dispatched = (String, u32, DispatchOutcome);

/// The background loop of one listener
struct ListenerTask {
    client: Arc<dyn StreamClient>,
    ctx: Arc<DispatchContext>,
    stream: String,
    group: String,
    consumer: String,
    options: ListenOptions,
    cancel: CancellationToken,
    state: watch::Sender<ListenerState>,
    metrics: QueueMetrics,
    tracker: AttemptTracker,
    backlog: VecDeque<MessageEnvelope>,
    queued: HashSet<String>,
    /// Handler tasks still running, keyed by task
    tasks: JoinSet<Dispatched>,
    running: HashMap<task::Id, String>,
    last_claim: Instant,
    consecutive_errors: u32,
}

impl ListenerTask {
    async fn run(mut self) {
        if self.options.claim_pending_on_startup {
            self.set_state(ListenerState::ClaimingPending);
            self.recover().await;
        }
        self.last_claim = Instant::now();

        let prune_after = Duration::from_millis(self.options.claim_idle_threshold_ms.saturating_mul(2));

        while !self.cancel.is_cancelled() {
            self.reap();
            self.tracker.prune(prune_after);

            let free = self.options.concurrency.saturating_sub(self.tasks.len());
            if free == 0 {
                self.set_state(ListenerState::Dispatching);
                self.wait_for_slot(None).await;
                continue;
            }

            self.set_state(ListenerState::Polling);
            let room = free.min(self.options.batch_size);
            let batch = match self.next_batch(room).await {
                Ok(batch) => {
                    if self.consecutive_errors > 0 {
                        info!(errors = self.consecutive_errors, "Broker recovered");
                        self.consecutive_errors = 0;
                    }
                    batch
                }
                Err(e) => {
                    self.handle_poll_error(e).await;
                    continue;
                }
            };

            if batch.is_empty() {
                self.wait_for_slot(Some(self.options.poll_delay())).await;
                continue;
            }

            self.dispatch(batch);
        }

        self.drain().await;
        self.set_state(ListenerState::Stopped);
        info!(consumer = %self.consumer, "Queue listener stopped");
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    /// Pull this consumer's unacked entries and anything idle past the claim threshold into the backlog
    async fn recover(&mut self) {
        let batch_size = self.options.batch_size;

        match self
            .client
            .read_pending(&self.stream, &self.group, &self.consumer, batch_size)
            .await
        {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(count = entries.len(), "Recovered own pending entries");
                }
                self.enqueue(entries);
            }
            Err(e) => warn!(error = %e, "Failed to read own pending entries on startup"),
        }

        match self
            .client
            .claim_idle(
                &self.stream,
                &self.group,
                &self.consumer,
                self.options.claim_idle_threshold_ms,
                batch_size,
            )
            .await
        {
            Ok(entries) => {
                self.metrics.claimed(entries.len());
                self.enqueue(entries);
            }
            Err(e) => warn!(error = %e, "Failed to claim idle entries on startup"),
        }
    }

    fn is_running(&self, entry_id: &str) -> bool {
        self.running.values().any(|id| id == entry_id)
    }

    fn enqueue(&mut self, entries: Vec<MessageEnvelope>) {
        for entry in entries {
            if self.is_running(&entry.entry_id) {
                debug!(entry_id = %entry.entry_id, "Entry already in flight, skipping");
                continue;
            }
            if self.queued.insert(entry.entry_id.clone()) {
                self.backlog.push_back(entry);
            }
        }
    }

    fn take_backlog(&mut self, max: usize) -> Vec<MessageEnvelope> {
        let take = max.min(self.backlog.len());
        let batch: Vec<MessageEnvelope> = self.backlog.drain(..take).collect();
        for entry in &batch {
            self.queued.remove(&entry.entry_id);
        }
        batch
    }

    /// Assemble up to `room` entries; empty when there is nothing to do or the poll was cancelled.
    ///
    /// Once entries have been collected a later broker error no longer fails
    /// the cycle: the entries are dispatched and the error surfaces on the next poll.
    async fn next_batch(&mut self, room: usize) -> QueueResult<Vec<MessageEnvelope>> {
        let mut batch = self.take_backlog(room);

        if batch.is_empty() && self.claim_due() {
            self.last_claim = Instant::now();
            self.sweep().await?;
            batch = self.take_backlog(room);
        }

        if batch.len() < room {
            match self.redeliver_failed(&batch, room - batch.len()).await {
                Ok(retries) => batch.extend(retries),
                Err(e) => return self.partial_batch(batch, e),
            }
        }

        if batch.len() < room {
            let want = room - batch.len();
            let fresh = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(vec![]),
                read = self.client.read_group(&self.stream, &self.group, &self.consumer, want) => read,
            };
            match fresh {
                Ok(fresh) => batch.extend(fresh),
                Err(e) => return self.partial_batch(batch, e),
            }
        }

        Ok(batch)
    }

    fn partial_batch(
        &self,
        batch: Vec<MessageEnvelope>,
        e: QueueError,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        if batch.is_empty() {
            return Err(e);
        }
        warn!(error = %e, collected = batch.len(), "Poll failed, dispatching entries already collected");
        self.metrics.poll_error(poll_error_kind(&e));
        Ok(batch)
    }

    fn claim_due(&self) -> bool {
        self.options
            .claim_interval()
            .is_some_and(|interval| self.last_claim.elapsed() >= interval)
    }

    /// Claim entries other consumers left idle past the threshold
    async fn sweep(&mut self) -> QueueResult<()> {
        let claimed = self
            .client
            .claim_idle(
                &self.stream,
                &self.group,
                &self.consumer,
                self.options.claim_idle_threshold_ms,
                self.options.batch_size,
            )
            .await?;
        self.metrics.claimed(claimed.len());
        self.enqueue(claimed);

        match self.client.info(&self.stream, &self.group).await {
            Ok(info) => self.metrics.pending(info.total_pending),
            Err(e) => debug!(error = %e, "Failed to refresh pending gauge"),
        }
        Ok(())
    }

    /// Re-claim this consumer's own failed entries once they have idled for `retry_delay_ms`
    async fn redeliver_failed(
        &mut self,
        batch: &[MessageEnvelope],
        room: usize,
    ) -> QueueResult<Vec<MessageEnvelope>> {
        let in_batch: HashSet<&str> = batch.iter().map(|e| e.entry_id.as_str()).collect();
        let scan = room + batch.len() + self.backlog.len() + self.running.len();

        let due: Vec<PendingEntry> = self
            .client
            .consumer_pending(&self.stream, &self.group, &self.consumer, scan)
            .await?
            .into_iter()
            .filter(|p| p.idle_ms >= self.options.retry_delay_ms)
            .filter(|p| {
                !in_batch.contains(p.entry_id.as_str())
                    && !self.queued.contains(&p.entry_id)
                    && !self.is_running(&p.entry_id)
            })
            .take(room)
            .collect();

        if due.is_empty() {
            return Ok(vec![]);
        }

        let redelivered = self
            .client
            .claim(
                &self.stream,
                &self.group,
                &self.consumer,
                self.options.retry_delay_ms,
                &due,
            )
            .await?;

        // Claimed entries whose payload is gone can never succeed
        let live: HashSet<&str> = redelivered.iter().map(|e| e.entry_id.as_str()).collect();
        for gone in due.iter().filter(|p| !live.contains(p.entry_id.as_str())) {
            debug!(entry_id = %gone.entry_id, "Pending entry was deleted, acking");
            self.tracker.forget(&gone.entry_id);
            if let Err(e) = self.client.ack(&self.stream, &self.group, &gone.entry_id).await {
                debug!(entry_id = %gone.entry_id, error = %e, "Failed to ack deleted entry");
            }
        }

        debug!(count = redelivered.len(), "Redelivering failed entries");
        Ok(redelivered)
    }

    /// Start one handler task per entry; the loop keeps polling while they run
    fn dispatch(&mut self, batch: Vec<MessageEnvelope>) {
        self.metrics.received(batch.len());

        for envelope in batch {
            let entry_id = envelope.entry_id.clone();
            let attempt = self
                .tracker
                .attempt_for(&envelope.entry_id, envelope.delivery_count);
            let retire_only = self.tracker.is_dead_lettered(&envelope.entry_id);
            let last_error = self.tracker.last_error(&envelope.entry_id).map(str::to_string);
            let ctx = Arc::clone(&self.ctx);

            let handle = self.tasks.spawn(async move {
                let entry_id = envelope.entry_id.clone();
                let outcome = if retire_only {
                    ctx.retire(&envelope).await
                } else {
                    ctx.process(envelope, attempt, last_error).await
                };
                (entry_id, attempt, outcome)
            });
            self.running.insert(handle.id(), entry_id);
        }
    }

    /// Settle every handler task that has already finished
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.settle_joined(joined);
        }
    }

    /// Wait for a handler task to finish, settling it; gives up after `timeout` or on cancel
    async fn wait_for_slot(&mut self, timeout: Option<Duration>) {
        let timer = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = timer => {}
            Some(joined) = self.tasks.join_next_with_id() => self.settle_joined(joined),
        }
    }

    /// Let in-flight handlers finish after cancellation; nothing new is dispatched
    async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "Waiting for in-flight handlers");
        }
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.settle_joined(joined);
        }
    }

    fn settle_joined(&mut self, joined: Result<(task::Id, Dispatched), JoinError>) {
        match joined {
            Ok((id, (entry_id, attempt, outcome))) => {
                self.running.remove(&id);
                self.settle(&entry_id, attempt, outcome);
            }
            Err(e) => {
                let entry_id = self.running.remove(&e.id());
                error!(entry_id = ?entry_id, error = %e, "Dispatch task failed");
            }
        }
    }

    fn settle(&mut self, entry_id: &str, attempt: u32, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Acked | DispatchOutcome::DeadLettered => self.tracker.forget(entry_id),
            DispatchOutcome::Retry { reason } | DispatchOutcome::DeadLetterFailed { reason } => {
                self.tracker.record_failure(entry_id, attempt, reason)
            }
            DispatchOutcome::DeadLetterUnacked { reason } => {
                warn!(entry_id = %entry_id, reason = %reason, "Dead-lettered entry left pending");
                self.tracker.mark_dead_lettered(entry_id);
            }
            DispatchOutcome::Stranded { reason } => {
                warn!(entry_id = %entry_id, reason = %reason, "Entry left pending");
            }
        }
    }

    async fn handle_poll_error(&mut self, e: QueueError) {
        self.consecutive_errors += 1;
        self.metrics.poll_error(poll_error_kind(&e));

        if e.is_missing_group() {
            warn!(error = %e, "Consumer group missing, recreating");
            if let Err(create_err) = self
                .client
                .create_group(&self.stream, &self.group, self.options.create_stream_if_missing)
                .await
            {
                error!(error = %create_err, "Failed to recreate consumer group");
            }
        }

        let delay = e.category().backoff_delay_ms(
            self.options.poll_delay_ms,
            self.consecutive_errors,
            self.options.max_backoff_ms,
        );
        warn!(
            error = %e,
            consecutive_errors = self.consecutive_errors,
            backoff_ms = delay,
            "Poll failed, backing off"
        );
        self.idle(Duration::from_millis(delay)).await;
    }

    /// Sleep unless cancelled first
    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

fn poll_error_kind(e: &QueueError) -> &'static str {
    if e.is_missing_group() {
        "missing_group"
    } else if e.is_connection_error() {
        "connection"
    } else {
        "protocol"
    }
}
