//! Durable outbound message queue with retry and backoff.
//!
//! Messages composed while offline (or while the transport is flaky) are kept
//! here until an externally supplied [`MessageDeliverer`] confirms them.
//!
//! # Design
//!
//! - One bounded, timestamp-ordered collection per queue instance; inserting
//!   beyond the bound evicts the oldest message first
//! - Each delivery attempt increments `retry_count` before it is made
//! - Failed attempts schedule a cancellable backoff timer
//!   (`base * 2^(attempt-1)`) that moves the message back to `pending`
//! - The whole queue is re-serialized into the [`DurableStore`] on every
//!   mutation; store failures are logged and the queue keeps working in memory
//! - Listeners get an immutable, ordered snapshot after every mutation
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = DeliveryQueue::restore(QueueConfig::default(), store).await;
//! let outcome = queue.enqueue(NewMessage::text("r1", "u1", "hola")).await;
//! let report = queue.process_queue(&deliverer).await;
//! ```

mod deliverer;
mod models;
mod persistence;
mod timers;

pub use deliverer::{DeliveryError, MessageDeliverer};
pub use models::{
    DrainReport, EnqueueOutcome, FileData, MessageStatus, MessageType, NewMessage, QueueConfig,
    QueueEvent, QueueStats, QueuedMessage, RoomStats,
};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::infrastructure::backoff::ExponentialBackoff;
use crate::metrics::{QueueMetrics, StoreMetrics};
use crate::store::DurableStore;
use crate::telemetry::attributes;

use timers::RetryTimers;

/// Floor for the auto-processing interval; `tokio::time::interval` rejects zero.
const MIN_PROCESS_INTERVAL: Duration = Duration::from_millis(1);

/// Listener invoked after every mutation with the event and an ordered snapshot.
pub type QueueListener = Arc<dyn Fn(&QueueEvent, &[QueuedMessage]) + Send + Sync>;

/// Handle returned by [`DeliveryQueue::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct QueueState {
    messages: HashMap<Uuid, QueuedMessage>,
    next_sequence: u64,
}

impl QueueState {
    fn ordered(&self) -> Vec<QueuedMessage> {
        let mut messages: Vec<QueuedMessage> = self.messages.values().cloned().collect();
        messages.sort_by_key(|m| m.order_key());
        messages
    }

    fn oldest_id(&self) -> Option<Uuid> {
        self.messages
            .values()
            .min_by_key(|m| m.order_key())
            .map(|m| m.id)
    }
}

struct QueueInner {
    config: QueueConfig,
    backoff: ExponentialBackoff,
    state: Mutex<QueueState>,
    store: Option<Arc<dyn DurableStore>>,
    listeners: RwLock<Vec<(ListenerId, QueueListener)>>,
    next_listener_id: AtomicU64,
    /// Set while a drain is running
    processing: AtomicBool,
    timers: RetryTimers,
    online: watch::Sender<bool>,
    auto_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_task.get_mut().take() {
            handle.abort();
        }
        self.timers.cancel_all();
    }
}

/// Clears the processing flag when a drain ends, even if it is cancelled.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounded outbound message queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create an in-memory queue with no durable store.
    pub fn new(config: QueueConfig) -> Self {
        Self::build(config, None, QueueState::default())
    }

    /// Create an empty queue that persists into `store` without loading it.
    pub fn with_store(config: QueueConfig, store: Arc<dyn DurableStore>) -> Self {
        Self::build(config, Some(store), QueueState::default())
    }

    /// Create a queue from whatever `store` holds.
    ///
    /// Entries older than the retention window are discarded (and the store
    /// rewritten). Unreadable or undecodable contents start an empty queue.
    pub async fn restore(config: QueueConfig, store: Arc<dyn DurableStore>) -> Self {
        let blob = match store.load().await {
            Ok(blob) => blob,
            Err(e) => {
                StoreMetrics::record_error();
                tracing::warn!(
                    error = %e,
                    backend = store.backend_type(),
                    "Failed to load delivery queue, starting empty"
                );
                None
            }
        };

        let restored = match blob.as_deref() {
            Some(blob) => match persistence::decode(blob, config.retention, Utc::now()) {
                Ok(restored) => restored,
                Err(e) => {
                    StoreMetrics::record_error();
                    tracing::warn!(error = %e, "Stored delivery queue is unreadable, starting empty");
                    persistence::Restored::default()
                }
            },
            None => persistence::Restored::default(),
        };

        let count = restored.messages.len();
        let expired = restored.expired;
        let next_sequence = restored
            .messages
            .iter()
            .map(|m| m.sequence + 1)
            .max()
            .unwrap_or(0);
        let state = QueueState {
            messages: restored.messages.into_iter().map(|m| (m.id, m)).collect(),
            next_sequence,
        };

        let queue = Self::build(config, Some(store), state);

        if expired > 0 {
            QueueMetrics::record_expired_on_load(expired as u64);
            let state = queue.inner.state.lock().await;
            queue
                .commit(state, QueueEvent::Restored { count, expired })
                .await;
        } else {
            QueueMetrics::set_size(count);
        }

        tracing::info!(
            restored = count,
            expired = expired,
            interrupted = restored.interrupted,
            "Delivery queue restored"
        );

        queue
    }

    fn build(config: QueueConfig, store: Option<Arc<dyn DurableStore>>, state: QueueState) -> Self {
        let mut config = config;
        config.max_size = config.max_size.max(1);
        let backoff = ExponentialBackoff::with_config(config.backoff.clone());
        let (online, _) = watch::channel(true);

        Self {
            inner: Arc::new(QueueInner {
                config,
                backoff,
                state: Mutex::new(state),
                store,
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                processing: AtomicBool::new(false),
                timers: RetryTimers::new(),
                online,
                auto_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Add a message to the queue and persist it.
    ///
    /// When the queue is full the oldest message is evicted first; the
    /// evicted id is reported in the outcome and to listeners.
    #[tracing::instrument(
        name = "queue.enqueue",
        skip(self, message),
        fields(chat_room_id = %message.chat_room_id)
    )]
    pub async fn enqueue(&self, message: NewMessage) -> EnqueueOutcome {
        let mut state = self.inner.state.lock().await;

        let mut evicted = None;
        if state.messages.len() >= self.inner.config.max_size {
            if let Some(oldest) = state.oldest_id() {
                state.messages.remove(&oldest);
                self.inner.timers.cancel(&oldest);
                QueueMetrics::record_evicted();
                tracing::warn!(
                    evicted_id = %oldest,
                    max_size = self.inner.config.max_size,
                    "Delivery queue full, evicted oldest message"
                );
                evicted = Some(oldest);
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let message = QueuedMessage::new(message, self.inner.config.max_retries, sequence);
        let id = message.id;

        tracing::debug!(
            message_id = %id,
            chat_room_id = %message.chat_room_id,
            queue_size = state.messages.len() + 1,
            "Message enqueued"
        );
        attributes::record([
            attributes::message_id(id),
            attributes::chat_room_id(&message.chat_room_id),
            attributes::sender_id(&message.sender_id),
            attributes::queue_size(state.messages.len() + 1),
        ]);
        state.messages.insert(id, message);
        QueueMetrics::record_enqueued();

        self.commit(state, QueueEvent::Enqueued { id, evicted }).await;

        EnqueueOutcome { id, evicted }
    }

    /// Remove a message regardless of its status. Returns whether it was present.
    pub async fn dequeue(&self, id: Uuid) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.messages.remove(&id).is_none() {
            return false;
        }
        self.inner.timers.cancel(&id);

        tracing::debug!(message_id = %id, "Message dequeued");
        self.commit(state, QueueEvent::Removed { id }).await;
        true
    }

    /// Snapshot ordered by enqueue time.
    pub async fn get_queue(&self) -> Vec<QueuedMessage> {
        self.inner.state.lock().await.ordered()
    }

    pub async fn get_queue_for_room(&self, chat_room_id: &str) -> Vec<QueuedMessage> {
        self.get_queue()
            .await
            .into_iter()
            .filter(|m| m.chat_room_id == chat_room_id)
            .collect()
    }

    pub async fn get_message(&self, id: Uuid) -> Option<QueuedMessage> {
        self.inner.state.lock().await.messages.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.messages.is_empty()
    }

    /// Attempt delivery of every eligible message, oldest first.
    ///
    /// Eligible means `pending`, or `failed` with retry budget left and no
    /// backoff timer still running. Only one drain runs at a time per queue;
    /// a concurrent call returns a skipped report without attempting anything.
    #[tracing::instrument(name = "queue.process", skip_all)]
    pub async fn process_queue<D>(&self, deliverer: &D) -> DrainReport
    where
        D: MessageDeliverer + ?Sized,
    {
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already in progress, skipping");
            return DrainReport::skipped();
        }
        let _guard = ProcessingGuard(&self.inner.processing);

        let candidates: Vec<Uuid> = {
            let state = self.inner.state.lock().await;
            state
                .ordered()
                .into_iter()
                .filter(|m| self.is_eligible(m))
                .map(|m| m.id)
                .collect()
        };

        let mut report = DrainReport::default();
        if candidates.is_empty() {
            return report;
        }

        attributes::record([attributes::queue_size(candidates.len())]);
        tracing::debug!(candidates = candidates.len(), "Draining delivery queue");

        for id in candidates {
            let Some(message) = self.begin_attempt(id).await else {
                continue;
            };
            report.attempted.push(id);

            let outcome = AssertUnwindSafe(deliverer.deliver(message))
                .catch_unwind()
                .await
                .unwrap_or(Err(DeliveryError::Panicked));

            match outcome {
                Ok(true) => {
                    self.complete_attempt(id).await;
                    report.sent += 1;
                }
                Ok(false) => {
                    report.failed += 1;
                    if self.fail_attempt(id, DeliveryError::Rejected.to_string()).await {
                        report.exhausted += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    if self.fail_attempt(id, e.to_string()).await {
                        report.exhausted += 1;
                    }
                }
            }
        }

        tracing::info!(
            attempted = report.attempted.len(),
            sent = report.sent,
            failed = report.failed,
            exhausted = report.exhausted,
            "Delivery queue drained"
        );

        report
    }

    fn is_eligible(&self, message: &QueuedMessage) -> bool {
        match message.status {
            MessageStatus::Pending => !message.is_exhausted(),
            MessageStatus::Failed => {
                !message.is_exhausted() && !self.inner.timers.is_pending(&message.id)
            }
            MessageStatus::Sending | MessageStatus::Sent => false,
        }
    }

    /// Move a message to `sending`, counting the attempt up front.
    async fn begin_attempt(&self, id: Uuid) -> Option<QueuedMessage> {
        let mut state = self.inner.state.lock().await;
        let message = state.messages.get_mut(&id)?;
        if !message.is_retryable() {
            return None;
        }

        self.inner.timers.cancel(&id);
        message.status = MessageStatus::Sending;
        message.retry_count += 1;
        let attempt = message.retry_count;
        let snapshot = message.clone();

        tracing::debug!(message_id = %id, attempt = attempt, "Attempting delivery");
        self.commit(state, QueueEvent::Sending { id, attempt }).await;

        Some(snapshot)
    }

    async fn complete_attempt(&self, id: Uuid) {
        let mut state = self.inner.state.lock().await;
        QueueMetrics::record_sent();
        // Removed concurrently (dequeue/clear) while the attempt was in flight
        if state.messages.remove(&id).is_none() {
            return;
        }

        tracing::debug!(message_id = %id, "Message delivered");
        self.commit(state, QueueEvent::Sent { id }).await;
    }

    /// Record a failed attempt. Returns whether the retry budget is exhausted.
    async fn fail_attempt(&self, id: Uuid, error: String) -> bool {
        let mut state = self.inner.state.lock().await;
        QueueMetrics::record_failure();
        let Some(message) = state.messages.get_mut(&id) else {
            return false;
        };

        message.status = MessageStatus::Failed;
        message.error = Some(error.clone());
        let attempt = message.retry_count;
        let exhausted = message.is_exhausted();

        let retry_in = if exhausted {
            QueueMetrics::record_exhausted();
            tracing::warn!(
                message_id = %id,
                attempts = attempt,
                error = %error,
                "Message exhausted its retry budget"
            );
            None
        } else {
            let delay = self.inner.backoff.delay_for_attempt(attempt);
            self.schedule_retry(id, delay);
            tracing::warn!(
                message_id = %id,
                attempt = attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Delivery attempt failed, retry scheduled"
            );
            Some(delay)
        };

        self.commit(
            state,
            QueueEvent::Failed {
                id,
                error,
                exhausted,
                retry_in,
            },
        )
        .await;

        exhausted
    }

    fn schedule_retry(&self, id: Uuid, delay: Duration) {
        QueueMetrics::record_retry_scheduled();
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        self.inner.timers.schedule(id, delay, async move {
            if let Some(inner) = weak.upgrade() {
                DeliveryQueue { inner }.retry_ready(id).await;
            }
        });
    }

    /// Backoff elapsed: make the message pending again.
    async fn retry_ready(&self, id: Uuid) {
        let mut state = self.inner.state.lock().await;
        let Some(message) = state.messages.get_mut(&id) else {
            return;
        };
        if message.status != MessageStatus::Failed || message.is_exhausted() {
            return;
        }

        message.status = MessageStatus::Pending;
        message.error = None;

        tracing::debug!(message_id = %id, "Retry backoff elapsed");
        self.commit(state, QueueEvent::RetryReady { id }).await;
    }

    /// Reset failed messages that still have retry budget to `pending`.
    ///
    /// Exhausted messages are left untouched. Returns the number reset so
    /// callers can tell when nothing was retried.
    pub async fn retry_failed_messages(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let mut count = 0;

        for message in state.messages.values_mut() {
            if message.status == MessageStatus::Failed && !message.is_exhausted() {
                self.inner.timers.cancel(&message.id);
                message.status = MessageStatus::Pending;
                message.error = None;
                count += 1;
            }
        }

        if count == 0 {
            tracing::debug!("No failed messages eligible for retry");
            return 0;
        }

        tracing::info!(count = count, "Failed messages reset for retry");
        self.commit(state, QueueEvent::Reset { count }).await;
        count
    }

    /// Drain every `interval` while online and non-empty, and immediately
    /// when connectivity comes back. Replaces any previous auto-processing.
    pub async fn start_auto_processing(
        &self,
        deliverer: Arc<dyn MessageDeliverer>,
        interval: Duration,
    ) {
        let interval = interval.max(MIN_PROCESS_INTERVAL);
        let weak = Arc::downgrade(&self.inner);
        let mut online_rx = self.inner.online.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online_rx.borrow_and_update() {
                            continue;
                        }
                        tracing::info!("Connectivity restored, draining delivery queue");
                    }
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let queue = DeliveryQueue { inner };
                if queue.is_online() && !queue.is_empty().await {
                    queue.process_queue(deliverer.as_ref()).await;
                }
            }
        });

        if let Some(previous) = self.inner.auto_task.lock().await.replace(handle) {
            previous.abort();
        }

        tracing::info!(interval_ms = interval.as_millis() as u64, "Auto-processing started");
    }

    /// Returns whether auto-processing was running.
    pub async fn stop_auto_processing(&self) -> bool {
        match self.inner.auto_task.lock().await.take() {
            Some(handle) => {
                handle.abort();
                tracing::info!("Auto-processing stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_auto_processing(&self) -> bool {
        self.inner
            .auto_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.send_replace(online);
        if previous != online {
            tracing::info!(online = online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Watch the connectivity flag.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Remove every message. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let count = state.messages.len();
        state.messages.clear();
        self.inner.timers.cancel_all();

        tracing::info!(count = count, "Delivery queue cleared");
        self.commit(state, QueueEvent::Cleared { room: None, count })
            .await;
        count
    }

    /// Remove every message for one room. Returns how many were removed.
    pub async fn clear_room(&self, chat_room_id: &str) -> usize {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<Uuid> = state
            .messages
            .values()
            .filter(|m| m.chat_room_id == chat_room_id)
            .map(|m| m.id)
            .collect();

        for id in &ids {
            state.messages.remove(id);
            self.inner.timers.cancel(id);
        }

        tracing::info!(chat_room_id = %chat_room_id, count = ids.len(), "Room cleared from delivery queue");
        self.commit(
            state,
            QueueEvent::Cleared {
                room: Some(chat_room_id.to_string()),
                count: ids.len(),
            },
        )
        .await;
        ids.len()
    }

    pub async fn get_stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats::default();

        for message in state.messages.values() {
            stats.total += 1;
            match message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Sending => stats.sending += 1,
                MessageStatus::Failed => stats.failed += 1,
                MessageStatus::Sent => {}
            }
            stats
                .by_room
                .entry(message.chat_room_id.clone())
                .or_default()
                .record(message.status);
        }

        stats
    }

    /// Number of backoff timers still waiting to fire
    pub fn pending_retry_timers(&self) -> usize {
        self.inner.timers.len()
    }

    pub async fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent, &[QueuedMessage]) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .await
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Stop auto-processing, cancel every backoff timer and persist a final time.
    pub async fn shutdown(&self) {
        self.stop_auto_processing().await;
        let cancelled = self.inner.timers.cancel_all();

        let snapshot = self.inner.state.lock().await.ordered();
        self.persist(&snapshot).await;

        tracing::info!(
            remaining = snapshot.len(),
            cancelled_timers = cancelled,
            "Delivery queue shut down"
        );
    }

    /// Persist and notify listeners with the snapshot, then release the lock.
    ///
    /// Notifying under the state lock keeps listeners seeing snapshots in
    /// mutation order.
    async fn commit(&self, state: MutexGuard<'_, QueueState>, event: QueueEvent) {
        let snapshot = state.ordered();
        self.persist(&snapshot).await;
        QueueMetrics::set_size(snapshot.len());

        self.notify(&event, &snapshot).await;
        drop(state);
    }

    async fn persist(&self, snapshot: &[QueuedMessage]) {
        let Some(store) = &self.inner.store else {
            return;
        };

        let result = match persistence::encode(snapshot) {
            Ok(blob) => store.save(&blob).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            StoreMetrics::record_error();
            tracing::warn!(
                error = %e,
                backend = store.backend_type(),
                "Failed to persist delivery queue, continuing in memory"
            );
        }
    }

    async fn notify(&self, event: &QueueEvent, snapshot: &[QueuedMessage]) {
        let listeners: Vec<QueueListener> = self
            .inner
            .listeners
            .read()
            .await
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event, snapshot);
        }
    }
}
