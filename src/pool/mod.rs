//! Connection pool multiplexing subscribers onto shared real-time channels.
//!
//! At most one underlying channel exists per channel name. Every subscriber of
//! a name registers its own callbacks; a single inbound event is fanned out
//! exactly once to each registered subscriber.
//!
//! Per-channel lifecycle:
//!
//! ```text
//! absent -> connecting -> connected
//!              ^              |
//!              +--- error ----+
//! connecting --(retries exhausted)--> removed
//! connected/connecting --(no subscribers, idle past timeout)--> removed
//! ```
//!
//! Unsubscribing never tears down a connection directly. Teardown is left to
//! [`ConnectionPool::sweep_idle`], so a quick unsubscribe/subscribe cycle
//! reuses the existing connection.

mod channel;
mod factory;
mod local;
mod redis_channel;
mod types;

pub use channel::{ChannelError, ChannelFactory, ChannelHandle, EventHandler};
pub use factory::create_channel_factory;
pub use local::LocalChannelFactory;
pub use redis_channel::RedisChannelFactory;
pub use types::{
    BroadcastMessage, ChannelEvent, ConnectionStatus, ErrorCallback, MessageCallback, PoolConfig,
    PoolStats, PooledConnection, PresenceCallback, PresenceEvent, SubscriberCallbacks,
};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::infrastructure::backoff::LinearBackoff;
use crate::metrics::PoolMetrics;
use crate::telemetry::attributes;

struct PoolEntry {
    channel: Arc<dyn ChannelHandle>,
    handler: EventHandler,
    /// True only after a successful handshake
    is_active: bool,
    last_used: Instant,
    subscribers: HashSet<String>,
    /// Distinguishes this connection from earlier ones with the same name
    generation: u64,
}

impl PoolEntry {
    fn snapshot(&self, name: &str) -> PooledConnection {
        let mut subscribers: Vec<String> = self.subscribers.iter().cloned().collect();
        subscribers.sort();
        PooledConnection {
            id: name.to_string(),
            is_active: self.is_active,
            last_used: self.last_used,
            subscribers,
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    backoff: LinearBackoff,
    factory: Arc<dyn ChannelFactory>,
    /// channel name -> connection
    connections: DashMap<String, PoolEntry>,
    /// channel name -> subscriber id -> callbacks; outlives reconnects
    callbacks: DashMap<String, HashMap<String, SubscriberCallbacks>>,
    /// channel name -> running reconnect
    reconnects: DashMap<String, JoinHandle<()>>,
    next_generation: AtomicU64,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for entry in self.reconnects.iter() {
            entry.value().abort();
        }
    }
}

/// Shared pool of real-time channel connections.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        let backoff = LinearBackoff::new(config.retry_delay);
        Self {
            inner: Arc::new(PoolInner {
                config,
                backoff,
                factory,
                connections: DashMap::new(),
                callbacks: DashMap::new(),
                reconnects: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Register `subscriber_id` on `channel_name`.
    ///
    /// The first subscriber of a name creates the channel and waits for its
    /// handshake (with retries). Later subscribers join the existing
    /// connection without any network activity. Handshake failure is
    /// reported through `on_error`, never as a return value.
    #[tracing::instrument(name = "pool.subscribe", skip(self, callbacks))]
    pub async fn subscribe(
        &self,
        channel_name: &str,
        subscriber_id: &str,
        callbacks: SubscriberCallbacks,
    ) -> ConnectionStatus {
        attributes::record([
            attributes::channel(channel_name),
            attributes::subscriber_id(subscriber_id),
        ]);

        // Callbacks are registered while the connection entry is held, so a
        // concurrent give_up either sees them or runs entirely before us.
        let (channel, handler, generation) =
            match self.inner.connections.entry(channel_name.to_string()) {
                Entry::Occupied(mut occupied) => {
                    self.register_callbacks(channel_name, subscriber_id, callbacks);
                    let entry = occupied.get_mut();
                    entry.subscribers.insert(subscriber_id.to_string());
                    entry.last_used = Instant::now();

                    tracing::debug!(
                        channel = %channel_name,
                        subscriber_id = %subscriber_id,
                        subscribers = entry.subscribers.len(),
                        "Reusing pooled connection"
                    );
                    return entry.snapshot(channel_name).status();
                }
                Entry::Vacant(vacant) => {
                    self.register_callbacks(channel_name, subscriber_id, callbacks);
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let channel = self.inner.factory.create(channel_name);
                    let handler = self.event_handler(channel_name, generation);

                    vacant.insert(PoolEntry {
                        channel: channel.clone(),
                        handler: handler.clone(),
                        is_active: false,
                        last_used: Instant::now(),
                        subscribers: HashSet::from([subscriber_id.to_string()]),
                        generation,
                    });
                    (channel, handler, generation)
                }
            };

        tracing::info!(
            channel = %channel_name,
            subscriber_id = %subscriber_id,
            backend = self.inner.factory.backend_type(),
            "Creating pooled connection"
        );
        self.refresh_gauges();

        if self.handshake(channel_name, &channel, handler, generation).await {
            ConnectionStatus::Connected
        } else {
            self.get_connection_status(channel_name)
        }
    }

    /// Remove a subscriber's callbacks and membership.
    ///
    /// The connection stays pooled even with no subscribers left; the idle
    /// sweep reclaims it. Returns whether the subscriber was registered.
    pub fn unsubscribe(&self, channel_name: &str, subscriber_id: &str) -> bool {
        let mut removed = false;

        if let Some(mut callbacks) = self.inner.callbacks.get_mut(channel_name) {
            removed |= callbacks.remove(subscriber_id).is_some();
        }
        self.inner
            .callbacks
            .remove_if(channel_name, |_, callbacks| callbacks.is_empty());

        if let Some(mut entry) = self.inner.connections.get_mut(channel_name) {
            removed |= entry.subscribers.remove(subscriber_id);
            entry.last_used = Instant::now();

            tracing::debug!(
                channel = %channel_name,
                subscriber_id = %subscriber_id,
                remaining = entry.subscribers.len(),
                "Subscriber removed"
            );
        }

        removed
    }

    /// Tear down connections that have had no subscribers for longer than the
    /// idle timeout. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let is_idle =
            |entry: &PoolEntry| entry.subscribers.is_empty() && entry.last_used.elapsed() > idle_timeout;

        let candidates: Vec<String> = self
            .inner
            .connections
            .iter()
            .filter(|r| is_idle(r.value()))
            .map(|r| r.key().clone())
            .collect();

        let mut removed = 0;
        for name in candidates {
            // Someone may have subscribed since the scan
            let Some((_, entry)) = self.inner.connections.remove_if(&name, |_, e| is_idle(e)) else {
                continue;
            };

            self.abort_reconnect(&name);
            entry.channel.unsubscribe().await;
            PoolMetrics::record_idle_teardown();
            tracing::info!(channel = %name, "Idle connection torn down");
            removed += 1;
        }

        if removed > 0 {
            self.refresh_gauges();
        }
        removed
    }

    /// `connected` / `connecting` / `disconnected`, without side effects.
    pub fn get_connection_status(&self, channel_name: &str) -> ConnectionStatus {
        match self.inner.connections.get(channel_name) {
            Some(entry) if entry.is_active => ConnectionStatus::Connected,
            Some(_) => ConnectionStatus::Connecting,
            None => ConnectionStatus::Disconnected,
        }
    }

    /// Number of connections that completed their handshake.
    pub fn get_active_connections(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|r| r.value().is_active)
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn get_connection(&self, channel_name: &str) -> Option<PooledConnection> {
        self.inner
            .connections
            .get(channel_name)
            .map(|entry| entry.snapshot(channel_name))
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for r in self.inner.connections.iter() {
            stats.total_connections += 1;
            if r.value().is_active {
                stats.active_connections += 1;
            }
            stats
                .subscribers
                .insert(r.key().clone(), r.value().subscribers.len());
        }
        stats
    }

    /// Publish an event on an already established connection.
    #[tracing::instrument(name = "pool.send", skip(self, event))]
    pub async fn send(&self, channel_name: &str, event: ChannelEvent) -> Result<(), ChannelError> {
        attributes::record([
            attributes::channel(channel_name),
            attributes::event_type(event.event_type()),
        ]);
        let channel = match self.inner.connections.get_mut(channel_name) {
            Some(mut entry) if entry.is_active => {
                entry.last_used = Instant::now();
                entry.channel.clone()
            }
            _ => return Err(ChannelError::NotConnected(channel_name.to_string())),
        };

        channel.send(event).await
    }

    /// Unsubscribe every channel and forget all subscribers.
    pub async fn cleanup(&self) -> usize {
        for entry in self.inner.reconnects.iter() {
            entry.value().abort();
        }
        self.inner.reconnects.clear();

        let names: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|r| r.key().clone())
            .collect();

        let mut closed = 0;
        for name in names {
            if let Some((_, entry)) = self.inner.connections.remove(&name) {
                entry.channel.unsubscribe().await;
                closed += 1;
            }
        }
        self.inner.callbacks.clear();
        self.refresh_gauges();

        tracing::info!(closed = closed, "Connection pool cleaned up");
        closed
    }

    /// Handshake with linear backoff. Returns whether the channel connected.
    ///
    /// Gives up early when the connection was removed or replaced meanwhile.
    async fn handshake(
        &self,
        channel_name: &str,
        channel: &Arc<dyn ChannelHandle>,
        handler: EventHandler,
        generation: u64,
    ) -> bool {
        let attempts = self.inner.config.retry_attempts.max(1);
        let mut last_error = ChannelError::TimedOut;

        for attempt in 1..=attempts {
            if !self.is_current(channel_name, generation) {
                return false;
            }

            let result = match timeout(
                self.inner.config.handshake_timeout,
                channel.subscribe(handler.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ChannelError::TimedOut),
            };

            match result {
                Ok(()) => {
                    let activated = match self.inner.connections.get_mut(channel_name) {
                        Some(mut entry) if entry.generation == generation => {
                            entry.is_active = true;
                            entry.last_used = Instant::now();
                            true
                        }
                        _ => false,
                    };

                    if !activated {
                        // Torn down while the handshake was in flight
                        channel.unsubscribe().await;
                        return false;
                    }

                    PoolMetrics::record_handshake();
                    self.refresh_gauges();
                    tracing::info!(channel = %channel_name, attempt = attempt, "Channel connected");
                    return true;
                }
                Err(e) => {
                    PoolMetrics::record_handshake_failure();
                    tracing::warn!(
                        channel = %channel_name,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Channel handshake failed"
                    );
                    last_error = e;

                    if attempt < attempts {
                        tokio::time::sleep(self.inner.backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        self.give_up(channel_name, generation, last_error).await;
        false
    }

    /// Drop a connection whose handshake retries are exhausted and tell every
    /// subscriber once.
    async fn give_up(&self, channel_name: &str, generation: u64, error: ChannelError) {
        // Take the callbacks in the same step as the connection: a subscriber
        // arriving once we suspend belongs to a new connection.
        let (entry, subscribers) = match self.inner.connections.entry(channel_name.to_string()) {
            Entry::Occupied(occupied) if occupied.get().generation == generation => {
                let subscribers: Vec<SubscriberCallbacks> = self
                    .inner
                    .callbacks
                    .remove(channel_name)
                    .map(|(_, callbacks)| callbacks.into_values().collect())
                    .unwrap_or_default();
                (occupied.remove(), subscribers)
            }
            _ => return,
        };
        entry.channel.unsubscribe().await;

        self.refresh_gauges();
        tracing::warn!(
            channel = %channel_name,
            subscribers = subscribers.len(),
            error = %error,
            "Channel retries exhausted, connection dropped"
        );

        let error = ChannelError::SubscribeFailed(error.to_string());
        for callbacks in subscribers {
            if let Some(on_error) = callbacks.on_error {
                on_error(&error);
            }
        }
    }

    fn register_callbacks(
        &self,
        channel_name: &str,
        subscriber_id: &str,
        callbacks: SubscriberCallbacks,
    ) {
        self.inner
            .callbacks
            .entry(channel_name.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), callbacks);
    }

    fn is_current(&self, channel_name: &str, generation: u64) -> bool {
        self.inner
            .connections
            .get(channel_name)
            .is_some_and(|e| e.generation == generation)
    }

    fn event_handler(&self, channel_name: &str, generation: u64) -> EventHandler {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let name = channel_name.to_string();

        Arc::new(move |event: ChannelEvent| {
            if let Some(inner) = weak.upgrade() {
                ConnectionPool { inner }.dispatch(&name, generation, event);
            }
        })
    }

    fn dispatch(&self, channel_name: &str, generation: u64, event: ChannelEvent) {
        if !self.is_current(channel_name, generation) {
            tracing::debug!(channel = %channel_name, "Dropping event from stale connection");
            return;
        }

        let presence = match event {
            ChannelEvent::Error { reason } => {
                self.reconnect(channel_name, generation, reason);
                return;
            }
            ChannelEvent::Message(message) => {
                let delivered = self.fan_out(channel_name, |callbacks| {
                    callbacks.on_message.as_ref().map(|f| f(&message)).is_some()
                });
                tracing::debug!(channel = %channel_name, event = %message.event, delivered = delivered, "Message fanned out");
                return;
            }
            ChannelEvent::PresenceSync { state } => PresenceEvent::Sync { state },
            ChannelEvent::PresenceJoin { key, presences } => PresenceEvent::Join { key, presences },
            ChannelEvent::PresenceLeave { key, presences } => PresenceEvent::Leave { key, presences },
        };

        let delivered = self.fan_out(channel_name, |callbacks| {
            callbacks.on_presence.as_ref().map(|f| f(&presence)).is_some()
        });
        tracing::debug!(channel = %channel_name, delivered = delivered, "Presence fanned out");
    }

    /// Invoke `deliver` once per registered subscriber, outside any map lock.
    fn fan_out<F>(&self, channel_name: &str, deliver: F) -> usize
    where
        F: Fn(&SubscriberCallbacks) -> bool,
    {
        let subscribers: Vec<SubscriberCallbacks> = self
            .inner
            .callbacks
            .get(channel_name)
            .map(|callbacks| callbacks.values().cloned().collect())
            .unwrap_or_default();

        let delivered = subscribers.iter().filter(|callbacks| deliver(callbacks)).count();
        PoolMetrics::record_fanned_out(delivered as u64);
        delivered
    }

    /// Move a connected channel back to `connecting` and retry its handshake.
    fn reconnect(&self, channel_name: &str, generation: u64, reason: String) {
        let (channel, handler) = match self.inner.connections.get_mut(channel_name) {
            // Channels still connecting are already being retried
            Some(mut entry) if entry.generation == generation && entry.is_active => {
                entry.is_active = false;
                (entry.channel.clone(), entry.handler.clone())
            }
            _ => return,
        };

        PoolMetrics::record_reconnect();
        self.refresh_gauges();
        tracing::warn!(channel = %channel_name, reason = %reason, "Channel error, reconnecting");

        let weak = Arc::downgrade(&self.inner);
        let name = channel_name.to_string();
        let handle = tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let pool = ConnectionPool { inner };
            pool.handshake(&name, &channel, handler, generation).await;
        });

        if let Some(previous) = self.inner.reconnects.insert(channel_name.to_string(), handle) {
            previous.abort();
        }
    }

    fn abort_reconnect(&self, channel_name: &str) {
        if let Some((_, handle)) = self.inner.reconnects.remove(channel_name) {
            handle.abort();
        }
    }

    fn refresh_gauges(&self) {
        PoolMetrics::set_connections(self.connection_count(), self.get_active_connections());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        PoolConfig {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    fn pool_with_factory() -> (ConnectionPool, LocalChannelFactory) {
        let factory = LocalChannelFactory::new();
        let pool = ConnectionPool::new(test_config(), Arc::new(factory.clone()));
        (pool, factory)
    }

    fn recording_callbacks() -> (SubscriberCallbacks, Arc<StdMutex<Vec<String>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (on_message, on_presence, on_error) = (log.clone(), log.clone(), log.clone());
        let callbacks = SubscriberCallbacks::new()
            .on_message(move |m| on_message.lock().unwrap().push(format!("message:{}", m.event)))
            .on_presence(move |p| on_presence.lock().unwrap().push(format!("presence:{:?}", p)))
            .on_error(move |e| on_error.lock().unwrap().push(format!("error:{}", e)));
        (callbacks, log)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connection_reuse_single_handshake() {
        let (pool, factory) = pool_with_factory();
        let (cb_a, log_a) = recording_callbacks();
        let (cb_b, log_b) = recording_callbacks();

        assert_eq!(pool.subscribe("chat-room-1", "a", cb_a).await, ConnectionStatus::Connected);
        assert_eq!(pool.subscribe("chat-room-1", "b", cb_b).await, ConnectionStatus::Connected);

        assert_eq!(factory.created_count(), 1);
        assert_eq!(factory.subscription_count("chat-room-1"), 1);

        factory.publish("chat-room-1", ChannelEvent::message("new-message", json!({})));
        settle().await;

        assert_eq!(*log_a.lock().unwrap(), vec!["message:new-message"]);
        assert_eq!(*log_b.lock().unwrap(), vec!["message:new-message"]);
    }

    #[tokio::test]
    async fn test_presence_routed_to_on_presence() {
        let (pool, factory) = pool_with_factory();
        let (callbacks, log) = recording_callbacks();
        pool.subscribe("c", "a", callbacks).await;

        factory.publish(
            "c",
            ChannelEvent::PresenceJoin {
                key: "u1".to_string(),
                presences: json!([]),
            },
        );
        settle().await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("presence:Join"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_teardown_reuses_connection() {
        let (pool, factory) = pool_with_factory();
        pool.subscribe("c", "a", SubscriberCallbacks::new()).await;

        assert!(pool.unsubscribe("c", "a"));
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connected);

        pool.subscribe("c", "b", SubscriberCallbacks::new()).await;
        assert_eq!(factory.created_count(), 1);
        assert_eq!(factory.subscription_count("c"), 1);
        assert_eq!(pool.get_connection("c").unwrap().subscribers, vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_idle_unsubscribed() {
        let (pool, factory) = pool_with_factory();
        pool.subscribe("idle", "a", SubscriberCallbacks::new()).await;
        pool.subscribe("busy", "b", SubscriberCallbacks::new()).await;
        pool.unsubscribe("idle", "a");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(pool.sweep_idle().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.sweep_idle().await, 1);
        settle().await;

        assert_eq!(pool.get_connection_status("idle"), ConnectionStatus::Disconnected);
        assert_eq!(pool.get_connection_status("busy"), ConnectionStatus::Connected);
        assert_eq!(factory.receiver_count("idle"), 0);

        // A fresh subscribe after teardown performs a new handshake
        pool.subscribe("idle", "c", SubscriberCallbacks::new()).await;
        assert_eq!(factory.subscription_count("idle"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_with_linear_delay() {
        let (pool, factory) = pool_with_factory();
        factory.fail_next_subscribes("c", 2);

        let started = Instant::now();
        let status = pool.subscribe("c", "a", SubscriberCallbacks::new()).await;

        assert_eq!(status, ConnectionStatus::Connected);
        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_handshake_notifies_each_subscriber_once() {
        let (pool, factory) = pool_with_factory();
        factory.fail_next_subscribes("c", 3);
        let (cb_a, log_a) = recording_callbacks();
        let (cb_b, log_b) = recording_callbacks();

        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.subscribe("c", "a", cb_a).await })
        };
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connecting);
        assert_eq!(pool.subscribe("c", "b", cb_b).await, ConnectionStatus::Connecting);

        assert_eq!(first.await.unwrap(), ConnectionStatus::Disconnected);
        assert_eq!(log_a.lock().unwrap().len(), 1);
        assert_eq!(log_b.lock().unwrap().len(), 1);
        assert!(log_a.lock().unwrap()[0].starts_with("error:Subscription failed"));
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_counts_as_failure() {
        let (pool, factory) = pool_with_factory();
        factory.stall_subscribes("c", true);
        let (callbacks, log) = recording_callbacks();

        let status = pool.subscribe("c", "a", callbacks).await;

        assert_eq!(status, ConnectionStatus::Disconnected);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_triggers_reconnect() {
        let (pool, factory) = pool_with_factory();
        let (callbacks, log) = recording_callbacks();
        pool.subscribe("c", "a", callbacks).await;
        factory.fail_next_subscribes("c", 1);

        factory.publish(
            "c",
            ChannelEvent::Error {
                reason: "socket reset".to_string(),
            },
        );
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connecting);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connected);
        assert_eq!(factory.created_count(), 1);

        // Callbacks survived the reconnect
        factory.publish("c", ChannelEvent::message("new-message", json!({})));
        settle().await;
        assert_eq!(*log.lock().unwrap(), vec!["message:new-message"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_drops_connection() {
        let (pool, factory) = pool_with_factory();
        let (cb_a, log_a) = recording_callbacks();
        let (cb_b, log_b) = recording_callbacks();
        pool.subscribe("c", "a", cb_a).await;
        pool.subscribe("c", "b", cb_b).await;
        factory.fail_next_subscribes("c", 3);

        factory.publish(
            "c",
            ChannelEvent::Error {
                reason: "socket reset".to_string(),
            },
        );
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connecting);

        // Linear schedule: 1s after the first failure, 2s after the second
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connecting);
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Disconnected);
        for log in [&log_a, &log_b] {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 1);
            assert!(log[0].starts_with("error:Subscription failed"));
        }
    }

    /// Handle 0 never completes its handshake and suspends while tearing
    /// down; later handles connect and record their handler.
    #[derive(Default)]
    struct SlowTeardownFactory {
        created: AtomicU64,
        handlers: Arc<StdMutex<Vec<EventHandler>>>,
    }

    struct SlowTeardownHandle {
        index: u64,
        handlers: Arc<StdMutex<Vec<EventHandler>>>,
    }

    impl ChannelFactory for SlowTeardownFactory {
        fn create(&self, _name: &str) -> Arc<dyn ChannelHandle> {
            Arc::new(SlowTeardownHandle {
                index: self.created.fetch_add(1, Ordering::SeqCst),
                handlers: self.handlers.clone(),
            })
        }

        fn backend_type(&self) -> &'static str {
            "slow-teardown"
        }
    }

    #[async_trait::async_trait]
    impl ChannelHandle for SlowTeardownHandle {
        fn name(&self) -> &str {
            "c"
        }

        async fn subscribe(&self, handler: EventHandler) -> Result<(), ChannelError> {
            if self.index == 0 {
                return Err(ChannelError::Transport("refused".to_string()));
            }
            self.handlers.lock().unwrap().push(handler);
            Ok(())
        }

        async fn send(&self, _event: ChannelEvent) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn unsubscribe(&self) {
            if self.index == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_arriving_during_failed_teardown_keeps_callbacks() {
        let factory = Arc::new(SlowTeardownFactory::default());
        let pool = ConnectionPool::new(
            PoolConfig {
                retry_attempts: 1,
                ..test_config()
            },
            factory.clone(),
        );
        let (cb_a, log_a) = recording_callbacks();
        let (cb_b, log_b) = recording_callbacks();

        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.subscribe("c", "a", cb_a).await })
        };
        settle().await;
        // The failed connection is gone but its teardown is still suspended
        assert_eq!(pool.connection_count(), 0);

        assert_eq!(pool.subscribe("c", "b", cb_b).await, ConnectionStatus::Connected);
        tokio::time::advance(Duration::from_millis(50)).await;
        first.await.unwrap();

        assert_eq!(log_a.lock().unwrap().len(), 1);
        assert!(log_b.lock().unwrap().is_empty());
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connected);

        let handler = factory.handlers.lock().unwrap()[0].clone();
        handler(ChannelEvent::message("new-message", json!({})));
        assert_eq!(*log_b.lock().unwrap(), vec!["message:new-message"]);
    }

    #[tokio::test]
    async fn test_send_requires_active_connection() {
        let (pool, factory) = pool_with_factory();
        let result = pool.send("c", ChannelEvent::message("x", json!(null))).await;
        assert_eq!(result, Err(ChannelError::NotConnected("c".to_string())));

        pool.subscribe("c", "a", SubscriberCallbacks::new()).await;
        let peer = factory.create("c");
        let seen = Arc::new(StdMutex::new(0));
        let counter = seen.clone();
        peer.subscribe(Arc::new(move |_: ChannelEvent| *counter.lock().unwrap() += 1))
            .await
            .unwrap();

        pool.send("c", ChannelEvent::message("x", json!(null))).await.unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let (pool, factory) = pool_with_factory();
        pool.subscribe("c1", "a", SubscriberCallbacks::new()).await;
        pool.subscribe("c1", "b", SubscriberCallbacks::new()).await;
        pool.subscribe("c2", "a", SubscriberCallbacks::new()).await;

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.subscribers["c1"], 2);
        assert_eq!(pool.get_active_connections(), 2);

        assert_eq!(pool.cleanup().await, 2);
        settle().await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.get_connection_status("c1"), ConnectionStatus::Disconnected);
        assert_eq!(factory.receiver_count("c1"), 0);
    }
}
