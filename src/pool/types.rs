use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::channel::ChannelError;
use crate::config::PoolSettings;

/// Runtime configuration for a [`ConnectionPool`](super::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handshake attempts before a channel is given up
    pub retry_attempts: u32,
    /// Delay unit; the wait after failed attempt `k` is `retry_delay * k`
    pub retry_delay: Duration,
    /// How long a connection without subscribers survives
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Bound on a single handshake attempt
    pub handshake_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            retry_attempts: settings.retry_attempts,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Application broadcast carried over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Application event name, e.g. `new-message` or `typing`
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Everything a channel can emit or carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelEvent {
    Message(BroadcastMessage),
    PresenceSync { state: Value },
    PresenceJoin { key: String, presences: Value },
    PresenceLeave { key: String, presences: Value },
    /// Transport-level failure reported by the channel
    Error { reason: String },
}

impl ChannelEvent {
    pub fn message(event: impl Into<String>, payload: Value) -> Self {
        ChannelEvent::Message(BroadcastMessage::new(event, payload))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ChannelEvent::Message(_) => "message",
            ChannelEvent::PresenceSync { .. } => "presence-sync",
            ChannelEvent::PresenceJoin { .. } => "presence-join",
            ChannelEvent::PresenceLeave { .. } => "presence-leave",
            ChannelEvent::Error { .. } => "error",
        }
    }
}

/// Presence change delivered to `on_presence`.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Sync { state: Value },
    Join { key: String, presences: Value },
    Leave { key: String, presences: Value },
}

pub type MessageCallback = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;
pub type PresenceCallback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Per-subscriber callbacks. Unset callbacks ignore their events.
#[derive(Clone, Default)]
pub struct SubscriberCallbacks {
    pub on_message: Option<MessageCallback>,
    pub on_presence: Option<PresenceCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl SubscriberCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_presence<F>(mut self, f: F) -> Self
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.on_presence = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for SubscriberCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberCallbacks")
            .field("on_message", &self.on_message.is_some())
            .field("on_presence", &self.on_presence.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    /// Channel name
    pub id: String,
    pub is_active: bool,
    pub last_used: Instant,
    pub subscribers: Vec<String>,
}

impl PooledConnection {
    pub fn status(&self) -> ConnectionStatus {
        if self.is_active {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Connecting
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    /// Subscriber count per channel
    pub subscribers: HashMap<String, usize>,
}
