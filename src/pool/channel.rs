//! Real-time channel transport contract consumed by the pool.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::types::ChannelEvent;

/// Errors that can occur on a real-time channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Subscription handshake timed out")]
    TimedOut,

    #[error("Channel closed")]
    Closed,

    #[error("Channel not connected: {0}")]
    NotConnected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Receives every inbound event of a subscribed channel, in transport order.
pub type EventHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Creates channel handles by name.
pub trait ChannelFactory: Send + Sync {
    /// Create an unsubscribed handle. No network activity happens here.
    fn create(&self, name: &str) -> Arc<dyn ChannelHandle>;

    /// Backend identifier for logs.
    fn backend_type(&self) -> &'static str;
}

/// One real-time channel.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the subscription handshake and start delivering events to
    /// `handler`. Calling it again replaces the previous subscription.
    async fn subscribe(&self, handler: EventHandler) -> Result<(), ChannelError>;

    /// Publish an event to the other subscribers of this channel.
    async fn send(&self, event: ChannelEvent) -> Result<(), ChannelError>;

    /// Stop delivering events. Safe to call when not subscribed.
    async fn unsubscribe(&self);
}
