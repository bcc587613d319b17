//! The externally supplied delivery operation.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use super::models::QueuedMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The deliverer reported a negative result
    #[error("delivery rejected")]
    Rejected,

    #[error("channel not connected: {0}")]
    NotConnected(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The deliverer panicked
    #[error("deliverer panicked")]
    Panicked,
}

/// Performs the actual delivery of a queued message.
///
/// `Ok(true)` is success; `Ok(false)` and `Err(_)` both count as a failed
/// attempt. The queue never learns how delivery happens.
#[async_trait]
pub trait MessageDeliverer: Send + Sync {
    async fn deliver(&self, message: QueuedMessage) -> Result<bool, DeliveryError>;
}

#[async_trait]
impl<F, Fut> MessageDeliverer for F
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, DeliveryError>> + Send,
{
    async fn deliver(&self, message: QueuedMessage) -> Result<bool, DeliveryError> {
        (self)(message).await
    }
}
