//! Durable key-value persistence for the delivery queue.
//!
//! The queue stores its whole serialized state as one blob under a fixed key
//! and rewrites it on every mutation. Backends only need to load and replace
//! that blob.

mod factory;
mod file;
mod memory;
mod redis_store;

pub use factory::create_store;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur in a durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] crate::redis::PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend is temporarily unavailable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Whole-blob persistence used by the delivery queue.
///
/// `save` replaces the previous blob. A partially written blob shows up as a
/// deserialization failure on the next load, never as a torn record.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Load the last saved blob, `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<String>, StoreError>;

    /// Replace the stored blob.
    async fn save(&self, blob: &str) -> Result<(), StoreError>;

    /// Backend identifier for logs and stats.
    fn backend_type(&self) -> &'static str;
}
