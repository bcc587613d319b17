//! In-memory durable store. Contents are lost on restart; used in tests and
//! when no persistent backend is configured.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DurableStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    blob: RwLock<Option<String>>,
    saves: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a blob.
    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: RwLock::new(Some(blob.into())),
            ..Default::default()
        }
    }

    /// Current blob contents
    pub async fn contents(&self) -> Option<String> {
        self.blob.read().await.clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    /// Make every subsequent load/save fail, simulating an unreachable backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.blob.read().await.clone())
    }

    async fn save(&self, blob: &str) -> Result<(), StoreError> {
        self.check_available()?;
        *self.blob.write().await = Some(blob.to_string());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
