//! Redis durable store: the blob lives under a single string key.

use std::sync::Arc;

use async_trait::async_trait;

use crate::redis::RedisPool;

use super::{DurableStore, StoreError};

pub struct RedisStore {
    pool: Arc<RedisPool>,
    key: String,
}

impl RedisStore {
    pub fn new(pool: Arc<RedisPool>, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self.pool.get(&self.key).await?)
    }

    async fn save(&self, blob: &str) -> Result<(), StoreError> {
        self.pool.set(&self.key, blob).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}
