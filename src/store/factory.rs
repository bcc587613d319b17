//! Durable store factory

use std::sync::Arc;

use crate::config::StoreSettings;
use crate::redis::RedisPool;

use super::{DurableStore, FileStore, MemoryStore, RedisStore};

/// Create a durable store based on configuration.
///
/// - `"redis"`: `RedisStore` if a Redis pool is provided
/// - `"file"`: `FileStore` at `settings.path`
/// - anything else: `MemoryStore`
pub fn create_store(
    settings: &StoreSettings,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn DurableStore> {
    match settings.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(backend = "redis", key = %settings.key, "Creating Redis durable store");
                Arc::new(RedisStore::new(pool, settings.key.clone()))
            } else {
                tracing::warn!("Redis store requested but no pool provided, falling back to memory");
                Arc::new(MemoryStore::new())
            }
        }
        "file" => {
            tracing::info!(backend = "file", path = %settings.path, "Creating file durable store");
            Arc::new(FileStore::new(settings.path.clone()))
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory durable store");
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_without_pool_falls_back_to_memory() {
        let settings = StoreSettings {
            backend: "redis".to_string(),
            ..Default::default()
        };
        let store = create_store(&settings, None);
        assert_eq!(store.backend_type(), "memory");
    }

    #[test]
    fn test_file_backend() {
        let store = create_store(&StoreSettings::default(), None);
        assert_eq!(store.backend_type(), "file");
    }

    #[test]
    fn test_redis_backend_with_pool() {
        let settings = StoreSettings {
            backend: "redis".to_string(),
            ..Default::default()
        };
        let pool = Arc::new(RedisPool::new(Default::default()).unwrap());
        let store = create_store(&settings, Some(pool));
        assert_eq!(store.backend_type(), "redis");
    }
}
