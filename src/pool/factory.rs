//! Channel factory selection

use std::sync::Arc;

use crate::config::TransportSettings;
use crate::redis::RedisPool;

use super::{ChannelFactory, LocalChannelFactory, RedisChannelFactory};

/// Create a channel factory based on configuration.
///
/// - `"redis"`: `RedisChannelFactory` if a Redis pool is provided
/// - anything else: `LocalChannelFactory`
pub fn create_channel_factory(
    settings: &TransportSettings,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn ChannelFactory> {
    match (settings.backend.as_str(), redis_pool) {
        ("redis", Some(pool)) => {
            tracing::info!(backend = "redis", prefix = %pool.channel_prefix(), "Creating Redis channel transport");
            Arc::new(RedisChannelFactory::new(pool))
        }
        ("redis", None) => {
            tracing::warn!("Redis transport requested but no pool provided, falling back to local");
            Arc::new(LocalChannelFactory::new())
        }
        _ => {
            tracing::info!(backend = "local", "Creating local channel transport");
            Arc::new(LocalChannelFactory::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_without_pool_falls_back_to_local() {
        let settings = TransportSettings {
            backend: "redis".to_string(),
        };
        assert_eq!(create_channel_factory(&settings, None).backend_type(), "local");
    }

    #[test]
    fn test_default_is_local() {
        let factory = create_channel_factory(&TransportSettings::default(), None);
        assert_eq!(factory.backend_type(), "local");
    }
}
