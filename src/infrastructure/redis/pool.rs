//! Shared multiplexed Redis connection.
//!
//! Commands (GET/SET/PUBLISH) go through one lazily established multiplexed
//! connection. Pub/Sub subscriptions need a dedicated connection and are
//! opened from [`RedisPool::client`].

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Connection not available
    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    config: RedisConfig,
}

impl RedisPool {
    pub fn new(config: RedisConfig) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            config,
        })
    }

    /// Client used to open dedicated Pub/Sub connections
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get a connection from the pool.
    ///
    /// This will establish a new connection if none exists.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Execute a Redis command, dropping the cached connection when it broke
    /// so the next call reconnects.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, PoolError> {
        let key = key.to_string();
        self.execute(|mut conn| async move { conn.get(key).await }).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), PoolError> {
        let key = key.to_string();
        let value = value.to_string();
        self.execute(|mut conn| async move { conn.set::<_, _, ()>(key, value).await })
            .await
    }

    /// Publish a payload, returning the number of receivers.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, PoolError> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        self.execute(|mut conn| async move { conn.publish(channel, payload).await })
            .await
    }

    /// Ping Redis to check connectivity.
    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// Get the Redis URL (for debugging).
    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn channel_prefix(&self) -> &str {
        &self.config.channel_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = RedisPool::new(RedisConfig::default()).unwrap();
        assert_eq!(pool.url(), "redis://localhost:6379");
        assert_eq!(pool.channel_prefix(), "realtime:");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(RedisPool::new(config).is_err());
    }

    #[test]
    fn test_pool_error_display() {
        let unavail_err = PoolError::ConnectionUnavailable("test".to_string());
        assert!(format!("{}", unavail_err).contains("test"));
    }
}
