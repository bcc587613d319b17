//! Redis Pub/Sub channel transport.
//!
//! Each handle owns a dedicated pub/sub connection; publishing goes through
//! the shared multiplexed [`RedisPool`]. Events travel as JSON envelopes
//! tagged with the sending handle so a handle never receives its own events.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::channel::{ChannelError, ChannelFactory, ChannelHandle, EventHandler};
use super::types::ChannelEvent;
use crate::redis::RedisPool;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    event: ChannelEvent,
}

/// Channel factory backed by Redis Pub/Sub.
pub struct RedisChannelFactory {
    pool: Arc<RedisPool>,
}

impl RedisChannelFactory {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }
}

impl ChannelFactory for RedisChannelFactory {
    fn create(&self, name: &str) -> Arc<dyn ChannelHandle> {
        Arc::new(RedisChannel {
            name: name.to_string(),
            redis_channel: format!("{}{}", self.pool.channel_prefix(), name),
            origin: Uuid::new_v4(),
            pool: self.pool.clone(),
            task: Mutex::new(None),
        })
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}

struct RedisChannel {
    name: String,
    redis_channel: String,
    origin: Uuid,
    pool: Arc<RedisPool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ChannelHandle for RedisChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, handler: EventHandler) -> Result<(), ChannelError> {
        let mut pubsub = self
            .pool
            .client()
            .get_async_pubsub()
            .await
            .map_err(|e| ChannelError::SubscribeFailed(e.to_string()))?;
        pubsub
            .subscribe(&self.redis_channel)
            .await
            .map_err(|e| ChannelError::SubscribeFailed(e.to_string()))?;

        tracing::debug!(channel = %self.name, redis_channel = %self.redis_channel, "Redis channel subscribed");

        let origin = self.origin;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(channel = %name, error = %e, "Failed to get message payload");
                        continue;
                    }
                };

                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) if envelope.origin == origin => {}
                    Ok(envelope) => handler(envelope.event),
                    Err(e) => {
                        tracing::warn!(
                            channel = %name,
                            error = %e,
                            "Dropping malformed channel payload"
                        );
                    }
                }
            }

            tracing::warn!(channel = %name, "Redis message stream ended");
            handler(ChannelEvent::Error {
                reason: "pub/sub stream ended".to_string(),
            });
        });

        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        let envelope = Envelope {
            origin: self.origin,
            event,
        };
        let payload =
            serde_json::to_string(&envelope).map_err(|e| ChannelError::Transport(e.to_string()))?;

        self.pool
            .publish(&self.redis_channel, &payload)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn unsubscribe(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            tracing::debug!(channel = %self.name, "Redis channel unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            origin: Uuid::new_v4(),
            event: ChannelEvent::message("new-message", json!({"id": "m1"})),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.origin, envelope.origin);
        assert_eq!(decoded.event, envelope.event);
    }

    #[test]
    fn test_channel_name_is_prefixed() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
            channel_prefix: "realtime:".to_string(),
        };
        let pool = Arc::new(RedisPool::new(config).unwrap());
        let factory = RedisChannelFactory::new(pool);
        let channel = factory.create("chat-room-42");

        assert_eq!(channel.name(), "chat-room-42");
        assert_eq!(factory.backend_type(), "redis");
    }
}
