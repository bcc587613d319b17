//! Chat room client binding rooms to pool channels and outbound messages to
//! the delivery queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::{
    BroadcastMessage, ChannelError, ChannelEvent, ConnectionPool, ConnectionStatus,
    SubscriberCallbacks,
};
use crate::queue::{
    DeliveryError, DeliveryQueue, DrainReport, EnqueueOutcome, FileData, MessageDeliverer,
    MessageType, NewMessage, QueuedMessage,
};

/// Broadcast event carrying a chat message
pub const NEW_MESSAGE_EVENT: &str = "new-message";
/// Broadcast event carrying a typing indicator
pub const TYPING_EVENT: &str = "typing";

/// Channel name for a chat room. Stable, so repeated subscriptions reuse the
/// pooled connection.
pub fn chat_room_channel(room_id: &str) -> String {
    format!("chat-room-{}", room_id)
}

/// Chat message as broadcast to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_room_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Decode a `new-message` broadcast; `None` for other events or bad payloads.
    pub fn from_broadcast(message: &BroadcastMessage) -> Option<Self> {
        if message.event != NEW_MESSAGE_EVENT {
            return None;
        }
        serde_json::from_value(message.payload.clone()).ok()
    }
}

impl From<&QueuedMessage> for ChatMessage {
    fn from(message: &QueuedMessage) -> Self {
        Self {
            id: message.id,
            chat_room_id: message.chat_room_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            message_type: message.message_type,
            file_data: message.file_data.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub user_id: String,
    pub is_typing: bool,
}

impl TypingIndicator {
    pub fn from_broadcast(message: &BroadcastMessage) -> Option<Self> {
        if message.event != TYPING_EVENT {
            return None;
        }
        serde_json::from_value(message.payload.clone()).ok()
    }
}

/// Delivers queued messages by broadcasting them on the room's pooled channel.
#[derive(Clone)]
pub struct PoolDeliverer {
    pool: ConnectionPool,
}

impl PoolDeliverer {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageDeliverer for PoolDeliverer {
    async fn deliver(&self, message: QueuedMessage) -> Result<bool, DeliveryError> {
        let channel = chat_room_channel(&message.chat_room_id);
        let payload = serde_json::to_value(ChatMessage::from(&message))
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        match self
            .pool
            .send(&channel, ChannelEvent::message(NEW_MESSAGE_EVENT, payload))
            .await
        {
            Ok(()) => Ok(true),
            Err(ChannelError::NotConnected(channel)) => Err(DeliveryError::NotConnected(channel)),
            Err(e) => Err(DeliveryError::Transport(e.to_string())),
        }
    }
}

/// Per-user chat client.
#[derive(Clone)]
pub struct BroadcastClient {
    user_id: String,
    queue: DeliveryQueue,
    pool: ConnectionPool,
    deliverer: PoolDeliverer,
}

impl BroadcastClient {
    pub fn new(user_id: impl Into<String>, queue: DeliveryQueue, pool: ConnectionPool) -> Self {
        let deliverer = PoolDeliverer::new(pool.clone());
        Self {
            user_id: user_id.into(),
            queue,
            pool,
            deliverer,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn deliverer(&self) -> PoolDeliverer {
        self.deliverer.clone()
    }

    pub async fn subscribe_room(
        &self,
        room_id: &str,
        subscriber_id: &str,
        callbacks: SubscriberCallbacks,
    ) -> ConnectionStatus {
        self.pool
            .subscribe(&chat_room_channel(room_id), subscriber_id, callbacks)
            .await
    }

    pub fn unsubscribe_room(&self, room_id: &str, subscriber_id: &str) -> bool {
        self.pool
            .unsubscribe(&chat_room_channel(room_id), subscriber_id)
    }

    pub fn room_status(&self, room_id: &str) -> ConnectionStatus {
        self.pool.get_connection_status(&chat_room_channel(room_id))
    }

    /// Queue a message and, when online, try to deliver right away.
    ///
    /// The message stays queued (for retry) if the immediate attempt fails.
    pub async fn send_message(&self, message: NewMessage) -> (EnqueueOutcome, Option<DrainReport>) {
        let outcome = self.queue.enqueue(message).await;

        if !self.queue.is_online() {
            tracing::debug!(message_id = %outcome.id, "Offline, message left queued");
            return (outcome, None);
        }

        let report = self.queue.process_queue(&self.deliverer).await;
        (outcome, Some(report))
    }

    pub async fn send_text(
        &self,
        room_id: &str,
        content: impl Into<String>,
    ) -> (EnqueueOutcome, Option<DrainReport>) {
        self.send_message(NewMessage::text(room_id, self.user_id.as_str(), content))
            .await
    }

    /// Broadcast a typing indicator. Ephemeral: never queued or retried.
    pub async fn send_typing(&self, room_id: &str, is_typing: bool) -> Result<(), ChannelError> {
        let indicator = TypingIndicator {
            user_id: self.user_id.clone(),
            is_typing,
        };
        let payload = serde_json::to_value(&indicator)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        self.pool
            .send(
                &chat_room_channel(room_id),
                ChannelEvent::message(TYPING_EVENT, payload),
            )
            .await
    }

    pub async fn pending_messages(&self, room_id: &str) -> Vec<QueuedMessage> {
        self.queue.get_queue_for_room(room_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ChannelFactory, LocalChannelFactory, PoolConfig};
    use crate::queue::{MessageStatus, QueueConfig};
    use std::sync::{Arc, Mutex};

    fn client() -> (BroadcastClient, LocalChannelFactory) {
        let factory = LocalChannelFactory::new();
        let pool = ConnectionPool::new(PoolConfig::default(), Arc::new(factory.clone()));
        let queue = DeliveryQueue::new(QueueConfig::default());
        (BroadcastClient::new("u1", queue, pool), factory)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_chat_room_channel_name() {
        assert_eq!(chat_room_channel("42"), "chat-room-42");
    }

    #[test]
    fn test_typing_indicator_decoding() {
        let broadcast = BroadcastMessage::new(
            TYPING_EVENT,
            serde_json::json!({"userId": "u2", "isTyping": true}),
        );
        let indicator = TypingIndicator::from_broadcast(&broadcast).unwrap();
        assert_eq!(indicator.user_id, "u2");
        assert!(indicator.is_typing);
        assert!(ChatMessage::from_broadcast(&broadcast).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_connection_stays_queued() {
        let (client, _) = client();

        let (outcome, report) = client.send_text("r1", "hola").await;

        let report = report.unwrap();
        assert_eq!(report.failed, 1);
        let pending = client.pending_messages("r1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, outcome.id);
        assert_eq!(pending[0].status, MessageStatus::Failed);
        assert_eq!(pending[0].error.as_deref(), Some("channel not connected: chat-room-r1"));
    }

    #[tokio::test]
    async fn test_send_reaches_room_members() {
        let (client, factory) = client();
        client.subscribe_room("r1", "composer", SubscriberCallbacks::new()).await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let peer = factory.create(&chat_room_channel("r1"));
        peer.subscribe(Arc::new(move |event: ChannelEvent| {
            if let ChannelEvent::Message(message) = event {
                if let Some(chat) = ChatMessage::from_broadcast(&message) {
                    sink.lock().unwrap().push(chat);
                }
            }
        }))
        .await
        .unwrap();

        let (outcome, report) = client.send_text("r1", "hola").await;
        settle().await;

        assert_eq!(report.unwrap().sent, 1);
        assert!(client.pending_messages("r1").await.is_empty());
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, outcome.id);
        assert_eq!(received[0].content.as_deref(), Some("hola"));
    }

    #[tokio::test]
    async fn test_offline_send_skips_immediate_attempt() {
        let (client, _) = client();
        client.queue().set_online(false);

        let (_, report) = client.send_text("r1", "hola").await;

        assert!(report.is_none());
        assert_eq!(client.pending_messages("r1").await[0].status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_typing_requires_connection() {
        let (client, _) = client();
        assert!(client.send_typing("r1", true).await.is_err());

        client.subscribe_room("r1", "composer", SubscriberCallbacks::new()).await;
        assert!(client.send_typing("r1", true).await.is_ok());
    }
}
