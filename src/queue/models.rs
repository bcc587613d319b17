//! Queue data model: messages, retry status, events and statistics.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::infrastructure::backoff::BackoffConfig;

/// Runtime configuration for a [`DeliveryQueue`](super::DeliveryQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of messages held; the oldest is evicted beyond this
    pub max_size: usize,
    /// Default retry ceiling for messages that don't override it
    pub max_retries: u32,
    /// Retry backoff (`initial_delay_ms` is the base delay)
    pub backoff: BackoffConfig,
    /// Auto-processing interval
    pub process_interval: Duration,
    /// Persisted messages older than this are discarded on load
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_size: settings.max_size,
            max_retries: settings.max_retries.max(1),
            backoff: BackoffConfig {
                initial_delay_ms: settings.base_delay_ms,
                max_delay_ms: settings.max_delay_ms,
                multiplier: 2.0,
                jitter_factor: settings.jitter_factor,
            },
            process_interval: Duration::from_millis(settings.process_interval_ms.max(1)),
            retention: Duration::from_secs(settings.retention_hours * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Image,
    File,
    Video,
    Audio,
}

/// Attachment metadata for non-text messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Failed,
    Sent,
}

/// Input to [`DeliveryQueue::enqueue`](super::DeliveryQueue::enqueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_room_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub message_type: MessageType,
    pub file_data: Option<FileData>,
    /// Overrides the queue's default retry ceiling
    pub max_retries: Option<u32>,
}

impl NewMessage {
    pub fn text(
        chat_room_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            chat_room_id: chat_room_id.into(),
            sender_id: sender_id.into(),
            content: Some(content.into()),
            message_type: MessageType::Text,
            file_data: None,
            max_retries: None,
        }
    }

    pub fn attachment(
        chat_room_id: impl Into<String>,
        sender_id: impl Into<String>,
        message_type: MessageType,
        file_data: FileData,
    ) -> Self {
        Self {
            chat_room_id: chat_room_id.into(),
            sender_id: sender_id.into(),
            content: None,
            message_type,
            file_data: Some(file_data),
            max_retries: None,
        }
    }

    pub fn caption(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: Uuid,
    pub chat_room_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    /// Enqueue time
    pub timestamp: DateTime<Utc>,
    /// Tie-breaker for messages enqueued within the same clock tick
    #[serde(default)]
    pub sequence: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueuedMessage {
    pub(crate) fn new(message: NewMessage, default_max_retries: u32, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_room_id: message.chat_room_id,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            file_data: message.file_data,
            timestamp: Utc::now(),
            sequence,
            retry_count: 0,
            // Every message gets at least one attempt
            max_retries: message.max_retries.unwrap_or(default_max_retries).max(1),
            status: MessageStatus::Pending,
            error: None,
        }
    }

    /// Retry budget used up
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Failed and used up its retry budget; never retried automatically
    pub fn is_terminal_failed(&self) -> bool {
        self.status == MessageStatus::Failed && self.is_exhausted()
    }

    /// Pending or failed, with retry budget left.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            MessageStatus::Pending | MessageStatus::Failed => !self.is_exhausted(),
            MessageStatus::Sending | MessageStatus::Sent => false,
        }
    }

    pub fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.timestamp) > retention
    }

    pub(crate) fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

/// What changed, passed to listeners together with the ordered snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { id: Uuid, evicted: Option<Uuid> },
    Removed { id: Uuid },
    Sending { id: Uuid, attempt: u32 },
    Sent { id: Uuid },
    Failed {
        id: Uuid,
        error: String,
        exhausted: bool,
        /// Backoff before the message becomes pending again
        retry_in: Option<Duration>,
    },
    /// Backoff elapsed, message is pending again
    RetryReady { id: Uuid },
    /// Failed messages reset by an explicit retry
    Reset { count: usize },
    /// `room` is `None` for a full clear
    Cleared { room: Option<String>, count: usize },
    Restored { count: usize, expired: usize },
}

/// Result of [`DeliveryQueue::enqueue`](super::DeliveryQueue::enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: Uuid,
    /// Oldest message dropped to respect the size bound
    pub evicted: Option<Uuid>,
}

/// Result of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running; nothing was attempted
    pub skipped: bool,
    /// Ids in the order they were attempted
    pub attempted: Vec<Uuid>,
    pub sent: usize,
    pub failed: usize,
    /// Failures that used up the retry budget
    pub exhausted: usize,
}

impl DrainReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub failed: usize,
}

impl RoomStats {
    pub(crate) fn record(&mut self, status: MessageStatus) {
        self.total += 1;
        match status {
            MessageStatus::Pending => self.pending += 1,
            MessageStatus::Sending => self.sending += 1,
            MessageStatus::Failed => self.failed += 1,
            MessageStatus::Sent => {}
        }
    }
}

/// Aggregate queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub failed: usize,
    pub by_room: HashMap<String, RoomStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_defaults() {
        let message = QueuedMessage::new(NewMessage::text("r1", "u1", "hola"), 3, 0);

        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.retry_count, 0);
        assert_eq!(message.max_retries, 3);
        assert!(message.is_retryable());
        assert!(!message.is_exhausted());
    }

    #[test]
    fn test_max_retries_override() {
        let message = QueuedMessage::new(NewMessage::text("r1", "u1", "hi").max_retries(7), 3, 0);
        assert_eq!(message.max_retries, 7);
    }

    #[test]
    fn test_zero_retry_ceiling_still_allows_one_attempt() {
        let message = QueuedMessage::new(NewMessage::text("r1", "u1", "hi").max_retries(0), 3, 0);
        assert_eq!(message.max_retries, 1);
        assert!(message.is_retryable());

        let config = QueueConfig::from(&QueueSettings {
            max_retries: 0,
            process_interval_ms: 0,
            ..QueueSettings::default()
        });
        assert_eq!(config.max_retries, 1);
        assert!(!config.process_interval.is_zero());
    }

    #[test]
    fn test_exhausted_pending_message_not_retryable() {
        let mut message = QueuedMessage::new(NewMessage::text("r1", "u1", "hi"), 1, 0);
        message.retry_count = 1;
        assert_eq!(message.status, MessageStatus::Pending);
        assert!(!message.is_retryable());
    }

    #[test]
    fn test_failed_message_retryable_until_exhausted() {
        let mut message = QueuedMessage::new(NewMessage::text("r1", "u1", "hi"), 2, 0);
        message.status = MessageStatus::Failed;
        message.retry_count = 1;
        assert!(message.is_retryable());

        message.retry_count = 2;
        assert!(!message.is_retryable());
        assert!(message.is_terminal_failed());
    }

    #[test]
    fn test_is_expired() {
        let mut message = QueuedMessage::new(NewMessage::text("r1", "u1", "hi"), 3, 0);
        let now = Utc::now();
        message.timestamp = now - chrono::Duration::hours(25);

        assert!(message.is_expired(Duration::from_secs(24 * 3600), now));
        assert!(!message.is_expired(Duration::from_secs(48 * 3600), now));
    }

    #[test]
    fn test_wire_names() {
        let file = FileData {
            url: "https://cdn.example/a.png".to_string(),
            name: "a.png".to_string(),
            size: 42,
            mime_type: "image/png".to_string(),
        };
        let message = QueuedMessage::new(
            NewMessage::attachment("r1", "u1", MessageType::Image, file),
            3,
            0,
        );

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["messageType"], "IMAGE");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["fileData"]["type"], "image/png");
        assert_eq!(json["chatRoomId"], "r1");
    }

    #[test]
    fn test_room_stats_record() {
        let mut stats = RoomStats::default();
        stats.record(MessageStatus::Pending);
        stats.record(MessageStatus::Failed);
        stats.record(MessageStatus::Failed);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 2);
    }
}
