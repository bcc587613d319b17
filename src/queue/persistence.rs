//! Serialized queue layout: an ordered JSON list of `[id, message]` pairs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{MessageStatus, QueuedMessage};

/// Messages recovered from a stored blob.
#[derive(Debug, Default)]
pub(crate) struct Restored {
    pub messages: Vec<QueuedMessage>,
    /// Entries dropped for being older than the retention window
    pub expired: usize,
    /// Entries that were mid-attempt when persisted
    pub interrupted: usize,
}

pub(crate) fn encode(messages: &[QueuedMessage]) -> Result<String, serde_json::Error> {
    let entries: Vec<(Uuid, &QueuedMessage)> = messages.iter().map(|m| (m.id, m)).collect();
    serde_json::to_string(&entries)
}

/// Decode a blob, dropping expired entries.
///
/// A message persisted as `sending` was interrupted mid-attempt; the attempt
/// already counts, so it comes back `pending` with budget left or `failed`
/// without.
pub(crate) fn decode(
    blob: &str,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<Restored, serde_json::Error> {
    let entries: Vec<(Uuid, QueuedMessage)> = serde_json::from_str(blob)?;
    let mut restored = Restored::default();

    for (id, mut message) in entries {
        if message.is_expired(retention, now) {
            restored.expired += 1;
            continue;
        }

        message.id = id;
        match message.status {
            MessageStatus::Sending => {
                restored.interrupted += 1;
                if message.is_exhausted() {
                    message.status = MessageStatus::Failed;
                    message.error = Some("interrupted during delivery".to_string());
                } else {
                    message.status = MessageStatus::Pending;
                }
            }
            MessageStatus::Sent => continue,
            MessageStatus::Pending | MessageStatus::Failed => {}
        }
        restored.messages.push(message);
    }

    restored.messages.sort_by_key(|m| m.order_key());
    Ok(restored)
}
