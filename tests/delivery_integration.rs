//! Delivery queue integration tests
//!
//! Drive the queue through its public API with scripted deliverers and a
//! paused tokio clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::assert_ok;
use uuid::Uuid;

use chat_relay::backoff::BackoffConfig;
use chat_relay::queue::{
    DeliveryError, DeliveryQueue, MessageDeliverer, MessageStatus, NewMessage, QueueConfig,
    QueueEvent, QueuedMessage,
};
use chat_relay::store::{DurableStore, FileStore, MemoryStore};

fn config(max_size: usize, max_retries: u32) -> QueueConfig {
    QueueConfig {
        max_size,
        max_retries,
        backoff: BackoffConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        },
        process_interval: Duration::from_secs(5),
        retention: Duration::from_secs(24 * 3600),
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Replays scripted outcomes and records the messages it was handed.
struct Script {
    outcomes: Mutex<VecDeque<bool>>,
    seen: Mutex<Vec<QueuedMessage>>,
}

impl Script {
    fn new(outcomes: &[bool]) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<QueuedMessage> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageDeliverer for Script {
    async fn deliver(&self, message: QueuedMessage) -> Result<bool, DeliveryError> {
        self.seen.lock().unwrap().push(message);
        let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(true)
        } else {
            Err(DeliveryError::Transport("network unreachable".to_string()))
        }
    }
}

type EventLog = Arc<Mutex<Vec<(QueueEvent, Vec<Uuid>)>>>;

async fn record_events(queue: &DeliveryQueue) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    queue
        .add_listener(move |event, snapshot| {
            let ids = snapshot.iter().map(|m| m.id).collect();
            sink.lock().unwrap().push((event.clone(), ids));
        })
        .await;
    log
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_fail_twice_then_succeed() {
    let queue = DeliveryQueue::new(config(100, 3));
    let log = record_events(&queue).await;
    let deliverer = Script::new(&[false, false, true]);

    let m1 = queue.enqueue(NewMessage::text("r1", "u1", "hola")).await.id;

    // Attempt 1 fails, backoff 1s
    queue.process_queue(&deliverer).await;
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;

    // Attempt 2 fails, backoff 2s
    queue.process_queue(&deliverer).await;
    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;

    // Attempt 3 succeeds
    let report = queue.process_queue(&deliverer).await;
    assert_eq!(report.sent, 1);

    let attempts = deliverer.seen();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].retry_count, 3);
    assert!(queue.get_queue_for_room("r1").await.is_empty());

    let log = log.lock().unwrap();
    let sent: Vec<_> = log
        .iter()
        .filter(|(event, _)| matches!(event, QueueEvent::Sent { .. }))
        .collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, QueueEvent::Sent { id: m1 });
    assert!(!sent[0].1.contains(&m1));
}

#[tokio::test]
async fn test_drain_order_matches_enqueue_order_across_rooms() {
    let queue = DeliveryQueue::new(config(100, 3));
    let mut expected = Vec::new();
    for i in 0..10 {
        let room = format!("r{}", i % 3);
        expected.push(queue.enqueue(NewMessage::text(room, "u1", format!("m{}", i))).await.id);
    }

    let deliverer = Script::new(&[]);
    queue.process_queue(&deliverer).await;

    let attempted: Vec<Uuid> = deliverer.seen().iter().map(|m| m.id).collect();
    assert_eq!(attempted, expected);
}

#[tokio::test]
async fn test_bounded_queue_keeps_newest() {
    let queue = DeliveryQueue::new(config(5, 3));
    let log = record_events(&queue).await;

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(queue.enqueue(NewMessage::text("r1", "u1", format!("m{}", i))).await.id);
    }

    let remaining: Vec<Uuid> = queue.get_queue().await.iter().map(|m| m.id).collect();
    assert_eq!(remaining, ids[1..].to_vec());

    let log = log.lock().unwrap();
    assert_eq!(
        log.last().map(|(event, _)| event.clone()),
        Some(QueueEvent::Enqueued {
            id: ids[5],
            evicted: Some(ids[0]),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_per_attempt() {
    let queue = DeliveryQueue::new(config(100, 4));
    let log = record_events(&queue).await;
    let deliverer = Script::new(&[false, false, false]);
    let id = queue.enqueue(NewMessage::text("r1", "u1", "hola")).await.id;

    for expected in [1u64, 2, 4] {
        queue.process_queue(&deliverer).await;

        tokio::time::advance(Duration::from_millis(expected * 1000 - 1)).await;
        settle().await;
        assert_eq!(queue.get_message(id).await.unwrap().status, MessageStatus::Failed);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(queue.get_message(id).await.unwrap().status, MessageStatus::Pending);
    }

    let delays: Vec<Duration> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(event, _)| match event {
            QueueEvent::Failed { retry_in, .. } => *retry_in,
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_message_stays_failed() {
    let queue = DeliveryQueue::new(config(100, 3));
    let log = record_events(&queue).await;
    let deliverer = Script::new(&[false; 10]);
    let id = queue.enqueue(NewMessage::text("r1", "u1", "hola")).await.id;

    for _ in 0..5 {
        queue.process_queue(&deliverer).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
    }

    assert_eq!(deliverer.seen().len(), 3);
    let cycles = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(event, _)| matches!(event, QueueEvent::Failed { .. }))
        .count();
    assert_eq!(cycles, 3);

    assert_eq!(queue.retry_failed_messages().await, 0);
    let message = queue.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.retry_count, 3);
    assert_eq!(message.error.as_deref(), Some("transport error: network unreachable"));

    let stats = queue.get_stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.by_room["r1"].failed, 1);
}

#[tokio::test]
async fn test_dequeue_twice_is_harmless() {
    let queue = DeliveryQueue::new(config(100, 3));
    let keep = queue.enqueue(NewMessage::text("r1", "u1", "a")).await.id;
    let drop_id = queue.enqueue(NewMessage::text("r1", "u1", "b")).await.id;

    assert!(queue.dequeue(drop_id).await);
    assert!(!queue.dequeue(drop_id).await);

    let remaining: Vec<Uuid> = queue.get_queue().await.iter().map(|m| m.id).collect();
    assert_eq!(remaining, vec![keep]);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let path = std::env::temp_dir().join(format!("chat-relay-it-{}.json", Uuid::new_v4()));
    let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(&path));

    let id = {
        let queue = DeliveryQueue::restore(config(100, 3), store.clone()).await;
        let id = queue
            .enqueue(NewMessage::text("r1", "u1", "hola").max_retries(5))
            .await
            .id;
        queue.enqueue(NewMessage::text("r2", "u1", "adios")).await;
        queue.shutdown().await;
        id
    };

    let queue = DeliveryQueue::restore(config(100, 3), store).await;
    let restored = queue.get_queue().await;
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].id, id);
    assert_eq!(restored[0].max_retries, 5);
    assert_eq!(restored[1].content.as_deref(), Some("adios"));

    assert_ok!(std::fs::remove_file(&path));
}

#[tokio::test]
async fn test_unavailable_store_degrades_to_memory() {
    let store = Arc::new(MemoryStore::new());
    store.set_unavailable(true);

    let queue = DeliveryQueue::restore(config(100, 3), store.clone()).await;
    queue.enqueue(NewMessage::text("r1", "u1", "hola")).await;
    let report = queue.process_queue(&Script::new(&[true])).await;

    assert_eq!(report.sent, 1);
    assert!(queue.is_empty().await);
    assert!(store.contents().await.is_none());
}
