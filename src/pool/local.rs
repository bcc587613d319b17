//! In-process channel transport.
//!
//! Handles created by the same factory with the same name share events. A
//! handle never receives the events it sent itself.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::channel::{ChannelError, ChannelFactory, ChannelHandle, EventHandler};
use super::types::ChannelEvent;

const TOPIC_CAPACITY: usize = 256;

/// Origin id used for events injected through [`LocalChannelFactory::publish`]
const EXTERNAL_ORIGIN: u64 = 0;

#[derive(Default)]
struct Topic {
    sender: Option<broadcast::Sender<(u64, ChannelEvent)>>,
    /// Handshakes that will fail before one succeeds
    failures_left: u32,
    /// Successful handshakes
    subscriptions: usize,
    /// Handshakes that never complete
    stalled: bool,
}

struct Broker {
    topics: DashMap<String, Topic>,
    next_origin: AtomicU64,
}

impl Broker {
    fn sender(&self, name: &str) -> broadcast::Sender<(u64, ChannelEvent)> {
        let mut topic = self.topics.entry(name.to_string()).or_default();
        topic
            .sender
            .get_or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

/// In-process broker and channel factory.
#[derive(Clone)]
pub struct LocalChannelFactory {
    broker: Arc<Broker>,
    created: Arc<AtomicUsize>,
}

impl LocalChannelFactory {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                topics: DashMap::new(),
                next_origin: AtomicU64::new(EXTERNAL_ORIGIN + 1),
            }),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver an event to every subscribed handle of `name`.
    /// Returns the number of handles reached.
    pub fn publish(&self, name: &str, event: ChannelEvent) -> usize {
        self.broker
            .sender(name)
            .send((EXTERNAL_ORIGIN, event))
            .unwrap_or(0)
    }

    /// Make the next `count` handshakes on `name` fail.
    pub fn fail_next_subscribes(&self, name: &str, count: u32) {
        self.broker
            .topics
            .entry(name.to_string())
            .or_default()
            .failures_left = count;
    }

    /// Make handshakes on `name` hang (or stop hanging).
    pub fn stall_subscribes(&self, name: &str, stalled: bool) {
        self.broker
            .topics
            .entry(name.to_string())
            .or_default()
            .stalled = stalled;
    }

    /// Successful handshakes performed on `name`.
    pub fn subscription_count(&self, name: &str) -> usize {
        self.broker
            .topics
            .get(name)
            .map(|t| t.subscriptions)
            .unwrap_or(0)
    }

    /// Handles created so far, across all names.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Handles currently receiving events on `name`.
    pub fn receiver_count(&self, name: &str) -> usize {
        self.broker
            .topics
            .get(name)
            .and_then(|t| t.sender.as_ref().map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

impl Default for LocalChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for LocalChannelFactory {
    fn create(&self, name: &str) -> Arc<dyn ChannelHandle> {
        self.created.fetch_add(1, Ordering::Relaxed);
        let origin = self.broker.next_origin.fetch_add(1, Ordering::Relaxed);

        Arc::new(LocalChannel {
            name: name.to_string(),
            origin,
            broker: self.broker.clone(),
            task: Mutex::new(None),
        })
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

struct LocalChannel {
    name: String,
    origin: u64,
    broker: Arc<Broker>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalChannel {
    /// Outcome of a handshake as dictated by the topic's injected behavior.
    fn handshake(&self) -> Result<bool, ChannelError> {
        let mut topic = self.broker.topics.entry(self.name.clone()).or_default();
        if topic.stalled {
            return Ok(false);
        }
        if topic.failures_left > 0 {
            topic.failures_left -= 1;
            return Err(ChannelError::SubscribeFailed(format!(
                "{} rejected subscription",
                self.name
            )));
        }
        topic.subscriptions += 1;
        Ok(true)
    }
}

#[async_trait]
impl ChannelHandle for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, handler: EventHandler) -> Result<(), ChannelError> {
        if !self.handshake()? {
            std::future::pending::<()>().await;
        }

        let mut receiver = self.broker.sender(&self.name).subscribe();
        let origin = self.origin;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok((from, _)) if from == origin => {}
                    Ok((_, event)) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %name, skipped = skipped, "Local channel lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        if self.task.lock().await.is_none() {
            return Err(ChannelError::NotConnected(self.name.clone()));
        }
        // No other subscriber is not an error
        let _ = self.broker.sender(&self.name).send((self.origin, event));
        Ok(())
    }

    async fn unsubscribe(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}
