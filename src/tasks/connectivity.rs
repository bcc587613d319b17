use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::queue::DeliveryQueue;
use crate::redis::RedisPool;

/// Upper bound on a single probe
const PROBE_TIMEOUT_MS: u64 = 3000;

/// Answers whether the real-time backend is reachable.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// In-process transport: always reachable.
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityCheck for AlwaysOnline {
    async fn is_reachable(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConnectivityCheck for RedisPool {
    async fn is_reachable(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Redis ping failed");
                false
            }
        }
    }
}

/// Background task feeding the delivery queue's online flag.
///
/// The queue drains as soon as the flag flips back to online.
pub struct ConnectivityProbe {
    check: Arc<dyn ConnectivityCheck>,
    queue: DeliveryQueue,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ConnectivityProbe {
    pub fn new(
        check: Arc<dyn ConnectivityCheck>,
        queue: DeliveryQueue,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            check,
            queue,
            interval,
            shutdown,
        }
    }

    /// Probe once and update the queue. Returns the probe result.
    pub async fn probe(&self) -> bool {
        let reachable = timeout(
            Duration::from_millis(PROBE_TIMEOUT_MS),
            self.check.is_reachable(),
        )
        .await
        .unwrap_or(false);

        if reachable != self.queue.is_online() {
            if reachable {
                tracing::info!("Backend reachable again");
            } else {
                tracing::warn!("Backend unreachable, delivery paused");
            }
        }
        self.queue.set_online(reachable);
        reachable
    }

    pub async fn run(mut self) {
        let mut probe_timer = tokio::time::interval(self.interval);

        tracing::info!(
            probe_interval_secs = self.interval.as_secs(),
            "Connectivity probe started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Connectivity probe received shutdown signal");
                    break;
                }
                _ = probe_timer.tick() => {
                    self.probe().await;
                }
            }
        }

        tracing::info!("Connectivity probe stopped");
    }
}
