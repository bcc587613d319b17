//! Graceful shutdown handling for the chat relay.
//!
//! Shutdown runs in order:
//! 1. Signal background tasks (idle sweep, connectivity probe) to stop
//! 2. Make a last delivery attempt for queued messages while still online
//! 3. Stop auto-processing, cancel retry timers and persist the queue
//! 4. Unsubscribe every pooled channel

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::pool::ConnectionPool;
use crate::queue::{DeliveryQueue, MessageDeliverer};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for the final delivery attempt (default: 5 seconds)
    pub drain_timeout: Duration,
    /// Time allowed for the final queue persist (default: 5 seconds)
    pub persist_timeout: Duration,
    /// Time allowed for unsubscribing pooled channels (default: 5 seconds)
    pub pool_cleanup_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            persist_timeout: Duration::from_secs(5),
            pool_cleanup_timeout: Duration::from_secs(5),
        }
    }
}

/// Handles graceful shutdown of the chat relay
pub struct GracefulShutdown {
    queue: DeliveryQueue,
    pool: ConnectionPool,
    deliverer: Option<Arc<dyn MessageDeliverer>>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        queue: DeliveryQueue,
        pool: ConnectionPool,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(queue, pool, shutdown_tx, ShutdownConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(
        queue: DeliveryQueue,
        pool: ConnectionPool,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            deliverer: None,
            shutdown_tx,
            config,
        }
    }

    /// Deliverer used for the final delivery attempt. Without one, queued
    /// messages are only persisted.
    pub fn with_deliverer(mut self, deliverer: Arc<dyn MessageDeliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(pooled_connections = self.pool.connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Final delivery attempt");
        result.messages_delivered = self.final_drain().await;

        tracing::info!("Phase 3: Persisting delivery queue");
        result.queue_persisted = timeout(self.config.persist_timeout, self.queue.shutdown())
            .await
            .is_ok();
        if !result.queue_persisted {
            tracing::warn!("Queue persist timed out");
        }
        result.messages_remaining = self.queue.len().await;

        tracing::info!("Phase 4: Closing pooled connections");
        match timeout(self.config.pool_cleanup_timeout, self.pool.cleanup()).await {
            Ok(closed) => result.connections_closed = closed,
            Err(_) => tracing::warn!("Pool cleanup timed out"),
        }

        result.duration = start.elapsed();
        result.success = result.queue_persisted;

        tracing::info!(
            messages_delivered = result.messages_delivered,
            messages_remaining = result.messages_remaining,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    async fn final_drain(&self) -> usize {
        let Some(deliverer) = &self.deliverer else {
            return 0;
        };
        if !self.queue.is_online() || self.queue.is_empty().await {
            return 0;
        }

        match timeout(
            self.config.drain_timeout,
            self.queue.process_queue(deliverer.as_ref()),
        )
        .await
        {
            Ok(report) => report.sent,
            Err(_) => {
                tracing::warn!("Final delivery attempt timed out, remaining messages stay persisted");
                0
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether the queue was persisted in time
    pub success: bool,
    /// Messages delivered by the final attempt
    pub messages_delivered: usize,
    /// Messages left in the persisted queue
    pub messages_remaining: usize,
    pub queue_persisted: bool,
    pub connections_closed: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
