use std::time::Duration;

use tokio::sync::broadcast;

use crate::pool::ConnectionPool;

/// Background task reclaiming idle pooled connections
pub struct IdleSweepTask {
    pool: ConnectionPool,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl IdleSweepTask {
    pub fn new(pool: ConnectionPool, shutdown: broadcast::Receiver<()>) -> Self {
        let interval = pool.config().sweep_interval;
        Self {
            pool,
            interval,
            shutdown,
        }
    }

    /// Run until the shutdown signal
    pub async fn run(mut self) {
        let mut sweep_timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        sweep_timer.tick().await;

        tracing::info!(
            sweep_interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.pool.config().idle_timeout.as_secs(),
            "Idle sweep task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Idle sweep task received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    let removed = self.pool.sweep_idle().await;
                    if removed > 0 {
                        let stats = self.pool.stats();
                        tracing::info!(
                            removed = removed,
                            remaining = stats.total_connections,
                            active = stats.active_connections,
                            "Idle sweep completed"
                        );
                    }
                }
            }
        }

        tracing::info!("Idle sweep task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{
        ConnectionStatus, LocalChannelFactory, PoolConfig, SubscriberCallbacks,
    };
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_on_interval_until_shutdown() {
        let config = PoolConfig {
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(config, Arc::new(LocalChannelFactory::new()));
        pool.subscribe("c", "a", SubscriberCallbacks::new()).await;
        pool.unsubscribe("c", "a");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(IdleSweepTask::new(pool.clone(), shutdown_rx).run());
        settle().await;

        // Sweeps at 10s, 20s and 30s keep it: idle for exactly 30s is not past the timeout
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Connected);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(pool.get_connection_status("c"), ConnectionStatus::Disconnected);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
