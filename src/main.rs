use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;

use chat_relay::chat::PoolDeliverer;
use chat_relay::config::Settings;
use chat_relay::error::AppError;
use chat_relay::metrics::encode_metrics;
use chat_relay::pool::{create_channel_factory, ConnectionPool, PoolConfig};
use chat_relay::queue::{DeliveryQueue, QueueConfig};
use chat_relay::redis::RedisPool;
use chat_relay::shutdown::GracefulShutdown;
use chat_relay::store::create_store;
use chat_relay::tasks::{AlwaysOnline, ConnectivityCheck, ConnectivityProbe, IdleSweepTask};
use chat_relay::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)
        .map_err(|e| AppError::Telemetry(e.to_string()))?;
    tracing::info!("Configuration loaded");

    let redis_pool = connect_redis(&settings)?;

    // Durable queue
    let store = create_store(&settings.store, redis_pool.clone());
    let queue_config = QueueConfig::from(&settings.queue);
    let process_interval = queue_config.process_interval;
    let queue = DeliveryQueue::restore(queue_config, store).await;

    // Connection pool
    let factory = create_channel_factory(&settings.transport, redis_pool.clone());
    let pool = ConnectionPool::new(PoolConfig::from(&settings.pool), factory);

    let deliverer = Arc::new(PoolDeliverer::new(pool.clone()));
    queue
        .start_auto_processing(deliverer.clone(), process_interval)
        .await;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Background tasks
    let sweep_task = IdleSweepTask::new(pool.clone(), shutdown_tx.subscribe());
    let sweep_handle = tokio::spawn(sweep_task.run());

    let check: Arc<dyn ConnectivityCheck> = match &redis_pool {
        Some(pool) => pool.clone(),
        None => Arc::new(AlwaysOnline),
    };
    let probe = ConnectivityProbe::new(
        check,
        queue.clone(),
        Duration::from_secs(settings.connectivity.probe_interval_secs),
        shutdown_tx.subscribe(),
    );
    let probe_handle = tokio::spawn(probe.run());

    tracing::info!(
        queued = queue.len().await,
        store = %settings.store.backend,
        transport = %settings.transport.backend,
        "Chat relay running"
    );

    wait_for_signal().await;

    let shutdown = GracefulShutdown::new(queue.clone(), pool.clone(), shutdown_tx)
        .with_deliverer(deliverer);
    let result = shutdown.execute("signal received").await;
    if !result.success {
        tracing::error!("Delivery queue could not be persisted before exit");
    }

    // Wait for background tasks to finish
    let (sweep, probe) = tokio::join!(sweep_handle, probe_handle);
    for joined in [sweep, probe] {
        if let Err(e) = joined.map_err(|e| AppError::Internal(format!("background task: {}", e))) {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }

    match encode_metrics() {
        Ok(metrics) => tracing::debug!(metrics = %metrics, "Final metrics snapshot"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }

    tracing::info!("Chat relay shutdown complete");
    Ok(())
}

/// A Redis pool is only opened when a component is configured to use it.
fn connect_redis(settings: &Settings) -> chat_relay::error::Result<Option<Arc<RedisPool>>> {
    let needs_redis = settings.store.backend == "redis" || settings.transport.backend == "redis";
    if !needs_redis {
        return Ok(None);
    }

    let pool = RedisPool::new(settings.redis.clone())?;
    tracing::info!(url = %pool.url(), "Redis pool created");
    Ok(Some(Arc::new(pool)))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
