//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    POOL_CONNECTIONS, POOL_CONNECTIONS_ACTIVE, POOL_EVENTS_FANNED_OUT_TOTAL,
    POOL_HANDSHAKES_TOTAL, POOL_HANDSHAKE_FAILURES_TOTAL, POOL_IDLE_TEARDOWNS_TOTAL,
    POOL_RECONNECTS_TOTAL, QUEUE_DELIVERY_FAILURES_TOTAL, QUEUE_ENQUEUED_TOTAL,
    QUEUE_EVICTED_TOTAL, QUEUE_EXHAUSTED_TOTAL, QUEUE_EXPIRED_ON_LOAD_TOTAL,
    QUEUE_RETRIES_SCHEDULED_TOTAL, QUEUE_SENT_TOTAL, QUEUE_SIZE, STORE_ERRORS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording delivery queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued() {
        QUEUE_ENQUEUED_TOTAL.inc();
    }

    pub fn record_evicted() {
        QUEUE_EVICTED_TOTAL.inc();
    }

    pub fn record_sent() {
        QUEUE_SENT_TOTAL.inc();
    }

    pub fn record_failure() {
        QUEUE_DELIVERY_FAILURES_TOTAL.inc();
    }

    pub fn record_retry_scheduled() {
        QUEUE_RETRIES_SCHEDULED_TOTAL.inc();
    }

    pub fn record_exhausted() {
        QUEUE_EXHAUSTED_TOTAL.inc();
    }

    pub fn record_expired_on_load(count: u64) {
        QUEUE_EXPIRED_ON_LOAD_TOTAL.inc_by(count);
    }

    /// Update the queue size gauge
    pub fn set_size(size: usize) {
        QUEUE_SIZE.set(size as i64);
    }
}

/// Helper struct for durable store metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_error() {
        STORE_ERRORS_TOTAL.inc();
    }
}

/// Helper struct for recording connection pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    pub fn record_handshake() {
        POOL_HANDSHAKES_TOTAL.inc();
    }

    pub fn record_handshake_failure() {
        POOL_HANDSHAKE_FAILURES_TOTAL.inc();
    }

    pub fn record_reconnect() {
        POOL_RECONNECTS_TOTAL.inc();
    }

    pub fn record_idle_teardown() {
        POOL_IDLE_TEARDOWNS_TOTAL.inc();
    }

    pub fn record_fanned_out(count: u64) {
        POOL_EVENTS_FANNED_OUT_TOTAL.inc_by(count);
    }

    /// Update connection gauges
    pub fn set_connections(total: usize, active: usize) {
        POOL_CONNECTIONS.set(total as i64);
        POOL_CONNECTIONS_ACTIVE.set(active as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_includes_prefix() {
        QueueMetrics::record_enqueued();
        PoolMetrics::set_connections(2, 1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("chat_relay_queue_enqueued_total"));
        assert!(output.contains("chat_relay_pool_connections_active"));
    }
}
