//! Prometheus metrics for the delivery queue and connection pool.
//!
//! - Queue metrics (enqueued, evicted, sent, failures, retries, size)
//! - Durable store errors
//! - Pool metrics (handshakes, reconnects, idle teardowns, fan-out)

mod helpers;

pub use helpers::{encode_metrics, PoolMetrics, QueueMetrics, StoreMetrics};

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "chat_relay";

lazy_static! {
    // ============================================================================
    // Queue Metrics
    // ============================================================================

    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_enqueued_total", METRIC_PREFIX),
        "Total messages accepted into the delivery queue"
    ).unwrap();

    /// Messages dropped to make room for a newer one
    pub static ref QUEUE_EVICTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_evicted_total", METRIC_PREFIX),
        "Total messages evicted because the queue was full"
    ).unwrap();

    pub static ref QUEUE_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_sent_total", METRIC_PREFIX),
        "Total messages delivered and removed from the queue"
    ).unwrap();

    pub static ref QUEUE_DELIVERY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_delivery_failures_total", METRIC_PREFIX),
        "Total failed delivery attempts"
    ).unwrap();

    pub static ref QUEUE_RETRIES_SCHEDULED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_retries_scheduled_total", METRIC_PREFIX),
        "Total backoff retries scheduled"
    ).unwrap();

    /// Messages that used up their retry budget
    pub static ref QUEUE_EXHAUSTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_exhausted_total", METRIC_PREFIX),
        "Total messages that exhausted their retry budget"
    ).unwrap();

    pub static ref QUEUE_EXPIRED_ON_LOAD_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_expired_on_load_total", METRIC_PREFIX),
        "Total stale messages discarded while restoring the queue"
    ).unwrap();

    pub static ref QUEUE_SIZE: IntGauge = register_int_gauge!(
        format!("{}_queue_size", METRIC_PREFIX),
        "Messages currently held by the delivery queue"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    pub static ref STORE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Total durable store load/save failures"
    ).unwrap();

    // ============================================================================
    // Pool Metrics
    // ============================================================================

    pub static ref POOL_HANDSHAKES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_handshakes_total", METRIC_PREFIX),
        "Total channel subscription handshakes attempted"
    ).unwrap();

    pub static ref POOL_HANDSHAKE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_handshake_failures_total", METRIC_PREFIX),
        "Total failed channel subscription handshakes"
    ).unwrap();

    pub static ref POOL_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_reconnects_total", METRIC_PREFIX),
        "Total reconnects triggered by channel errors"
    ).unwrap();

    pub static ref POOL_IDLE_TEARDOWNS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_idle_teardowns_total", METRIC_PREFIX),
        "Total idle connections torn down by the sweep"
    ).unwrap();

    pub static ref POOL_EVENTS_FANNED_OUT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pool_events_fanned_out_total", METRIC_PREFIX),
        "Total subscriber callback invocations from inbound channel events"
    ).unwrap();

    pub static ref POOL_CONNECTIONS: IntGauge = register_int_gauge!(
        format!("{}_pool_connections", METRIC_PREFIX),
        "Pooled channel connections"
    ).unwrap();

    pub static ref POOL_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_pool_connections_active", METRIC_PREFIX),
        "Pooled channel connections with a completed handshake"
    ).unwrap();
}
