//! Infrastructure layer modules
//!
//! - `backoff`: exponential and linear retry schedules
//! - `config`: application configuration and settings
//! - `error`: composition-root error type
//! - `metrics`: Prometheus metrics helpers
//! - `redis`: shared Redis connection

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
