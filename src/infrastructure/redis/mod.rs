//! Redis connectivity shared by the Redis durable store and the Redis channel
//! transport.

pub mod pool;

pub use pool::{PoolError, RedisPool};
