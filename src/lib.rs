// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules at the crate root
pub use infrastructure::backoff;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::redis;

// Core components
pub mod pool;
pub mod queue;
pub mod store;

// Composition layer
pub mod chat;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
