use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub connectivity: ConnectivitySettings,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Maximum number of messages held before the oldest is evicted
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    /// Default retry ceiling per message
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff delay after the first failed attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_factor: f64,
    /// Auto-processing interval
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,
    /// Persisted messages older than this are discarded on load
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_queue_max_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_process_interval_ms() -> u64 {
    5000
}

fn default_retention_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Subscription handshake attempts before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Linear step between handshake attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Connections without subscribers are torn down after this long
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// "memory", "file" or "redis"
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Key the serialized queue is stored under
    #[serde(default = "default_store_key")]
    pub key: String,
}

fn default_store_backend() -> String {
    "file".to_string()
}

fn default_store_path() -> String {
    "data/chat-queue.json".to_string()
}

fn default_store_key() -> String {
    "chat_message_queue".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    /// "local" or "redis"
    #[serde(default = "default_transport_backend")]
    pub backend: String,
}

fn default_transport_backend() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prefix prepended to channel names on the pub/sub transport
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_channel_prefix() -> String {
    "realtime:".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivitySettings {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_probe_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "chat-relay".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // CHAT_RELAY_QUEUE__MAX_SIZE, CHAT_RELAY_STORE__BACKEND, CHAT_RELAY_REDIS__URL, etc.
            .add_source(
                Environment::with_prefix("CHAT_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: 0.0,
            process_interval_ms: default_process_interval_ms(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            key: default_store_key(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            backend: default_transport_backend(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            channel_prefix: default_channel_prefix(),
        }
    }
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
