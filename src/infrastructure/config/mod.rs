mod settings;

pub use settings::{
    ConnectivitySettings, OtelConfig, PoolSettings, QueueSettings, RedisConfig, Settings,
    StoreSettings, TransportSettings,
};
