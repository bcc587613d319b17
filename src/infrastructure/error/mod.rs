use thiserror::Error;

/// Errors surfaced to the composition root.
///
/// Queue and pool operations never return these; collaborator failures inside
/// them are turned into message state or subscriber callbacks instead.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Redis error: {0}")]
    Redis(#[from] crate::redis::PoolError),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
