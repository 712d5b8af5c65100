//! Error types shared by the stores and the metering engine.

/// The durable store is unreachable or returned something unusable.
///
/// Fatal to the requested operation; never retried internally.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt stored record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A stored setting failed to parse as its expected type.
///
/// Callers substitute the documented default and carry on.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("setting '{key}' has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// An outbound notification could not be delivered.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("notification channel not configured: {0}")]
    NotConfigured(String),
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification rejected with status {0}")]
    Status(u16),
}
