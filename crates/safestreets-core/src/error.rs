//! Error types for the SafeStreets realtime layer.

use thiserror::Error;

/// Result type alias using the realtime layer's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for realtime operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Credential or session verification failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Authenticated but not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Backplane (pub/sub or mirror store) operation failed
    #[error("Backplane error: {0}")]
    Backplane(String),

    /// Downstream document/device store query failed
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection is not registered with this process
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
