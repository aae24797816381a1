//! Error types for the costwindow service.

use thiserror::Error;

/// Main error type for costwindow operations.
#[derive(Error, Debug)]
pub enum CostWindowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A window length that cannot be used for rate limiting
    #[error("Invalid window size: {0} seconds")]
    InvalidWindow(i64),

    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for CostWindowError {
    fn from(err: config::ConfigError) -> Self {
        CostWindowError::Config(err.to_string())
    }
}

/// Result type alias for costwindow operations.
pub type Result<T> = std::result::Result<T, CostWindowError>;
