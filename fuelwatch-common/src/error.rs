//! Common error types for fuelwatch

use thiserror::Error;

/// Common result type for fuelwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the fuelwatch services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed feed line or payload field
    #[error("Parse error: {0}")]
    Parse(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by a single bad input line or file name.
    ///
    /// Batch loops skip these and continue; storage errors abort the tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::InvalidInput(_) | Error::NotFound(_)
        )
    }
}
