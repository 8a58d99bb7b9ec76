//! Error types for the Authlimit crate.

use thiserror::Error;

/// Main error type for Authlimit operations.
///
/// Only configuration loading can fail; rate limit outcomes are returned as
/// [`Decision`](crate::ratelimit::Decision) values, never as errors.
#[derive(Error, Debug)]
pub enum AuthLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Authlimit operations.
pub type Result<T> = std::result::Result<T, AuthLimitError>;
