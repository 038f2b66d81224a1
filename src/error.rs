//! Error types for the Bouncer service.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bouncer operations.
#[derive(Error, Debug)]
pub enum BouncerError {
    /// A rate limit configuration has a zero attempt count or an out-of-range duration
    #[error("Invalid rate limit config: {0}")]
    ConfigInvalid(String),

    /// The counter store could not be reached or rejected the request
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A single store call exceeded the configured deadline
    #[error("Counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// A bulk reset stopped part way through its scan/delete rounds
    #[error("Bulk reset of scope '{scope}' stopped after deleting {deleted} keys: {source}")]
    PartialBatchFailure {
        scope: String,
        deleted: u64,
        #[source]
        source: Box<BouncerError>,
    },

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BouncerError {
    /// Whether the error came from the counter store rather than from the caller.
    ///
    /// Integrating services use this to pick their fail-open or fail-closed policy.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            BouncerError::StoreUnavailable(_)
                | BouncerError::Timeout(_)
                | BouncerError::PartialBatchFailure { .. }
        )
    }
}

impl From<StoreError> for BouncerError {
    fn from(err: StoreError) -> Self {
        BouncerError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for BouncerError {
    fn from(err: config::ConfigError) -> Self {
        BouncerError::Config(err.to_string())
    }
}

/// Result type alias for Bouncer operations.
pub type Result<T> = std::result::Result<T, BouncerError>;
