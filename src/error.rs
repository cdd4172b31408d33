//! Error types for the property cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or encoding property-cache data.
///
/// Cache lookups never fail with an `Error`: misses, transport failures and
/// rejected work are reported through [`KeyState`](crate::cache::KeyState)
/// on the lookup callback.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Key does not fit the two-byte length suffix
    #[error("Key length {len} exceeds maximum of {max} bytes")]
    KeyTooLong { len: usize, max: usize },

    /// Payload could not be decoded
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// Metrics registration failed
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Decode(err.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
