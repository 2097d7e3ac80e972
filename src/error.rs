//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store failed or could not be reached
    #[error("Store error during {op} for key {key}: {source}")]
    Store {
        /// The store operation that failed
        op: &'static str,
        /// The key the operation addressed
        key: String,
        /// The underlying client error
        #[source]
        source: redis::RedisError,
    },

    /// A persisted value could not be parsed as the expected scalar
    #[error("Malformed value {value:?} stored at key {key}")]
    MalformedValue {
        /// The key holding the value
        key: String,
        /// The raw stored content
        value: String,
    },

    /// The caller cancelled the call before it completed
    #[error("Rate limit check cancelled")]
    Cancelled,

    /// The caller's deadline passed before the call completed
    #[error("Rate limit check exceeded its deadline")]
    DeadlineExceeded,

    /// Optimistic updates kept losing to concurrent writers
    #[error("Too much contention updating key {key}")]
    Contention {
        /// The contended key
        key: String,
    },

    /// No client identity could be derived from the request
    #[error("Key extraction error: {0}")]
    KeyExtraction(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Wrap a store client error with the operation and key it concerned.
    pub fn store(op: &'static str, key: &str, source: redis::RedisError) -> Self {
        TurnstileError::Store {
            op,
            key: key.to_string(),
            source,
        }
    }

    /// Build a malformed-value error for the given key.
    pub fn malformed(key: &str, value: impl Into<String>) -> Self {
        TurnstileError::MalformedValue {
            key: key.to_string(),
            value: value.into(),
        }
    }

    /// Whether this error came from cancellation or a deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TurnstileError::Cancelled | TurnstileError::DeadlineExceeded
        )
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
