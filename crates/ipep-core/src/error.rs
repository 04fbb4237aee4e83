//! Error types for the endpoint provider
//!
//! Every entry point of the provider reports failures through [`Error`].
//! Validation failures (`InvalidKey`, `InvalidTransition`, `KeyImmutable`,
//! `InvalidProperty`) are always raised before any state is touched.

use crate::model::AdminStatus;
use thiserror::Error;

/// Result type alias for provider operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the endpoint provider
#[derive(Error, Debug)]
pub enum Error {
    /// No instance exists for the key (or it has been deleted)
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// A live instance already exists for the key
    #[error("Instance already exists: {0}")]
    AlreadyExists(String),

    /// Key properties are missing or malformed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The request tried to change a key property
    #[error("Key properties are immutable: {0}")]
    KeyImmutable(String),

    /// Requested administrative transition is not allowed
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current administrative status
        from: AdminStatus,
        /// Requested administrative status
        to: AdminStatus,
    },

    /// Optimistic concurrency mismatch or overlapping state-change job.
    /// Safe to retry after re-reading current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The host endpoint inventory could not be read
    #[error("Endpoint source unavailable: {0}")]
    SourceUnavailable(String),

    /// Deadline elapsed before the operation was confirmed
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// Operation was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unexpected host primitive failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// A property value is malformed or not writable
    #[error("Invalid property: {0}")]
    InvalidProperty(String),

    /// The backend does not support the requested operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an "already exists" error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create a key immutability error
    pub fn key_immutable(msg: impl Into<String>) -> Self {
        Self::KeyImmutable(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a source unavailable error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid property error
    pub fn invalid_property(msg: impl Into<String>) -> Self {
        Self::InvalidProperty(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller may retry after re-reading current state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::SourceUnavailable(_))
    }

    /// Whether this error was raised by request validation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey(_)
                | Self::KeyImmutable(_)
                | Self::InvalidTransition { .. }
                | Self::InvalidProperty(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
