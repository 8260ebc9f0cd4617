//! Error types for Tapwire

use std::io;
use thiserror::Error;

/// Result type for Tapwire operations
pub type Result<T> = std::result::Result<T, TapwireError>;

/// Boxed error used for HTTP body streams
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in Tapwire
#[derive(Debug, Error)]
pub enum TapwireError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A record or exchange was asked to make a transition it does not allow
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Forwarding call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Record could not be serialized or parsed by a store
    #[error("Store error: {0}")]
    Store(String),
}

/// Failures reported by a forwarding call
///
/// The `Display` output is the human-readable description stored in a
/// failed record, so it must stand on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request could not be built or sent
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP-level failure after the connection was up
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reading the response body failed
    #[error("response body error: {0}")]
    Body(String),

    /// Redirect chain exceeded the configured limit
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),

    /// The forwarding session became unusable
    #[error("session invalidated: {0}")]
    Invalidated(String),

    /// Call was cancelled by the caller or the dispatch layer
    #[error("cancelled")]
    Cancelled,
}
