//! Error taxonomy for the client engine.
//!
//! Usage violations (wrong call order, read-only writes, nested transactions)
//! are returned synchronously and never retried. Network failures on the
//! durable push path are retried inside the adapter and never reach callers;
//! on best-effort paths they are logged.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by the session, collections, transactions and adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A session is already active on this coordinator.
    #[error("a session is already connected")]
    AlreadyConnected,

    /// The session has been closed.
    #[error("session is closed")]
    SessionClosed,

    /// The collection has been closed.
    #[error("collection is closed")]
    CollectionClosed,

    /// A collection is already open in this session.
    #[error("collection {0:?} is already open")]
    CollectionAlreadyOpen(String),

    /// The call is not allowed while a transaction is active.
    #[error("a transaction is in progress")]
    TransactionInProgress,

    /// A write was attempted on something opened read-only.
    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),

    /// An object was reopened with a different writability mode.
    #[error("object {0} is already open with a different mode")]
    ConflictingMode(String),

    /// The reference or identifier is not managed by any open collection.
    #[error("object is not managed by an open collection")]
    NotManaged,

    /// The operation is acknowledged but not supported by this engine.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Transport failure talking to the remote service.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the call can be retried.
        retryable: bool,
    },

    /// Payload or identifier could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A realtime frame violated the channel protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No factory is registered for the type tag.
    #[error("unknown object type {0:?}")]
    UnknownType(String),

    /// Two values of different replicated types met.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type the caller asked for.
        expected: String,
        /// Type actually stored.
        found: String,
    },

    /// No tokio runtime is available, or a spawned task failed.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ClientError {
    /// Creates a retryable network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a network error that retrying will not fix.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network { retryable: true, .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Codec(e.to_string())
    }
}
