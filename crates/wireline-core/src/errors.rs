//! Error types for the Wireline client
//!
//! This module contains all error types used throughout the Wireline core,
//! including transport errors, protocol errors, validation errors, storage
//! errors, and the main WirelineError type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
    #[error("Connection closed: {reason}")]
    Closed { reason: String },
}

/// Errors in the JSON-RPC exchange with the daemon
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The daemon answered with an error object instead of a result.
    #[error("Daemon error {code}: {message}")]
    Daemon { code: i64, message: String },
    #[error("Malformed response: {reason}")]
    MalformedResponse { reason: String },
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    #[error("Unexpected result shape for {method}: {reason}")]
    UnexpectedResult { method: String, reason: String },
}

/// Validation errors raised at the API boundary
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid identity {value:?}: expected a +number or a UUID")]
    InvalidIdentity { value: String },
    #[error("Invalid typing action {action:?}: expected STARTED or STOPPED")]
    InvalidTypingAction { action: String },
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

/// Snapshot persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to write snapshot {name}: {source}")]
    SaveFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode snapshot {name}: {source}")]
    EncodeFailed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Message store reconciliation errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No reaction from {sender} to remove")]
    ReactionNotFound { sender: String },
    #[error("Message ({author}, {timestamp}) not found")]
    MessageNotFound { author: String, timestamp: u64 },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Wireline client
#[derive(Debug, thiserror::Error)]
pub enum WirelineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel communication error (internal to the dispatcher architecture)
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl WirelineError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        WirelineError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        WirelineError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a daemon error from a JSON-RPC error object
    pub fn daemon_error<T: Into<String>>(code: i64, message: T) -> Self {
        WirelineError::Protocol(ProtocolError::Daemon {
            code,
            message: message.into(),
        })
    }

    /// Create a malformed response error
    pub fn malformed_response<T: Into<String>>(reason: T) -> Self {
        WirelineError::Protocol(ProtocolError::MalformedResponse {
            reason: reason.into(),
        })
    }

    /// Create a malformed envelope error
    pub fn malformed_envelope<T: Into<String>>(reason: T) -> Self {
        WirelineError::Protocol(ProtocolError::MalformedEnvelope {
            reason: reason.into(),
        })
    }

    /// Create an invalid identity error
    pub fn invalid_identity<T: Into<String>>(value: T) -> Self {
        WirelineError::Validation(ValidationError::InvalidIdentity {
            value: value.into(),
        })
    }

    /// Create an invalid argument error
    pub fn invalid_argument<T: Into<String>>(reason: T) -> Self {
        WirelineError::Validation(ValidationError::InvalidArgument {
            reason: reason.into(),
        })
    }

    /// Create a connection failed error
    pub fn connection_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        WirelineError::Transport(TransportError::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        })
    }

    /// True when the error is a daemon-reported RPC error, which callers
    /// may recover from locally.
    pub fn is_daemon_error(&self) -> bool {
        matches!(
            self,
            WirelineError::Protocol(ProtocolError::Daemon { .. })
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, WirelineError>;
