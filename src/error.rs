//! Error types for the weft client

use thiserror::Error;

/// Errors that can occur when using the weft client
#[derive(Error, Debug)]
pub enum WeftError {
    /// Transport-level failure (connect, publish, subscribe, I/O)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Not currently connected to any broker
    #[error("Not connected")]
    NotConnected,

    /// No matching response arrived within the caller's timeout
    #[error("Timeout waiting for response to message: {0}")]
    Timeout(String),

    /// The client has been shut down
    #[error("Client shut down")]
    Shutdown,

    /// Malformed wire data or broker descriptor
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The fabric rejected a service registration or unregistration
    #[error("Service registration error: {message} (code {code})")]
    ServiceRegistration { code: i32, message: String },

    /// Failed to serialize/deserialize a JSON payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The API was invoked in a way that can never succeed
    #[error("Invalid usage: {0}")]
    Usage(String),
}

/// Result type for weft client operations
pub type Result<T> = std::result::Result<T, WeftError>;
