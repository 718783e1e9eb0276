//! Error types for Beambox.
//!
//! This module provides a unified error type for all Beambox operations.
//! The variants follow the protocol stack's failure taxonomy: framing,
//! transport, timeout, state, version and remote application errors.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Beambox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Beambox.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A frame could not be decoded
    #[error("malformed frame: {0}")]
    Framing(String),

    /// Socket failure or the connection closed underneath an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// No response arrived within the retry budget
    #[error("request type {message_type} timed out after {waited_ms} ms")]
    Timeout {
        /// Request message type
        message_type: i32,
        /// Total time waited, including the retransmission
        waited_ms: u64,
    },

    /// Operation attempted outside its valid state
    #[error("invalid state: {0}")]
    State(String),

    /// Peer speaks a different protocol version
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Local protocol version
        local: i32,
        /// Remote protocol version
        remote: i32,
    },

    /// Peer explicitly reported a failure
    #[error("remote error: {0}")]
    RemoteApplication(String),

    /// Operation was cancelled locally
    #[error("cancelled")]
    Cancelled,

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// File exists but cannot be transferred
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. } | Self::Io(_))
    }

    /// Returns whether this error forces the owning connection or session
    /// into its terminal state.
    ///
    /// `State` errors never do: they reject a single call only.
    #[must_use]
    pub const fn is_teardown(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::Transport(_) | Self::Io(_))
    }
}
