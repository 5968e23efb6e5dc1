//! Error types for meshfs
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for meshfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for meshfs
#[derive(Debug, Error)]
pub enum Error {
    // Network/RPC errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    // Errors reported by a storage node
    #[error("no such object: inode {inode} generation {generation}")]
    NoSuchObject { inode: u64, generation: u64 },

    #[error("storage node busy")]
    Busy,

    #[error("remote error: {0}")]
    Remote(String),

    // Node registry errors
    #[error("node not found: {0}")]
    NodeNotFound(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Busy | Self::ConnectionFailed(_) | Self::Io(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchObject { .. } | Self::NodeNotFound(_))
    }
}
