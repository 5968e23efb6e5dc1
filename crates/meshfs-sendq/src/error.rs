//! Send queue error types

use meshfs_common::NodeId;
use thiserror::Error;

/// Send queue error
///
/// `Unreachable` and `ConnectionAborted` are synthesized by the queue itself;
/// everything a transport reports arrives unchanged as `Transport`.
#[derive(Error, Debug)]
pub enum SendqError {
    /// Destination was known to be down at enqueue or dispatch time
    #[error("no route to host: {0}")]
    Unreachable(NodeId),

    /// Destination went down while the work was queued
    #[error("connection aborted: {0}")]
    ConnectionAborted(NodeId),

    /// Error returned by the message class send callback
    #[error(transparent)]
    Transport(#[from] meshfs_common::Error),

    /// Class id not present in the class table
    #[error("unknown message class: {0}")]
    UnknownClass(usize),

    /// Rejected while building the class table
    #[error("invalid message class: {0}")]
    InvalidClass(String),

    /// The send queue is shutting down
    #[error("send queue is shut down")]
    Shutdown,
}

impl SendqError {
    /// True for the errors the queue produces when a destination is down
    #[must_use]
    pub const fn is_host_down(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::ConnectionAborted(_))
    }
}

/// Outcome delivered to a finalize callback
pub type Outcome = Result<(), SendqError>;

/// Result type for send queue operations
pub type SendqResult<T> = Result<T, SendqError>;

/// A refused enqueue
///
/// `payload` is handed back unless the rejection was already routed to the
/// class finalize callback (detached error handling).
#[derive(Debug)]
pub struct Rejected<P> {
    pub error: SendqError,
    pub payload: Option<P>,
}

impl<P> Rejected<P> {
    pub(crate) const fn new(error: SendqError, payload: Option<P>) -> Self {
        Self { error, payload }
    }

    /// Take the payload back, if the caller still owns it
    pub fn into_payload(self) -> Option<P> {
        self.payload
    }
}

impl<P> std::fmt::Display for Rejected<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "enqueue rejected: {}", self.error)
    }
}
