//! Server error types.
//!
//! Only startup can fail the process. Once the server is running, I/O and
//! protocol failures are handled per connection and never surface here.

use crate::pool::PoolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while starting or stopping the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Creating a readiness set or its waker failed.
    #[error("failed to create readiness set: {0}")]
    Poll(std::io::Error),

    /// Spawning the accept or poll thread failed.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    /// Worker pool error.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
