//! Error types for the relay server.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for relay server operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while starting or running the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The listener could not bind the configured address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The HTTP/WebSocket server terminated with an I/O error.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}
