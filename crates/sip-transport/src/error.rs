use std::io;

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport layer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport has been closed
    #[error("Transport closed")]
    Closed,

    /// No transport available for the requested protocol/destination
    #[error("No transport for {0}")]
    NoTransport(String),

    /// Connect to a stream peer failed
    #[error("Connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Inbound bytes could not be framed into a message
    #[error("Framing error: {0}")]
    Framing(String),

    /// Oversized message rejected before parsing
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}
