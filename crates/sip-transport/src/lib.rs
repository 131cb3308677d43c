//! SIP transport layer for the waveline stack.
//!
//! Provides the [`Transport`] trait plus UDP datagram and TCP stream
//! implementations, and a [`TransportManager`] that owns the sockets
//! and multiplexes their receive events into one channel.

pub mod error;
pub mod manager;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use error::{Error, Result};
pub use manager::TransportManager;
pub use tcp::{StreamFramer, TcpTransport};
pub use transport::{Transport, TransportEvent, TransportProtocol};
pub use udp::UdpTransport;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Error, Result, StreamFramer, TcpTransport, Transport, TransportEvent, TransportManager,
        TransportProtocol, UdpTransport,
    };
}
