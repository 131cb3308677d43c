//! The `Transport` trait and the events every transport emits.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use waveline_sip_core::Message;

use crate::error::Result;

/// Wire protocol of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by transports toward the transaction layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete SIP message arrived.
    MessageReceived {
        message: Message,
        source: SocketAddr,
        destination: SocketAddr,
        protocol: TransportProtocol,
    },
    /// Something failed; the transport may still be usable.
    Error { error: String },
    /// The transport shut down; no further events follow.
    Closed,
}

/// A bidirectional SIP packet channel.
///
/// Transports are shared behind `Arc`; they stay alive while any
/// transaction or dialog still holds a reference, and close when the
/// last clone is dropped or `close()` is called.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Local address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Serialise and send a message to `destination`.
    async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<()>;

    /// Wire protocol.
    fn protocol(&self) -> TransportProtocol;

    /// Reliable transports skip the retransmit timers (RFC 3261
    /// §17.1.1.2).
    fn is_reliable(&self) -> bool {
        self.protocol() != TransportProtocol::Udp
    }

    /// Stop the rx loop and release the socket.
    async fn close(&self) -> Result<()>;
}
