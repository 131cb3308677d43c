//! Transport manager: owns the transports and multiplexes their
//! events into one channel for the endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use waveline_sip_core::Message;

use crate::error::{Error, Result};
use crate::tcp::TcpTransport;
use crate::transport::{Transport, TransportEvent, TransportProtocol};
use crate::udp::UdpTransport;

const MANAGER_CHANNEL_CAPACITY: usize = 200;

/// Owns all bound transports and picks one per destination.
///
/// Datagram and stream events are funnelled into a single receiver so
/// the transaction layer consumes one ordered stream.
pub struct TransportManager {
    udp: Option<Arc<UdpTransport>>,
    tcp: Option<Arc<TcpTransport>>,
}

impl TransportManager {
    /// Bind UDP and TCP on the same address.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(MANAGER_CHANNEL_CAPACITY);

        let (udp, udp_rx) = UdpTransport::bind(addr, None).await?;
        let mut tcp_addr = addr;
        tcp_addr.set_port(udp.local_addr()?.port());
        let (tcp, tcp_rx) = TcpTransport::bind(tcp_addr, None).await?;

        Self::pump(udp_rx, events_tx.clone());
        Self::pump(tcp_rx, events_tx);

        Ok((TransportManager { udp: Some(Arc::new(udp)), tcp: Some(Arc::new(tcp)) }, events_rx))
    }

    /// Bind UDP only, for datagram-only deployments and tests.
    pub async fn bind_udp(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(MANAGER_CHANNEL_CAPACITY);
        let (udp, udp_rx) = UdpTransport::bind(addr, None).await?;
        Self::pump(udp_rx, events_tx);
        Ok((TransportManager { udp: Some(Arc::new(udp)), tcp: None }, events_rx))
    }

    fn pump(mut rx: mpsc::Receiver<TransportEvent>, tx: mpsc::Sender<TransportEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Per-transport Closed events are swallowed; the
                // manager's consumers see messages and errors only.
                if matches!(event, TransportEvent::Closed) {
                    break;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    /// The transport matching a protocol.
    pub fn transport(&self, protocol: TransportProtocol) -> Result<Arc<dyn Transport>> {
        match protocol {
            TransportProtocol::Udp => self
                .udp
                .as_ref()
                .map(|t| t.clone() as Arc<dyn Transport>)
                .ok_or_else(|| Error::NoTransport("UDP".to_string())),
            TransportProtocol::Tcp => self
                .tcp
                .as_ref()
                .map(|t| t.clone() as Arc<dyn Transport>)
                .ok_or_else(|| Error::NoTransport("TCP".to_string())),
        }
    }

    /// Default transport (UDP when bound, else TCP).
    pub fn default_transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport(TransportProtocol::Udp).or_else(|_| self.transport(TransportProtocol::Tcp))
    }

    /// Local address of the default transport.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.default_transport()?.local_addr()
    }

    /// Send a message over the requested protocol.
    pub async fn send(
        &self,
        message: &Message,
        protocol: TransportProtocol,
        destination: SocketAddr,
    ) -> Result<()> {
        debug!(%protocol, %destination, "sending SIP message");
        self.transport(protocol)?.send_message(message, destination).await
    }

    /// Close every transport.
    pub async fn close(&self) -> Result<()> {
        if let Some(udp) = &self.udp {
            udp.close().await?;
        }
        if let Some(tcp) = &self.tcp {
            tcp.close().await?;
        }
        Ok(())
    }
}
