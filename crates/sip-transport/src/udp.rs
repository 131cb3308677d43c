//! UDP datagram transport.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use waveline_sip_core::{Message, parse_message};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportProtocol};

/// Largest datagram we will parse. RFC 3261 §18.1.1 recommends
/// switching to TCP well below this.
pub const MAX_UDP_MESSAGE: usize = 65_535;

const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// UDP transport for SIP messages.
///
/// One socket serves both directions; a background task parses
/// incoming datagrams and pushes [`TransportEvent`]s.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Bind to `addr` and start the receive loop.
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "SIP UDP transport bound");

        let transport = UdpTransport {
            inner: Arc::new(UdpInner {
                socket: Arc::new(socket),
                local_addr,
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };
        transport.spawn_receive_loop();
        Ok((transport, events_rx))
    }

    fn spawn_receive_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_MESSAGE];
            while !inner.closed.load(Ordering::Relaxed) {
                match inner.socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        // Keep-alive CRLF probes are not messages.
                        if buf[..len].iter().all(|b| matches!(b, b'\r' | b'\n')) {
                            continue;
                        }
                        match parse_message(&buf[..len]) {
                            Ok(message) => {
                                debug!(%source, len, "received SIP datagram");
                                let event = TransportEvent::MessageReceived {
                                    message,
                                    source,
                                    destination: inner.local_addr,
                                    protocol: TransportProtocol::Udp,
                                };
                                if inner.events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // Malformed input is counted and dropped.
                                warn!(%source, error = %e, "discarding unparseable datagram");
                                let _ = inner
                                    .events_tx
                                    .send(TransportEvent::Error {
                                        error: format!("parse error from {}: {}", source, e),
                                    })
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!(error = %e, "UDP receive failed");
                        let _ = inner
                            .events_tx
                            .send(TransportEvent::Error { error: format!("recv error: {}", e) })
                            .await;
                    }
                }
            }
            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop terminated");
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let wire = message.print();
        if wire.len() > MAX_UDP_MESSAGE {
            return Err(Error::MessageTooLarge(wire.len()));
        }
        let sent = self.inner.socket.send_to(&wire, destination).await?;
        debug!(%destination, len = sent, "sent SIP datagram");
        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}
