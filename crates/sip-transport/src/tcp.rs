//! TCP stream transport with Content-Length framing.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use waveline_sip_core::{Message, parse_message};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportProtocol};

/// Upper bound on a single framed message over a stream.
pub const MAX_STREAM_MESSAGE: usize = 256 * 1024;

const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Reassembles SIP messages from a byte stream.
///
/// A message is complete when the head is terminated by an empty line
/// and `Content-Length` further bytes have arrived (zero when the
/// header is absent, per RFC 3261 §18.3 for streams the header is
/// mandatory, but we tolerate its absence as an empty body).
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        StreamFramer { buf: BytesMut::new() }
    }

    /// Feed received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to extract the next complete message.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        // Swallow leading CRLF keep-alives.
        while self.buf.first().map(|b| *b == b'\r' || *b == b'\n').unwrap_or(false) {
            // Only strip when they precede the start line, i.e. the
            // buffer does not yet look like a message in progress.
            if self.buf.len() >= 4 && !self.buf.starts_with(b"\r\n") && !self.buf.starts_with(b"\n")
            {
                break;
            }
            self.buf.advance(1);
        }

        let Some(head_len) = find_head_end(&self.buf) else {
            if self.buf.len() > MAX_STREAM_MESSAGE {
                return Err(Error::MessageTooLarge(self.buf.len()));
            }
            return Ok(None);
        };

        let content_length = scan_content_length(&self.buf[..head_len])?;
        let total = head_len + content_length;
        if total > MAX_STREAM_MESSAGE {
            return Err(Error::MessageTooLarge(total));
        }
        if self.buf.len() < total {
            return Ok(None);
        }

        let wire = self.buf.split_to(total);
        let message =
            parse_message(&wire).map_err(|e| Error::Framing(format!("bad framed message: {}", e)))?;
        Ok(Some(message))
    }
}

/// Offset one past the CRLFCRLF closing the head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Pull Content-Length (or compact `l`) out of raw head bytes.
fn scan_content_length(head: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Framing("head is not valid UTF-8".to_string()))?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse()
                .map_err(|_| Error::Framing(format!("bad Content-Length: {}", value.trim())));
        }
    }
    Ok(0)
}

struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

/// TCP transport: a listener plus a table of live connections, each
/// with its own framer and read task. Outbound sends reuse an existing
/// connection to the destination or dial a new one.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    local_addr: SocketAddr,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl TcpTransport {
    /// Bind a listener on `addr` and start accepting.
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "SIP TCP transport bound");

        let transport = TcpTransport {
            inner: Arc::new(TcpInner {
                local_addr,
                connections: DashMap::new(),
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };

        let accept_inner = transport.inner.clone();
        tokio::spawn(async move {
            loop {
                if accept_inner.closed.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted TCP connection");
                        TcpTransport::adopt_stream(&accept_inner, stream, peer);
                    }
                    Err(e) => {
                        if accept_inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!(error = %e, "TCP accept failed");
                    }
                }
            }
            let _ = accept_inner.events_tx.send(TransportEvent::Closed).await;
        });

        Ok((transport, events_rx))
    }

    /// Register a connected stream and spawn its read loop.
    fn adopt_stream(inner: &Arc<TcpInner>, stream: TcpStream, peer: SocketAddr) {
        let (mut read_half, write_half) = stream.into_split();
        let connection = Arc::new(Connection { writer: Mutex::new(write_half), peer });
        inner.connections.insert(peer, connection);

        let inner = inner.clone();
        tokio::spawn(async move {
            let mut framer = StreamFramer::new();
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        framer.push(&buf[..n]);
                        loop {
                            match framer.next_message() {
                                Ok(Some(message)) => {
                                    let event = TransportEvent::MessageReceived {
                                        message,
                                        source: peer,
                                        destination: inner.local_addr,
                                        protocol: TransportProtocol::Tcp,
                                    };
                                    if inner.events_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // Stream is out of sync; drop it.
                                    warn!(%peer, error = %e, "closing TCP connection after framing error");
                                    inner.connections.remove(&peer);
                                    let _ = inner
                                        .events_tx
                                        .send(TransportEvent::Error {
                                            error: format!("framing error from {}: {}", peer, e),
                                        })
                                        .await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "TCP read ended");
                        break;
                    }
                }
            }
            inner.connections.remove(&peer);
            debug!(%peer, "TCP connection closed");
        });
    }

    async fn connection_for(&self, destination: SocketAddr) -> Result<Arc<Connection>> {
        if let Some(existing) = self.inner.connections.get(&destination) {
            return Ok(existing.value().clone());
        }
        let stream = TcpStream::connect(destination)
            .await
            .map_err(|source| Error::ConnectFailed { addr: destination, source })?;
        let peer = stream.peer_addr()?;
        TcpTransport::adopt_stream(&self.inner, stream, peer);
        self.inner
            .connections
            .get(&peer)
            .map(|c| c.value().clone())
            .ok_or(Error::Closed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let connection = self.connection_for(destination).await?;
        let wire = message.print();
        let mut writer = connection.writer.lock().await;
        writer.write_all(&wire).await?;
        debug!(peer = %connection.peer, len = wire.len(), "sent framed SIP message");
        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.connections.clear();
        Ok(())
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &str = "OPTIONS sip:b@b.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP a.com;branch=z9hG4bK77\r\nMax-Forwards: 70\r\n\
        To: <sip:b@b.com>\r\nFrom: <sip:a@a.com>;tag=1\r\n\
        Call-ID: c1\r\nCSeq: 1 OPTIONS\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn framer_handles_split_delivery() {
        let mut framer = StreamFramer::new();
        let bytes = REQ.as_bytes();
        let (a, b) = bytes.split_at(40);
        framer.push(a);
        assert!(framer.next_message().unwrap().is_none());
        framer.push(b);
        let msg = framer.next_message().unwrap().unwrap();
        assert_eq!(msg.as_request().unwrap().body.as_ref(), b"hello");
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn framer_handles_back_to_back_messages() {
        let mut framer = StreamFramer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(REQ.as_bytes());
        wire.extend_from_slice(REQ.as_bytes());
        framer.push(&wire);
        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn framer_skips_keepalive_crlf() {
        let mut framer = StreamFramer::new();
        framer.push(b"\r\n\r\n");
        framer.push(REQ.as_bytes());
        assert!(framer.next_message().unwrap().is_some());
    }

    #[test]
    fn framer_rejects_bad_content_length() {
        let mut framer = StreamFramer::new();
        framer.push(b"OPTIONS sip:b@b.com SIP/2.0\r\nContent-Length: pony\r\n\r\n");
        assert!(framer.next_message().is_err());
    }
}
