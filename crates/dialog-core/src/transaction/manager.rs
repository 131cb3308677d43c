//! The transaction table and RFC 3261 §17.2.3 message matching.
//!
//! The manager sits between the transport and the Transaction User:
//! every inbound message is matched against the table by Via branch,
//! CSeq method and role; misses create server transactions (for
//! requests) or surface as strays (for responses and ACK-to-2xx).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use waveline_sip_core::{
    Header, HeaderAccess, HeaderName, HeaderValue, Message, Method, Request, Response, StatusCode,
    generate_branch,
};
use waveline_sip_transport::{Transport, TransportEvent};

use crate::errors::{Error, Result};
use crate::transaction::client::{InviteClientLogic, NonInviteClientLogic};
use crate::transaction::logic::{TransactionData, TransactionLogic};
use crate::transaction::runner::run_transaction_loop;
use crate::transaction::server::{InviteServerLogic, NonInviteServerLogic};
use crate::transaction::timer::TimerSettings;
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TransactionEvent, TransactionKey,
    TransactionKind, TransactionState,
};

const CMD_CHANNEL_DEPTH: usize = 32;
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Table entry for one live transaction.
struct TransactionHandle {
    kind: TransactionKind,
    state: Arc<AtomicTransactionState>,
    cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    remote: SocketAddr,
    /// Original request, kept on INVITE client transactions so a
    /// CANCEL can be derived from it.
    original: Option<Request>,
    /// Set when a provisional response has been seen, gating CANCEL
    /// (RFC 3261 §9.1). Recorded here to avoid racing the transaction
    /// task's own state change.
    got_provisional: AtomicBool,
}

/// Owns every transaction and performs message matching.
pub struct TransactionManager {
    transport: Arc<dyn Transport>,
    table: Arc<DashMap<TransactionKey, TransactionHandle>>,
    /// Events from transactions and from the matcher, drained by the
    /// forwarding task.
    internal_tx: mpsc::Sender<TransactionEvent>,
    timers: TimerSettings,
}

impl TransactionManager {
    /// Build a manager on top of a bound transport. `transport_rx`
    /// is the transport's event stream; the returned receiver carries
    /// [`TransactionEvent`]s for the TU.
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        timers: Option<TimerSettings>,
    ) -> (Arc<TransactionManager>, mpsc::Receiver<TransactionEvent>) {
        let (internal_tx, internal_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (tu_tx, tu_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let manager = Arc::new(TransactionManager {
            transport,
            table: Arc::new(DashMap::new()),
            internal_tx,
            timers: timers.unwrap_or_default(),
        });

        manager.spawn_forwarder(internal_rx, tu_tx);
        manager.spawn_transport_pump(transport_rx);

        (manager, tu_rx)
    }

    /// Forward transaction events to the TU, reaping table entries
    /// when their transaction terminates.
    fn spawn_forwarder(
        self: &Arc<Self>,
        mut internal_rx: mpsc::Receiver<TransactionEvent>,
        tu_tx: mpsc::Sender<TransactionEvent>,
    ) {
        let table = self.table.clone();
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                if let TransactionEvent::Terminated { id } = &event {
                    table.remove(id);
                }
                if tu_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_transport_pump(self: &Arc<Self>, mut transport_rx: mpsc::Receiver<TransportEvent>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                match event {
                    TransportEvent::MessageReceived { message, source, .. } => {
                        if let Err(e) = manager.on_message(message, source).await {
                            debug!(error = %e, "inbound message dropped");
                        }
                    }
                    TransportEvent::Error { error } => {
                        manager
                            .emit(TransactionEvent::Error { id: None, error })
                            .await;
                    }
                    TransportEvent::Closed => break,
                }
            }
        });
    }

    async fn emit(&self, event: TransactionEvent) {
        let _ = self.internal_tx.send(event).await;
    }

    /// Match one inbound message per §17.2.3 and dispatch it.
    pub async fn on_message(&self, message: Message, source: SocketAddr) -> Result<()> {
        match message {
            Message::Response(response) => self.on_response(response, source).await,
            Message::Request(request) => self.on_request(request, source).await,
        }
    }

    async fn on_response(&self, response: Response, source: SocketAddr) -> Result<()> {
        let key = match TransactionKey::from_message(&Message::Response(response.clone())) {
            Ok(key) => key,
            Err(_) => {
                warn!(%source, "discarding response without transaction id");
                return Ok(());
            }
        };
        // Clone the sender out of the table so no shard guard is held
        // across the await.
        let cmd_tx = self.table.get(&key).map(|handle| {
            if response.status.is_provisional() {
                handle.got_provisional.store(true, Ordering::Release);
            }
            handle.cmd_tx.clone()
        });
        if let Some(cmd_tx) = cmd_tx {
            cmd_tx
                .send(InternalTransactionCommand::ProcessMessage(Message::Response(response)))
                .await
                .map_err(|_| Error::ChannelClosed)?;
        } else {
            // 2xx retransmissions after the INVITE transaction ended
            // land here too; the dialog layer owns them.
            self.emit(TransactionEvent::StrayResponse { response, source }).await;
        }
        Ok(())
    }

    async fn on_request(&self, mut request: Request, source: SocketAddr) -> Result<()> {
        if let Err(e) = request.validate() {
            // Parseable but incomplete: answer 400 statelessly when a
            // response can be generated at all.
            warn!(%source, error = %e, "malformed request");
            let mut bad = Response::for_request(StatusCode::BadRequest, &request);
            bad.reason = Some(e.to_string());
            let _ = self.transport.send_message(&Message::Response(bad), source).await;
            return Ok(());
        }
        stamp_received(&mut request, source);

        let key = TransactionKey::from_message(&Message::Request(request.clone()))?;

        match request.method {
            Method::Ack => {
                let completed_tx = self.table.get(&key).and_then(|handle| {
                    (handle.state.get() == TransactionState::Completed)
                        .then(|| handle.cmd_tx.clone())
                });
                if let Some(cmd_tx) = completed_tx {
                    cmd_tx
                        .send(InternalTransactionCommand::ProcessMessage(Message::Request(
                            request,
                        )))
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    return Ok(());
                }
                // ACK to a 2xx never matches the INVITE transaction.
                self.emit(TransactionEvent::StrayAck { request, source }).await;
                Ok(())
            }
            Method::Cancel => self.on_cancel(request, key, source).await,
            _ => {
                let existing = self.table.get(&key).map(|handle| handle.cmd_tx.clone());
                if let Some(cmd_tx) = existing {
                    // Retransmission of the original request.
                    cmd_tx
                        .send(InternalTransactionCommand::ProcessMessage(Message::Request(
                            request,
                        )))
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    return Ok(());
                }
                let kind = TransactionKind::for_request(&request.method, true);
                self.spawn_transaction(key.clone(), kind, request.clone(), source, None)?;
                self.emit(TransactionEvent::NewRequest { id: key, request, source }).await;
                Ok(())
            }
        }
    }

    /// CANCEL runs in its own server transaction; a match against a
    /// live INVITE server transaction is reported to the TU, a miss
    /// is answered 481 (RFC 3261 §9.2).
    async fn on_cancel(
        &self,
        request: Request,
        cancel_key: TransactionKey,
        source: SocketAddr,
    ) -> Result<()> {
        let retransmission = self.table.get(&cancel_key).map(|h| h.cmd_tx.clone());
        if let Some(cmd_tx) = retransmission {
            // Retransmitted CANCEL.
            let _ = cmd_tx
                .send(InternalTransactionCommand::ProcessMessage(Message::Request(request)))
                .await;
            return Ok(());
        }

        let invite_key =
            TransactionKey::new(cancel_key.branch.clone(), Method::Invite, true);
        let invite_alive = self
            .table
            .get(&invite_key)
            .map(|h| h.state.get() != TransactionState::Terminated)
            .unwrap_or(false);

        self.spawn_transaction(
            cancel_key.clone(),
            TransactionKind::NonInviteServer,
            request.clone(),
            source,
            None,
        )?;

        if invite_alive {
            // CANCEL itself always succeeds; the TU answers 487 on
            // the INVITE side.
            self.send_response(&cancel_key, Response::for_request(StatusCode::Ok, &request))
                .await?;
            self.emit(TransactionEvent::CancelReceived {
                id: invite_key,
                cancel_id: cancel_key,
                request,
            })
            .await;
        } else {
            self.send_response(
                &cancel_key,
                Response::for_request(StatusCode::CallOrTransactionDoesNotExist, &request),
            )
            .await?;
        }
        Ok(())
    }

    /// Start a client transaction for `request`. A missing branch is
    /// generated. Returns the transaction key.
    pub fn send_request(&self, mut request: Request, remote: SocketAddr) -> Result<TransactionKey> {
        if matches!(request.method, Method::Ack) {
            return Err(Error::BadRequest(
                "ACK is transaction-less; use send_stateless".to_string(),
            ));
        }
        ensure_branch(&mut request)?;
        let key = TransactionKey::from_message(&Message::Request(request.clone()))
            .map(|k| TransactionKey { is_server: false, ..k })?;
        if self.table.contains_key(&key) {
            return Err(Error::InvalidState(format!("transaction {} already exists", key)));
        }
        let kind = TransactionKind::for_request(&request.method, false);
        let original =
            if kind == TransactionKind::InviteClient { Some(request.clone()) } else { None };
        self.spawn_transaction(key.clone(), kind, request, remote, original)?;
        Ok(key)
    }

    /// CANCEL a pending INVITE client transaction. Only legal once a
    /// provisional response has arrived (§9.1); the caller defers
    /// until then.
    pub async fn send_cancel(&self, invite_key: &TransactionKey) -> Result<TransactionKey> {
        let (original, remote) = {
            let handle = self
                .table
                .get(invite_key)
                .ok_or_else(|| Error::UnknownTransaction(invite_key.to_string()))?;
            if handle.kind != TransactionKind::InviteClient {
                return Err(Error::InvalidState("CANCEL targets an INVITE client".to_string()));
            }
            let provisional_seen = handle.got_provisional.load(Ordering::Acquire)
                || handle.state.get() == TransactionState::Proceeding;
            if !provisional_seen {
                return Err(Error::InvalidState(
                    "CANCEL before a provisional response".to_string(),
                ));
            }
            let original = handle
                .original
                .clone()
                .ok_or_else(|| Error::InvalidState("INVITE request not retained".to_string()))?;
            (original, handle.remote)
        };

        let cancel = build_cancel(&original)?;
        let cancel_key = TransactionKey::new(
            invite_key.branch.clone(),
            Method::Cancel,
            false,
        );
        self.spawn_transaction(
            cancel_key.clone(),
            TransactionKind::NonInviteClient,
            cancel,
            remote,
            None,
        )?;
        Ok(cancel_key)
    }

    /// Hand a response to a server transaction.
    pub async fn send_response(&self, key: &TransactionKey, response: Response) -> Result<()> {
        let cmd_tx = self
            .table
            .get(key)
            .map(|h| h.cmd_tx.clone())
            .ok_or_else(|| Error::UnknownTransaction(key.to_string()))?;
        cmd_tx
            .send(InternalTransactionCommand::SendResponse(response))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Send a message outside any transaction (ACK to 2xx, 2xx
    /// retransmissions).
    pub async fn send_stateless(&self, message: &Message, remote: SocketAddr) -> Result<()> {
        self.transport
            .send_message(message, remote)
            .await
            .map_err(|e| Error::TransportFailure(e.to_string()))
    }

    /// Force a transaction down.
    pub async fn terminate(&self, key: &TransactionKey) -> Result<()> {
        let cmd_tx = self
            .table
            .get(key)
            .map(|h| h.cmd_tx.clone())
            .ok_or_else(|| Error::UnknownTransaction(key.to_string()))?;
        cmd_tx
            .send(InternalTransactionCommand::Terminate)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Current state of a transaction, if it is still in the table.
    pub fn state_of(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.table.get(key).map(|h| h.state.get())
    }

    /// Number of live transactions.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    fn spawn_transaction(
        &self,
        key: TransactionKey,
        kind: TransactionKind,
        request: Request,
        remote: SocketAddr,
        original: Option<Request>,
    ) -> Result<()> {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_DEPTH);
        let state = Arc::new(AtomicTransactionState::new(TransactionState::Initial));

        let data = Arc::new(TransactionData {
            key: key.clone(),
            state: state.clone(),
            request: Mutex::new(request),
            last_response: Mutex::new(None),
            remote,
            transport: self.transport.clone(),
            events_tx: self.internal_tx.clone(),
            cmd_tx: cmd_tx.clone(),
            timers: self.timers.clone(),
            retransmit_interval: Mutex::new(self.timers.t1),
        });

        self.table.insert(
            key,
            TransactionHandle {
                kind,
                state,
                cmd_tx: cmd_tx.clone(),
                remote,
                original,
                got_provisional: AtomicBool::new(false),
            },
        );

        match kind {
            TransactionKind::InviteClient => {
                spawn_runner(data, Arc::new(InviteClientLogic), cmd_rx, cmd_tx)
            }
            TransactionKind::NonInviteClient => {
                spawn_runner(data, Arc::new(NonInviteClientLogic), cmd_rx, cmd_tx)
            }
            TransactionKind::InviteServer => {
                spawn_runner(data, Arc::new(InviteServerLogic), cmd_rx, cmd_tx)
            }
            TransactionKind::NonInviteServer => {
                spawn_runner(data, Arc::new(NonInviteServerLogic), cmd_rx, cmd_tx)
            }
        }
        Ok(())
    }
}

fn spawn_runner<L: TransactionLogic>(
    data: Arc<TransactionData>,
    logic: Arc<L>,
    cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
    cmd_tx: mpsc::Sender<InternalTransactionCommand>,
) {
    // Queue the initial transition before the loop starts draining.
    let initial = logic.initial_state();
    let _ = cmd_tx.try_send(InternalTransactionCommand::TransitionTo(initial));
    tokio::spawn(run_transaction_loop(data, logic, cmd_rx));
}

/// Give the topmost Via an RFC 3261 branch when the caller left it
/// out.
fn ensure_branch(request: &mut Request) -> Result<()> {
    let Some(via_header) = request.headers.iter_mut().find(|h| h.name == HeaderName::Via) else {
        return Err(Error::BadRequest("request without Via".to_string()));
    };
    if let HeaderValue::Via(via) = &mut via_header.value {
        if via.branch().is_none() {
            via.set_param("branch", Some(generate_branch()));
        }
        Ok(())
    } else {
        Err(Error::BadRequest("Via header is not structured".to_string()))
    }
}

/// Add `received` to the top Via when the packet source does not
/// match the sent-by host (RFC 3261 §18.2.1).
fn stamp_received(request: &mut Request, source: SocketAddr) {
    if let Some(via_header) = request.headers.iter_mut().find(|h| h.name == HeaderName::Via) {
        if let HeaderValue::Via(via) = &mut via_header.value {
            let source_ip = source.ip().to_string();
            if via.sent_by_host != source_ip {
                via.set_param("received", Some(source_ip));
            }
        }
    }
}

/// Derive a CANCEL from the original INVITE (RFC 3261 §9.1): same
/// Request-URI, same branch, same CSeq number with method CANCEL.
pub fn build_cancel(original: &Request) -> Result<Request> {
    let mut cancel = Request::new(Method::Cancel, original.uri.clone());
    for header in &original.headers {
        match header.name {
            HeaderName::Via => {
                if cancel.via_top().is_none() {
                    cancel.headers.push(header.clone());
                }
            }
            HeaderName::From
            | HeaderName::To
            | HeaderName::CallId
            | HeaderName::Route
            | HeaderName::MaxForwards => cancel.headers.push(header.clone()),
            _ => {}
        }
    }
    let cseq = original
        .cseq()
        .ok_or_else(|| Error::BadRequest("request without CSeq".to_string()))?;
    cancel.push_header(Header::new(
        HeaderName::CSeq,
        HeaderValue::CSeq(waveline_sip_core::CSeq::new(cseq.seq, Method::Cancel)),
    ));
    Ok(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::parse_request;

    #[test]
    fn cancel_mirrors_invite_identity() {
        let raw = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP atlanta.com;branch=z9hG4bKcxl\r\nMax-Forwards: 70\r\n\
            To: <sip:bob@biloxi.com>\r\nFrom: <sip:alice@atlanta.com>;tag=aa\r\n\
            Call-ID: cancel-test\r\nCSeq: 9 INVITE\r\n\r\n";
        let invite = parse_request(raw.as_bytes()).unwrap();
        let cancel = build_cancel(&invite).unwrap();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.uri, invite.uri);
        assert_eq!(cancel.via_top().unwrap().branch(), Some("z9hG4bKcxl"));
        let cseq = cancel.cseq().unwrap();
        assert_eq!(cseq.seq, 9);
        assert_eq!(cseq.method, Method::Cancel);
        // To is copied untouched, tag-less.
        assert_eq!(cancel.to_header().unwrap().tag(), None);
    }

    #[test]
    fn ensure_branch_generates_when_missing() {
        let raw = "OPTIONS sip:x@y SIP/2.0\r\n\
            Via: SIP/2.0/UDP a.com\r\nMax-Forwards: 70\r\n\
            To: <sip:x@y>\r\nFrom: <sip:a@b>;tag=1\r\nCall-ID: c\r\nCSeq: 1 OPTIONS\r\n\r\n";
        let mut req = parse_request(raw.as_bytes()).unwrap();
        ensure_branch(&mut req).unwrap();
        assert!(req.via_top().unwrap().is_rfc3261_branch());
    }
}
