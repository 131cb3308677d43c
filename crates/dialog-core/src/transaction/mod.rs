//! RFC 3261 Section 17 transaction layer.
//!
//! Four state machines cover the combinations of role and method
//! class: INVITE/non-INVITE crossed with client/server. A generic
//! event loop ([`runner`]) drives all four; the per-kind behaviour
//! lives in [`logic`] implementations. The [`manager`] owns the
//! transaction table and performs §17.2.3 matching on every message
//! the transport delivers.

pub mod client;
pub mod logic;
pub mod manager;
pub mod runner;
pub mod server;
pub mod timer;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use waveline_sip_core::{Message, Method, Request, Response};

use crate::errors::{Error, Result};

pub use manager::TransactionManager;
pub use timer::TimerSettings;

/// The four transaction kinds of RFC 3261 §17.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    InviteClient,
    InviteServer,
    NonInviteClient,
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_server(&self) -> bool {
        matches!(self, TransactionKind::InviteServer | TransactionKind::NonInviteServer)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::InviteServer)
    }

    /// Kind for a freshly received or sent request.
    pub fn for_request(method: &Method, is_server: bool) -> TransactionKind {
        match (method, is_server) {
            (Method::Invite, false) => TransactionKind::InviteClient,
            (Method::Invite, true) => TransactionKind::InviteServer,
            (_, false) => TransactionKind::NonInviteClient,
            (_, true) => TransactionKind::NonInviteServer,
        }
    }
}

/// Transaction state, the union of the four machines' states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    /// Created, initial request not yet passed through.
    Initial = 0,
    /// INVITE client: request sent, no response yet.
    Calling = 1,
    /// Non-INVITE: request sent/received, no provisional yet.
    Trying = 2,
    /// Provisional response seen/sent.
    Proceeding = 3,
    /// Final response seen/sent, absorbing retransmissions.
    Completed = 4,
    /// INVITE server only: ACK received.
    Confirmed = 5,
    /// Done; the transaction is unusable and about to be reaped.
    Terminated = 6,
}

impl TransactionState {
    fn from_u8(v: u8) -> TransactionState {
        match v {
            0 => TransactionState::Initial,
            1 => TransactionState::Calling,
            2 => TransactionState::Trying,
            3 => TransactionState::Proceeding,
            4 => TransactionState::Completed,
            5 => TransactionState::Confirmed,
            _ => TransactionState::Terminated,
        }
    }
}

/// Lock-free state cell shared between the transaction task and
/// observers.
#[derive(Debug)]
pub struct AtomicTransactionState {
    inner: AtomicU8,
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        AtomicTransactionState { inner: AtomicU8::new(state as u8) }
    }

    pub fn get(&self) -> TransactionState {
        TransactionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Set and return the previous state.
    pub fn set(&self, state: TransactionState) -> TransactionState {
        TransactionState::from_u8(self.inner.swap(state as u8, Ordering::AcqRel))
    }

    /// Reject transitions the RFC 3261 machines do not define.
    pub fn validate_transition(
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    ) -> Result<()> {
        use TransactionState::*;
        // Any state may collapse to Terminated (transport error,
        // timeout, forced teardown).
        let ok = to == Terminated
            || match kind {
                TransactionKind::InviteClient => matches!(
                    (from, to),
                    (Initial, Calling) | (Calling, Proceeding) | (Calling, Completed)
                        | (Proceeding, Completed)
                ),
                TransactionKind::InviteServer => matches!(
                    (from, to),
                    (Initial, Proceeding) | (Proceeding, Completed) | (Completed, Confirmed)
                ),
                TransactionKind::NonInviteClient => matches!(
                    (from, to),
                    (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed)
                        | (Proceeding, Completed)
                ),
                TransactionKind::NonInviteServer => matches!(
                    (from, to),
                    (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed)
                        | (Proceeding, Completed)
                ),
            };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "illegal {:?} transition {:?} -> {:?}",
                kind, from, to
            )))
        }
    }
}

/// Transaction identity per RFC 3261 §17.2.3: the Via branch plus the
/// CSeq method plus the role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        TransactionKey { branch: branch.into(), method, is_server }
    }

    /// Key for an incoming message. ACK maps to the INVITE server
    /// machine (the ACK-to-2xx case never reaches the table; the
    /// manager filters it first). CANCEL forms its own transaction.
    pub fn from_message(message: &Message) -> Result<TransactionKey> {
        use waveline_sip_core::HeaderAccess;
        let via = message
            .via_top()
            .ok_or_else(|| Error::BadRequest("message without Via".to_string()))?;
        let branch = via
            .branch()
            .ok_or_else(|| Error::BadRequest("Via without branch".to_string()))?
            .to_string();
        match message {
            Message::Request(req) => {
                let method = match req.method {
                    Method::Ack => Method::Invite,
                    ref m => m.clone(),
                };
                Ok(TransactionKey::new(branch, method, true))
            }
            Message::Response(resp) => {
                let cseq = resp
                    .cseq()
                    .ok_or_else(|| Error::BadResponse("response without CSeq".to_string()))?;
                Ok(TransactionKey::new(branch, cseq.method.clone(), false))
            }
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.branch,
            self.method,
            if self.is_server { "uas" } else { "uac" }
        )
    }
}

/// Events delivered to the Transaction User.
#[derive(Debug)]
pub enum TransactionEvent {
    /// A transaction changed state.
    StateChanged {
        id: TransactionKey,
        previous: TransactionState,
        new: TransactionState,
    },
    /// A request created a new server transaction.
    NewRequest {
        id: TransactionKey,
        request: Request,
        source: SocketAddr,
    },
    /// 1xx on a client transaction.
    ProvisionalResponse { id: TransactionKey, response: Response },
    /// 2xx on a client transaction.
    SuccessResponse { id: TransactionKey, response: Response },
    /// 3xx-6xx on a client transaction.
    FailureResponse { id: TransactionKey, response: Response },
    /// ACK matched an INVITE server transaction (non-2xx case).
    AckReceived { id: TransactionKey, request: Request },
    /// ACK to a 2xx; belongs to the dialog layer, not to any
    /// transaction.
    StrayAck { request: Request, source: SocketAddr },
    /// CANCEL arrived for a live INVITE server transaction. The
    /// CANCEL itself runs in its own server transaction `cancel_id`.
    CancelReceived {
        id: TransactionKey,
        cancel_id: TransactionKey,
        request: Request,
    },
    /// A response matched no transaction.
    StrayResponse { response: Response, source: SocketAddr },
    /// Transport send failed; the transaction has terminated.
    TransportError { id: TransactionKey },
    /// Timer B, F or H fired; the transaction has terminated.
    TimedOut { id: TransactionKey },
    /// The transaction reached Terminated and left the table.
    Terminated { id: TransactionKey },
    /// Internal failure worth surfacing.
    Error { id: Option<TransactionKey>, error: String },
}

/// Commands consumed by a transaction's event loop.
#[derive(Debug)]
pub enum InternalTransactionCommand {
    /// Move to a state, running entry actions.
    TransitionTo(TransactionState),
    /// Feed a message from the transport.
    ProcessMessage(Message),
    /// A named timer fired.
    Timer(&'static str),
    /// Send (or resend) a response on a server transaction.
    SendResponse(Response),
    /// The transport reported a send failure.
    TransportError,
    /// Tear the transaction down immediately.
    Terminate,
}
