//! Events the session engine publishes to the application.

use waveline_sip_core::Address;
use waveline_sip_core::negotiator::NegotiatedMedia;
use waveline_sip_core::sdp::SessionDescription;

use crate::types::{CallCause, CallState, MediaState, SessionId};

/// Application-visible session events.
///
/// Delivered on one mpsc channel in the order the engine produced
/// them; the application consumes them from its own task.
#[derive(Debug)]
pub enum SessionEvent {
    /// A new inbound call was admitted (already past capacity and
    /// verification checks). Answer it with `Endpoint::answer`.
    IncomingCall {
        session: SessionId,
        from: Address,
        offer: Option<SessionDescription>,
    },
    /// `on_state_changed`: fires after every transition.
    StateChanged {
        session: SessionId,
        previous: CallState,
        new: CallState,
        cause: Option<CallCause>,
    },
    /// Hold/unhold and negotiation-driven media flow changes.
    MediaStateChanged { session: SessionId, media: MediaState },
    /// Offer/answer completed; the media layer can (re)build streams.
    MediaUpdate { session: SessionId, media: NegotiatedMedia },
    /// The peer asked us to transfer the call (REFER). The engine has
    /// already accepted with 202 and sent the initial NOTIFY.
    TransferRequested { session: SessionId, refer_to: Address },
    /// Progress of a transfer we requested, parsed from NOTIFY
    /// sipfrag bodies.
    TransferProgress {
        session: SessionId,
        status: u16,
        reason: String,
        terminated: bool,
    },
    /// A redirect (3xx) wants a decision and the policy said
    /// `Pending`; call `Endpoint::process_redirect`.
    RedirectPending { session: SessionId, target: Address },
    /// Non-fatal trouble worth logging upstream.
    Error { session: Option<SessionId>, error: String },
}
