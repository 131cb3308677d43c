//! INVITE session engine for the waveline stack.
//!
//! Builds the call state machine of a softphone on top of the
//! transaction and dialog layers:
//!
//! - [`session::InviteSession`]: Null → Calling/Incoming → Early →
//!   Connecting → Confirmed → Disconnected, driven by transaction
//!   events, with offer/answer, CANCEL deferral, hold, re-INVITE,
//!   UPDATE, 3xx redirection and REFER transfer.
//! - [`endpoint::Endpoint`]: the process-wide façade owning the
//!   session table, the module registry, OPTIONS capability
//!   responses and graceful shutdown.
//!
//! Registration, presence, IM and the user interface live above this
//! crate; media lives beside it in `media-core`.

pub mod endpoint;
pub mod errors;
pub mod events;
pub mod redirect;
pub mod session;
pub mod transfer;
pub mod types;

pub use endpoint::{Endpoint, EndpointModule, Handled};
pub use errors::{Error, Result};
pub use events::SessionEvent;
pub use redirect::{RedirectAction, RedirectPolicy};
pub use session::{InviteSession, Role};
pub use transfer::{SipFrag, SIPFRAG_CONTENT_TYPE};
pub use types::{CallCause, CallState, MediaState, SessionId};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::endpoint::{Endpoint, EndpointModule, Handled};
    pub use crate::errors::{Error, Result};
    pub use crate::events::SessionEvent;
    pub use crate::redirect::RedirectAction;
    pub use crate::transfer::SipFrag;
    pub use crate::types::{CallCause, CallState, MediaState, SessionId};
}
