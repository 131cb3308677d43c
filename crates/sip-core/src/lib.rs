//! SIP protocol implementation for the waveline stack.
//!
//! This crate owns everything that turns bytes into SIP and back:
//!
//! - The message model: [`Request`], [`Response`], typed headers,
//!   URIs, status codes
//! - The parser ([`parse_message`]) and the printer
//!   ([`Request::print`] / [`Response::print`])
//! - SDP session descriptions ([`sdp::SessionDescription`]) with
//!   structural equality
//! - The offer/answer negotiator ([`negotiator::SdpNegotiator`])
//!
//! No I/O happens here; transports, transactions and dialogs live in
//! their own crates.

pub mod error;
pub mod message;
pub mod negotiator;
pub mod parser;
pub mod sdp;
pub mod types;

pub use error::{Error, Result};
pub use message::{HeaderAccess, Message, Request, Response, SIP_VERSION};
pub use parser::{parse_message, parse_request, parse_response};
pub use types::{
    Address, BRANCH_MAGIC_COOKIE, CSeq, DigestChallenge, DigestCredentials, Header, HeaderName,
    HeaderValue, Method, Scheme, StatusCode, Uri, Via, ViaTransport, generate_branch, generate_tag,
};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::message::{HeaderAccess, Message, Request, Response};
    pub use crate::negotiator::{NegotiatedMedia, NegotiatorState, SdpNegotiator};
    pub use crate::parser::{parse_message, parse_request, parse_response};
    pub use crate::sdp::{
        Connection, Direction, MediaDescription, Origin, Rtpmap, SdpAttribute, SessionDescription,
    };
    pub use crate::types::{
        Address, CSeq, DigestChallenge, DigestCredentials, Header, HeaderName, HeaderValue, Method,
        StatusCode, Uri, Via, ViaTransport, generate_branch, generate_tag,
    };
}
