//! ICE connectivity establishment for the waveline stack.
//!
//! Three pieces:
//!
//! - [`stun`]: the RFC 5389 message codec, including MESSAGE-INTEGRITY
//!   (HMAC-SHA1) and FINGERPRINT (CRC32 xor `0x5354554E`)
//! - [`session`]: the RFC 5245 checklist engine: candidate pairing,
//!   Ta-paced ordinary checks, triggered checks, peer-reflexive
//!   discovery, nomination and keepalive
//! - [`nat`]: advisory RFC 3489 NAT type classification
//!
//! The session owns no sockets: checks share the media transport, so
//! outgoing packets are queued on a channel and inbound STUN is fed in
//! by the embedder.

pub mod candidate;
pub mod error;
pub mod nat;
pub mod session;
pub mod stun;

pub use candidate::{Candidate, CandidateType, compute_priority, pair_priority};
pub use error::{Error, Result};
pub use nat::{NatDetector, NatTest, NatType, TestOutcome};
pub use session::{
    Check, CheckState, IceConfig, IceEvent, IceRole, IceSession, OutboundPacket,
};
pub use stun::{
    StunAttribute, StunAttributeType, StunMessage, StunMessageType, long_term_key, short_term_key,
};

/// ICE protocol constants
pub mod constants {
    use std::time::Duration;

    /// STUN magic cookie value (RFC 5389)
    pub const STUN_MAGIC_COOKIE: u32 = crate::stun::STUN_MAGIC_COOKIE;

    /// Default port for STUN servers
    pub const DEFAULT_STUN_PORT: u16 = 3478;

    /// Default pacing interval for connectivity checks
    pub const DEFAULT_TA: Duration = crate::session::DEFAULT_TA;
}

/// Re-export of common types and functions
pub mod prelude {
    pub use crate::candidate::{Candidate, CandidateType};
    pub use crate::error::{Error, Result};
    pub use crate::nat::{NatDetector, NatType};
    pub use crate::session::{
        CheckState, IceConfig, IceEvent, IceRole, IceSession, OutboundPacket,
    };
    pub use crate::stun::{StunAttribute, StunAttributeType, StunMessage, StunMessageType};
}
