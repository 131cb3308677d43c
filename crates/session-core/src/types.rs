//! Session-level value types.

use std::fmt;

use waveline_sip_core::StatusCode;

/// Identifier for one INVITE session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn fresh() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// INVITE session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Session object exists, nothing sent or received.
    Null,
    /// UAC: INVITE sent.
    Calling,
    /// UAS: INVITE received.
    Incoming,
    /// Provisional response with a To tag sent/received.
    Early,
    /// 2xx sent/received, ACK outstanding.
    Connecting,
    /// ACK seen; the call is up.
    Confirmed,
    /// Terminal state.
    Disconnected,
}

impl CallState {
    /// True once the call can no longer be cancelled with CANCEL.
    pub fn is_established(&self) -> bool {
        matches!(self, CallState::Connecting | CallState::Confirmed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Null => "NULL",
            CallState::Calling => "CALLING",
            CallState::Incoming => "INCOMING",
            CallState::Early => "EARLY",
            CallState::Connecting => "CONNECTING",
            CallState::Confirmed => "CONFIRMED",
            CallState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Media flow state derived from the negotiated SDP directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    /// No media negotiated yet.
    None,
    /// Bidirectional audio.
    Active,
    /// We put the peer on hold.
    LocalHold,
    /// The peer put us on hold.
    RemoteHold,
    /// Media disabled in both directions.
    Inactive,
    /// Negotiation failed; no media flows.
    Error,
}

/// Why a session ended (or is ending). Codes outside 100..=699 carry
/// internal reasons with a descriptive phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCause {
    pub code: u16,
    pub reason: String,
}

impl CallCause {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        CallCause { code, reason: reason.into() }
    }

    pub fn from_status(status: StatusCode) -> Self {
        CallCause { code: status.as_u16(), reason: status.reason_phrase().to_string() }
    }

    /// Normal clearing, used when a call ends without a failure.
    pub fn normal() -> Self {
        CallCause::new(200, "Normal call clearing")
    }
}

impl fmt::Display for CallCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn established_states() {
        assert!(!CallState::Calling.is_established());
        assert!(!CallState::Early.is_established());
        assert!(CallState::Connecting.is_established());
        assert!(CallState::Confirmed.is_established());
    }

    #[test]
    fn cause_from_status() {
        let cause = CallCause::from_status(StatusCode::RequestTerminated);
        assert_eq!(cause.code, 487);
        assert_eq!(cause.reason, "Request Terminated");
    }
}
