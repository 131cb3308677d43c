//! SIP request methods.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SIP request method, per RFC 3261 and the standard extension methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// INVITE: initiates a session
    Invite,
    /// ACK: acknowledges an INVITE final response
    Ack,
    /// BYE: terminates a session
    Bye,
    /// CANCEL: cancels a pending request
    Cancel,
    /// OPTIONS: queries capabilities
    Options,
    /// REGISTER: registers contact information
    Register,
    /// PRACK: acknowledges a reliable provisional response (RFC 3262)
    Prack,
    /// UPDATE: modifies session state without a re-INVITE (RFC 3311)
    Update,
    /// REFER: asks the recipient to issue a request (RFC 3515)
    Refer,
    /// SUBSCRIBE: requests event notification (RFC 6665)
    Subscribe,
    /// NOTIFY: delivers an event notification (RFC 6665)
    Notify,
    /// MESSAGE: instant message (RFC 3428)
    Message,
    /// INFO: mid-session information (RFC 6086)
    Info,
    /// Any other token
    Extension(String),
}

impl Method {
    /// Canonical (upper-case) name of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Extension(name) => name,
        }
    }

    /// True for the methods every waveline endpoint accepts.
    pub fn is_standard(&self) -> bool {
        !matches!(self, Method::Extension(_))
    }

    /// Whether a request with this method creates a dialog usage.
    pub fn establishes_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Refer)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(is_token_byte) {
            return Err(Error::InvalidMethod(s.to_string()));
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "REGISTER" => Method::Register,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "REFER" => Method::Refer,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "MESSAGE" => Method::Message,
            "INFO" => Method::Info,
            other => Method::Extension(other.to_string()),
        })
    }
}

/// RFC 3261 `token` alphabet.
pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(b, b'-' | b'.' | b'!' | b'%' | b'*' | b'_' | b'+' | b'`' | b'\'' | b'~')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_standard_methods() {
        assert_eq!("INVITE".parse::<Method>().unwrap(), Method::Invite);
        assert_eq!("REFER".parse::<Method>().unwrap(), Method::Refer);
        assert_eq!(
            "PUBLISH".parse::<Method>().unwrap(),
            Method::Extension("PUBLISH".to_string())
        );
    }

    #[test]
    fn reject_non_token() {
        assert!("IN VITE".parse::<Method>().is_err());
        assert!("".parse::<Method>().is_err());
    }

    #[test]
    fn display_round_trip() {
        for m in ["INVITE", "ACK", "BYE", "CANCEL", "OPTIONS", "NOTIFY"] {
            assert_eq!(m.parse::<Method>().unwrap().to_string(), m);
        }
    }
}
