//! Typed SIP headers.
//!
//! Well-known headers parse into structured values; anything else is
//! carried as an opaque name/value pair. Insertion order is preserved
//! by the message, and the printer emits long header names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::address::Address;
use crate::types::auth::{DigestChallenge, DigestCredentials};
use crate::types::method::Method;
use crate::types::via::Via;

/// Header name, well-known or extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    MaxForwards,
    ContentLength,
    ContentType,
    Route,
    RecordRoute,
    Allow,
    Supported,
    Require,
    Unsupported,
    Accept,
    Expires,
    MinExpires,
    UserAgent,
    Subject,
    WwwAuthenticate,
    Authorization,
    ProxyAuthenticate,
    ProxyAuthorization,
    ReferTo,
    ReferredBy,
    Event,
    SubscriptionState,
    Reason,
    MinSe,
    SessionExpires,
    Other(String),
}

impl HeaderName {
    /// Canonical long form of the header name.
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::ContentType => "Content-Type",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Allow => "Allow",
            HeaderName::Supported => "Supported",
            HeaderName::Require => "Require",
            HeaderName::Unsupported => "Unsupported",
            HeaderName::Accept => "Accept",
            HeaderName::Expires => "Expires",
            HeaderName::MinExpires => "Min-Expires",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Subject => "Subject",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::Authorization => "Authorization",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::ReferTo => "Refer-To",
            HeaderName::ReferredBy => "Referred-By",
            HeaderName::Event => "Event",
            HeaderName::SubscriptionState => "Subscription-State",
            HeaderName::Reason => "Reason",
            HeaderName::MinSe => "Min-SE",
            HeaderName::SessionExpires => "Session-Expires",
            HeaderName::Other(name) => name,
        }
    }

    /// Resolve a wire name, long or compact, to a `HeaderName`.
    pub fn from_wire(name: &str) -> Self {
        let name = name.trim();
        // Compact forms, RFC 3261 §7.3.3 and extension RFCs.
        if name.len() == 1 {
            return match name.to_ascii_lowercase().as_str() {
                "v" => HeaderName::Via,
                "f" => HeaderName::From,
                "t" => HeaderName::To,
                "i" => HeaderName::CallId,
                "m" => HeaderName::Contact,
                "c" => HeaderName::ContentType,
                "l" => HeaderName::ContentLength,
                "k" => HeaderName::Supported,
                "s" => HeaderName::Subject,
                "o" => HeaderName::Event,
                "b" => HeaderName::ReferredBy,
                "r" => HeaderName::ReferTo,
                "x" => HeaderName::SessionExpires,
                _ => HeaderName::Other(name.to_string()),
            };
        }
        match name.to_ascii_lowercase().as_str() {
            "via" => HeaderName::Via,
            "from" => HeaderName::From,
            "to" => HeaderName::To,
            "call-id" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" => HeaderName::Contact,
            "max-forwards" => HeaderName::MaxForwards,
            "content-length" => HeaderName::ContentLength,
            "content-type" => HeaderName::ContentType,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "allow" => HeaderName::Allow,
            "supported" => HeaderName::Supported,
            "require" => HeaderName::Require,
            "unsupported" => HeaderName::Unsupported,
            "accept" => HeaderName::Accept,
            "expires" => HeaderName::Expires,
            "min-expires" => HeaderName::MinExpires,
            "user-agent" => HeaderName::UserAgent,
            "subject" => HeaderName::Subject,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "authorization" => HeaderName::Authorization,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "refer-to" => HeaderName::ReferTo,
            "referred-by" => HeaderName::ReferredBy,
            "event" => HeaderName::Event,
            "subscription-state" => HeaderName::SubscriptionState,
            "reason" => HeaderName::Reason,
            "min-se" => HeaderName::MinSe,
            "session-expires" => HeaderName::SessionExpires,
            _ => HeaderName::Other(name.to_string()),
        }
    }

    /// Headers whose value is a comma-separated list that may be split
    /// across entries (RFC 3261 §7.3.1).
    pub fn is_list_header(&self) -> bool {
        matches!(
            self,
            HeaderName::Via
                | HeaderName::Contact
                | HeaderName::Route
                | HeaderName::RecordRoute
                | HeaderName::Allow
                | HeaderName::Supported
                | HeaderName::Require
                | HeaderName::Unsupported
                | HeaderName::Accept
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSeq value: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (seq, method) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidHeader(format!("bad CSeq: {}", s)))?;
        Ok(CSeq {
            seq: seq.parse().map_err(|_| Error::InvalidHeader(format!("bad CSeq: {}", s)))?,
            method: method.trim().parse()?,
        })
    }
}

/// Structured value of a header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    /// name-addr value (From, To, Contact, Route, Record-Route,
    /// Refer-To, Referred-By)
    Address(Address),
    /// One Via hop
    Via(Via),
    /// CSeq
    CSeq(CSeq),
    /// Numeric value (Max-Forwards, Content-Length, Expires, ...)
    UInt(u32),
    /// Token list value (one token per header entry after splitting)
    Token(String),
    /// Digest challenge (WWW-Authenticate, Proxy-Authenticate)
    Challenge(DigestChallenge),
    /// Digest credentials (Authorization, Proxy-Authorization)
    Credentials(DigestCredentials),
    /// Anything else, verbatim
    Raw(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Address(a) => a.fmt(f),
            HeaderValue::Via(v) => v.fmt(f),
            HeaderValue::CSeq(c) => c.fmt(f),
            HeaderValue::UInt(n) => n.fmt(f),
            HeaderValue::Token(t) => f.write_str(t),
            HeaderValue::Challenge(c) => c.fmt(f),
            HeaderValue::Credentials(c) => c.fmt(f),
            HeaderValue::Raw(r) => f.write_str(r),
        }
    }
}

/// A single header entry: typed name plus typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl Header {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Header { name, value }
    }

    /// Build a header from a raw wire value, parsing the structured
    /// form for well-known names. Fails only for headers whose
    /// structure the stack depends on; everything else degrades to
    /// `Raw`.
    pub fn from_wire(name: HeaderName, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let value = match &name {
            HeaderName::Via => HeaderValue::Via(raw.parse()?),
            HeaderName::From | HeaderName::To => HeaderValue::Address(raw.parse()?),
            HeaderName::CSeq => HeaderValue::CSeq(raw.parse()?),
            HeaderName::CallId => HeaderValue::Raw(raw.to_string()),
            HeaderName::MaxForwards | HeaderName::ContentLength => HeaderValue::UInt(
                raw.parse().map_err(|_| {
                    Error::InvalidHeader(format!("bad numeric {}: {}", name, raw))
                })?,
            ),
            HeaderName::Expires | HeaderName::MinExpires | HeaderName::SessionExpires
            | HeaderName::MinSe => match raw.split(';').next().unwrap_or(raw).trim().parse() {
                Ok(n) => HeaderValue::UInt(n),
                Err(_) => HeaderValue::Raw(raw.to_string()),
            },
            HeaderName::Contact
            | HeaderName::Route
            | HeaderName::RecordRoute
            | HeaderName::ReferTo
            | HeaderName::ReferredBy => match raw.parse() {
                Ok(addr) => HeaderValue::Address(addr),
                // Contact: * and other non-address forms stay raw.
                Err(_) => HeaderValue::Raw(raw.to_string()),
            },
            HeaderName::Allow
            | HeaderName::Supported
            | HeaderName::Require
            | HeaderName::Unsupported => HeaderValue::Token(raw.to_string()),
            HeaderName::WwwAuthenticate | HeaderName::ProxyAuthenticate => match raw.parse() {
                Ok(ch) => HeaderValue::Challenge(ch),
                Err(_) => HeaderValue::Raw(raw.to_string()),
            },
            HeaderName::Authorization | HeaderName::ProxyAuthorization => match raw.parse() {
                Ok(cred) => HeaderValue::Credentials(cred),
                Err(_) => HeaderValue::Raw(raw.to_string()),
            },
            _ => HeaderValue::Raw(raw.to_string()),
        };
        Ok(Header { name, value })
    }

    /// The address value, when this header carries one.
    pub fn as_address(&self) -> Option<&Address> {
        match &self.value {
            HeaderValue::Address(a) => Some(a),
            _ => None,
        }
    }

    /// The Via value, when this header carries one.
    pub fn as_via(&self) -> Option<&Via> {
        match &self.value {
            HeaderValue::Via(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_names_resolve() {
        assert_eq!(HeaderName::from_wire("v"), HeaderName::Via);
        assert_eq!(HeaderName::from_wire("i"), HeaderName::CallId);
        assert_eq!(HeaderName::from_wire("l"), HeaderName::ContentLength);
        assert_eq!(HeaderName::from_wire("Content-length"), HeaderName::ContentLength);
        assert_eq!(HeaderName::from_wire("X-Custom"), HeaderName::Other("X-Custom".to_string()));
    }

    #[test]
    fn cseq_parse() {
        let cseq: CSeq = "314159 INVITE".parse().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert!("oops INVITE".parse::<CSeq>().is_err());
    }

    #[test]
    fn typed_from_wire() {
        let h = Header::from_wire(HeaderName::From, "<sip:alice@atlanta.com>;tag=88sja8x").unwrap();
        assert_eq!(h.as_address().unwrap().tag(), Some("88sja8x"));

        let h = Header::from_wire(HeaderName::MaxForwards, "70").unwrap();
        assert_eq!(h.value, HeaderValue::UInt(70));

        assert!(Header::from_wire(HeaderName::MaxForwards, "abc").is_err());
    }

    #[test]
    fn star_contact_stays_raw() {
        let h = Header::from_wire(HeaderName::Contact, "*").unwrap();
        assert_eq!(h.value, HeaderValue::Raw("*".to_string()));
    }

    #[test]
    fn header_prints_long_name() {
        let h = Header::from_wire(HeaderName::ContentLength, "0").unwrap();
        assert_eq!(h.to_string(), "Content-Length: 0");
    }
}
