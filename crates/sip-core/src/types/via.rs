//! Via header value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Magic cookie every RFC 3261 branch parameter starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Transport token carried in a Via.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViaTransport {
    Udp,
    Tcp,
    Tls,
}

impl ViaTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViaTransport::Udp => "UDP",
            ViaTransport::Tcp => "TCP",
            ViaTransport::Tls => "TLS",
        }
    }
}

impl FromStr for ViaTransport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(ViaTransport::Udp),
            "TCP" => Ok(ViaTransport::Tcp),
            "TLS" => Ok(ViaTransport::Tls),
            other => Err(Error::InvalidHeader(format!("unknown Via transport: {}", other))),
        }
    }
}

impl fmt::Display for ViaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `Via` hop: `SIP/2.0/UDP host:port;branch=...;received=...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    pub transport: ViaTransport,
    pub sent_by_host: String,
    pub sent_by_port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    /// New Via with a freshly generated RFC 3261 branch.
    pub fn new(transport: ViaTransport, host: impl Into<String>, port: Option<u16>) -> Self {
        let mut via = Via {
            transport,
            sent_by_host: host.into(),
            sent_by_port: port,
            params: Vec::new(),
        };
        via.set_param("branch", Some(generate_branch()));
        via
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        if let Some(slot) = self.params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
    }

    /// The branch parameter identifying the transaction.
    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    /// True when the branch carries the RFC 3261 magic cookie.
    pub fn is_rfc3261_branch(&self) -> bool {
        self.branch().map(|b| b.starts_with(BRANCH_MAGIC_COOKIE)).unwrap_or(false)
    }

    /// The `received` parameter added by the server transport.
    pub fn received(&self) -> Option<&str> {
        self.param("received").flatten()
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by_host)?;
        if let Some(port) = self.sent_by_port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("SIP/2.0/")
            .or_else(|| s.strip_prefix("sip/2.0/"))
            .ok_or_else(|| Error::InvalidHeader(format!("bad Via protocol: {}", s)))?;
        let (transport_str, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidHeader(format!("Via missing sent-by: {}", s)))?;
        let transport: ViaTransport = transport_str.parse()?;

        let mut parts = rest.trim().split(';');
        let sent_by = parts.next().unwrap_or("").trim();
        let (host, port) = if let Some(stripped) = sent_by.strip_prefix('[') {
            // IPv6 sent-by
            let (h, after) = stripped
                .split_once(']')
                .ok_or_else(|| Error::InvalidHeader(format!("bad Via host: {}", s)))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(
                    p.parse()
                        .map_err(|_| Error::InvalidHeader(format!("bad Via port: {}", s)))?,
                ),
                None => None,
            };
            (format!("[{}]", h), port)
        } else {
            match sent_by.split_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    Some(
                        p.parse()
                            .map_err(|_| Error::InvalidHeader(format!("bad Via port: {}", s)))?,
                    ),
                ),
                None => (sent_by.to_string(), None),
            }
        };
        if host.is_empty() {
            return Err(Error::InvalidHeader(format!("Via missing host: {}", s)));
        }

        let mut params = Vec::new();
        for p in parts {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            match p.split_once('=') {
                Some((n, v)) => params.push((n.trim().to_string(), Some(v.trim().to_string()))),
                None => params.push((p.to_string(), None)),
            }
        }

        Ok(Via { transport, sent_by_host: host, sent_by_port: port, params })
    }
}

/// Generate a new RFC 3261 branch parameter.
pub fn generate_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, rand::random::<u64>())
}

/// Generate a From/To tag.
pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print() {
        let via: Via = "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds".parse().unwrap();
        assert_eq!(via.transport, ViaTransport::Udp);
        assert_eq!(via.sent_by_host, "pc33.atlanta.com");
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert!(via.is_rfc3261_branch());
        assert_eq!(via.to_string(), "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds");
    }

    #[test]
    fn parse_with_port_and_params() {
        let via: Via =
            "SIP/2.0/TCP 192.0.2.4:5061;branch=z9hG4bKnashds7;received=192.0.2.1".parse().unwrap();
        assert_eq!(via.sent_by_port, Some(5061));
        assert_eq!(via.received(), Some("192.0.2.1"));
    }

    #[test]
    fn generated_branch_has_cookie() {
        let via = Via::new(ViaTransport::Udp, "host.example.com", Some(5060));
        assert!(via.is_rfc3261_branch());
        let other = Via::new(ViaTransport::Udp, "host.example.com", Some(5060));
        assert_ne!(via.branch(), other.branch());
    }

    #[test]
    fn rejects_bad_protocol() {
        assert!("SIP/1.0/UDP host".parse::<Via>().is_err());
        assert!("SIP/2.0/UDP".parse::<Via>().is_err());
    }
}
