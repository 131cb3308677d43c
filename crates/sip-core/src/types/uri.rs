//! SIP URI type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP or SIPS URI.
///
/// Parameter order is preserved on the round trip; comparison follows
/// the loose rule the stack needs (scheme, user, host, port), not the
/// full RFC 3261 §19.1.4 equivalence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// uri-parameters, `;name[=value]` in order of appearance
    pub params: Vec<(String, Option<String>)>,
    /// headers after `?`, `name=value` pairs
    pub headers: Vec<(String, String)>,
}

impl Uri {
    /// Create a bare `sip:host` URI.
    pub fn sip(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Create a `sip:user@host` URI.
    pub fn sip_user(user: impl Into<String>, host: impl Into<String>) -> Self {
        Uri { user: Some(user.into()), ..Uri::sip(host) }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// Look up a uri-parameter by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// `lr` parameter present, i.e. a loose router address.
    pub fn is_loose_router(&self) -> bool {
        self.param("lr").is_some()
    }

    /// Transport parameter, if present.
    pub fn transport_param(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    /// The port to use for routing, with the scheme default applied.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme {
            Scheme::Sip => 5060,
            Scheme::Sips => 5061,
        })
    }

    /// True when the URI mandates TLS.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        let mut sep = '?';
        for (name, value) in &self.headers {
            write!(f, "{}{}={}", sep, name, value)?;
            sep = '&';
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = strip_prefix_ci(s, "sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = strip_prefix_ci(s, "sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(Error::InvalidUri(format!("unsupported scheme in '{}'", s)));
        };

        // Split off ?headers first, then ;params, then user@host:port.
        let (core, header_part) = match rest.split_once('?') {
            Some((c, h)) => (c, Some(h)),
            None => (rest, None),
        };
        let mut parts = core.split(';');
        let addr = parts.next().unwrap_or("");
        let mut params = Vec::new();
        for p in parts {
            if p.is_empty() {
                return Err(Error::InvalidUri(format!("empty parameter in '{}'", s)));
            }
            match p.split_once('=') {
                Some((n, v)) => params.push((n.to_string(), Some(v.to_string()))),
                None => params.push((p.to_string(), None)),
            }
        }

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, addr),
        };

        let (host, port) = parse_hostport(hostport)
            .ok_or_else(|| Error::InvalidUri(format!("bad host/port in '{}'", s)))?;

        let mut headers = Vec::new();
        if let Some(h) = header_part {
            for pair in h.split('&') {
                let (n, v) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidUri(format!("bad header in '{}'", s)))?;
                headers.push((n.to_string(), v.to_string()));
            }
        }

        Ok(Uri { scheme, user, host, port, params, headers })
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn parse_hostport(s: &str) -> Option<(String, Option<u16>)> {
    if s.is_empty() {
        return None;
    }
    // IPv6 reference
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((format!("[{}]", host), port));
    }
    match s.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((s.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let uri: Uri = "sip:alice@atlanta.com".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "atlanta.com");
        assert_eq!(uri.port, None);
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn parse_full() {
        let uri: Uri = "sips:bob@biloxi.com:5081;transport=tcp;lr?subject=call".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.port, Some(5081));
        assert_eq!(uri.transport_param(), Some("tcp"));
        assert!(uri.is_loose_router());
        assert_eq!(uri.headers, vec![("subject".to_string(), "call".to_string())]);
        assert!(uri.is_secure());
    }

    #[test]
    fn parse_ipv6() {
        let uri: Uri = "sip:[2001:db8::1]:5062".parse().unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, Some(5062));
    }

    #[test]
    fn display_round_trip() {
        for s in [
            "sip:alice@atlanta.com",
            "sip:atlanta.com:5062;lr",
            "sips:bob@biloxi.com;transport=tcp?x=y",
        ] {
            let uri: Uri = s.parse().unwrap();
            assert_eq!(uri.to_string(), s);
            let again: Uri = uri.to_string().parse().unwrap();
            assert_eq!(again, uri);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("http://x".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
        assert!("sip:host:badport".parse::<Uri>().is_err());
    }
}
