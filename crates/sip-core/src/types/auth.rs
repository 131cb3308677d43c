//! Digest authentication header values (RFC 3261 §22 / RFC 2617).
//!
//! Only the codec lives here: challenge and credential values parse
//! from and print to header syntax. Response computation is done by
//! the dialog layer where the credentials live.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A `WWW-Authenticate` / `Proxy-Authenticate` digest challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)?;
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        if let Some(algorithm) = &self.algorithm {
            write!(f, ", algorithm={}", algorithm)?;
        }
        if let Some(qop) = &self.qop {
            write!(f, ", qop=\"{}\"", qop)?;
        }
        if self.stale {
            write!(f, ", stale=true")?;
        }
        Ok(())
    }
}

impl FromStr for DigestChallenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = strip_digest(s)?;
        let params = parse_comma_params(rest);
        let get = |name: &str| {
            params.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone())
        };
        Ok(DigestChallenge {
            realm: get("realm")
                .ok_or_else(|| Error::InvalidHeader("challenge missing realm".to_string()))?,
            nonce: get("nonce")
                .ok_or_else(|| Error::InvalidHeader("challenge missing nonce".to_string()))?,
            opaque: get("opaque"),
            algorithm: get("algorithm"),
            qop: get("qop"),
            stale: get("stale").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false),
        })
    }
}

/// An `Authorization` / `Proxy-Authorization` digest credential value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub cnonce: Option<String>,
    pub nc: Option<String>,
}

impl fmt::Display for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        if let Some(algorithm) = &self.algorithm {
            write!(f, ", algorithm={}", algorithm)?;
        }
        if let Some(qop) = &self.qop {
            write!(f, ", qop={}", qop)?;
        }
        if let Some(cnonce) = &self.cnonce {
            write!(f, ", cnonce=\"{}\"", cnonce)?;
        }
        if let Some(nc) = &self.nc {
            write!(f, ", nc={}", nc)?;
        }
        Ok(())
    }
}

impl FromStr for DigestCredentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = strip_digest(s)?;
        let params = parse_comma_params(rest);
        let get = |name: &str| {
            params.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone())
        };
        let require = |name: &'static str| {
            get(name).ok_or_else(|| Error::InvalidHeader(format!("credentials missing {}", name)))
        };
        Ok(DigestCredentials {
            username: require("username")?,
            realm: require("realm")?,
            nonce: require("nonce")?,
            uri: require("uri")?,
            response: require("response")?,
            opaque: get("opaque"),
            algorithm: get("algorithm"),
            qop: get("qop"),
            cnonce: get("cnonce"),
            nc: get("nc"),
        })
    }
}

fn strip_digest(s: &str) -> Result<&str> {
    let s = s.trim();
    if s.len() >= 7 && s[..6].eq_ignore_ascii_case("digest") {
        Ok(s[6..].trim_start())
    } else {
        Err(Error::InvalidHeader(format!("not a Digest value: {}", s)))
    }
}

/// Split `name=value, name="value"` lists, honouring quotes.
fn parse_comma_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut depth_quoted = false;
    let mut start = 0usize;
    let bytes = s.as_bytes();
    let mut pieces = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => depth_quoted = !depth_quoted,
            b',' if !depth_quoted => {
                pieces.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&s[start..]);

    for piece in pieces {
        if let Some((n, v)) = piece.split_once('=') {
            let v = v.trim();
            let v = v.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(v);
            out.push((n.trim().to_string(), v.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_round_trip() {
        let src = "Digest realm=\"atlanta.com\", nonce=\"84a4cc6f3082121f32b42a2187831a9e\", qop=\"auth\"";
        let ch: DigestChallenge = src.parse().unwrap();
        assert_eq!(ch.realm, "atlanta.com");
        assert_eq!(ch.qop.as_deref(), Some("auth"));
        assert!(!ch.stale);
        let reparsed: DigestChallenge = ch.to_string().parse().unwrap();
        assert_eq!(reparsed, ch);
    }

    #[test]
    fn credentials_round_trip() {
        let cred = DigestCredentials {
            username: "alice".to_string(),
            realm: "atlanta.com".to_string(),
            nonce: "84a4cc6f".to_string(),
            uri: "sip:bob@biloxi.com".to_string(),
            response: "7587245234b3434cc3412213e5f113a5".to_string(),
            opaque: None,
            algorithm: Some("MD5".to_string()),
            qop: Some("auth".to_string()),
            cnonce: Some("0a4f113b".to_string()),
            nc: Some("00000001".to_string()),
        };
        let reparsed: DigestCredentials = cred.to_string().parse().unwrap();
        assert_eq!(reparsed, cred);
    }

    #[test]
    fn rejects_basic() {
        assert!("Basic realm=\"x\"".parse::<DigestChallenge>().is_err());
    }
}
