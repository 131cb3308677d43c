//! Name-addr values used by From, To, Contact, Route and friends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::uri::Uri;

/// A display name plus URI plus header parameters, e.g.
/// `"Alice" <sip:alice@atlanta.com>;tag=1928301774`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: Uri,
    /// Header parameters after the closing `>`, in order.
    pub params: Vec<(String, Option<String>)>,
}

impl Address {
    pub fn new(uri: Uri) -> Self {
        Address { display_name: None, uri, params: Vec::new() }
    }

    pub fn with_display_name(name: impl Into<String>, uri: Uri) -> Self {
        Address { display_name: Some(name.into()), uri, params: Vec::new() }
    }

    /// Look up a header parameter by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Set or replace a header parameter.
    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        if let Some(slot) = self.params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
    }

    /// The `tag` parameter, if any.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag").flatten()
    }

    /// Set the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.set_param("tag", Some(tag.into()));
    }

    /// Contact `q` preference in [0.0, 1.0]; absent means 1.0.
    pub fn q_value(&self) -> f32 {
        self.param("q").flatten().and_then(|v| v.parse::<f32>().ok()).unwrap_or(1.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) if needs_quoting(name) => write!(f, "\"{}\" <{}>", name, self.uri)?,
            Some(name) => write!(f, "{} <{}>", name, self.uri)?,
            // Always emit angle brackets so uri-parameters stay inside
            // the addr-spec on reparse.
            None => write!(f, "<{}>", self.uri)?,
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

fn needs_quoting(name: &str) -> bool {
    !name.bytes().all(|b| super::method::is_token_byte(b) || b == b' ')
        || name.contains(' ')
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidHeader("empty address".to_string()));
        }

        // name-addr form: [display-name] "<" addr-spec ">" *(;param)
        if let Some(lt) = find_unquoted(s, b'<') {
            let display = s[..lt].trim();
            let display_name = if display.is_empty() {
                None
            } else if display.starts_with('"') && display.ends_with('"') && display.len() >= 2 {
                Some(display[1..display.len() - 1].replace("\\\"", "\""))
            } else {
                Some(display.to_string())
            };
            let rest = &s[lt + 1..];
            let gt = rest
                .find('>')
                .ok_or_else(|| Error::InvalidHeader(format!("unterminated addr-spec: {}", s)))?;
            let uri: Uri = rest[..gt].parse()?;
            let params = parse_params(&rest[gt + 1..])?;
            return Ok(Address { display_name, uri, params });
        }

        // addr-spec form: params after ';' belong to the header here.
        let (uri_part, param_part) = match s.split_once(';') {
            Some((u, p)) => (u, p),
            None => (s, ""),
        };
        let uri: Uri = uri_part.parse()?;
        let params =
            if param_part.is_empty() { Vec::new() } else { parse_params(&format!(";{}", param_part))? };
        Ok(Address { display_name: None, uri, params })
    }
}

/// Find a byte outside double quotes.
fn find_unquoted(s: &str, needle: u8) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (i, b) in s.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b if b == needle && !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_params(s: &str) -> Result<Vec<(String, Option<String>)>> {
    let mut params = Vec::new();
    let s = s.trim();
    if s.is_empty() {
        return Ok(params);
    }
    for p in s.split(';') {
        let p = p.trim();
        if p.is_empty() {
            continue;
        }
        match p.split_once('=') {
            Some((n, v)) => params.push((n.trim().to_string(), Some(v.trim().to_string()))),
            None => params.push((p.to_string(), None)),
        }
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_addr_with_tag() {
        let addr: Address = "\"Alice\" <sip:alice@atlanta.com>;tag=1928301774".parse().unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag(), Some("1928301774"));
    }

    #[test]
    fn parse_bare_addr_spec() {
        let addr: Address = "sip:bob@biloxi.com;tag=a6c85cf".parse().unwrap();
        assert_eq!(addr.display_name, None);
        assert_eq!(addr.tag(), Some("a6c85cf"));
        // the tag is a header param, not a uri param
        assert!(addr.uri.param("tag").is_none());
    }

    #[test]
    fn uri_params_stay_inside_brackets() {
        let addr: Address = "<sip:proxy.example.com;lr>".parse().unwrap();
        assert!(addr.uri.is_loose_router());
        assert!(addr.params.is_empty());

        let printed = addr.to_string();
        let reparsed: Address = printed.parse().unwrap();
        assert_eq!(reparsed, addr);
    }

    #[test]
    fn unquoted_display_name() {
        let addr: Address = "Bob <sip:bob@biloxi.com>".parse().unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn q_value_ordering() {
        let a: Address = "<sip:a@x>;q=0.5".parse().unwrap();
        let b: Address = "<sip:b@x>".parse().unwrap();
        assert!(a.q_value() < b.q_value());
    }

    #[test]
    fn set_tag_replaces() {
        let mut addr: Address = "<sip:a@x>;tag=one".parse().unwrap();
        addr.set_tag("two");
        assert_eq!(addr.tag(), Some("two"));
        assert_eq!(addr.params.len(), 1);
    }
}
