//! SDP session descriptions (RFC 4566) and the queries the
//! offer/answer engine needs.
//!
//! Equality of SDP values is structural: two descriptions compare
//! equal when their parsed trees match, regardless of the bytes they
//! came from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Media stream direction, from the RFC 3264 attribute set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn attribute_name(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// The direction the answerer mirrors back (RFC 3264 §6.1).
    pub fn reversed(&self) -> Direction {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

/// `o=` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub username: String,
    pub sess_id: u64,
    pub sess_version: u64,
    pub addr_type: String,
    pub unicast_address: String,
}

impl Origin {
    pub fn new(address: impl Into<String>) -> Self {
        Origin {
            username: "-".to_string(),
            sess_id: 0,
            sess_version: 0,
            addr_type: "IP4".to_string(),
            unicast_address: address.into(),
        }
    }
}

/// `c=` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub addr_type: String,
    pub address: String,
}

impl Connection {
    pub fn ip4(address: impl Into<String>) -> Self {
        Connection { addr_type: "IP4".to_string(), address: address.into() }
    }

    /// The `0.0.0.0` hold address from old-school RFC 2543 hold.
    pub fn is_null_address(&self) -> bool {
        self.address == "0.0.0.0"
    }
}

/// `a=` line: `name[:value]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpAttribute {
    pub name: String,
    pub value: Option<String>,
}

impl SdpAttribute {
    pub fn flag(name: impl Into<String>) -> Self {
        SdpAttribute { name: name.into(), value: None }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        SdpAttribute { name: name.into(), value: Some(value.into()) }
    }
}

/// Decoded `a=rtpmap` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rtpmap {
    pub payload: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl Rtpmap {
    /// Parse `96 opus/48000/2` style rtpmap values.
    fn parse(value: &str) -> Option<Rtpmap> {
        let (pt, rest) = value.split_once(char::is_whitespace)?;
        let payload = pt.parse().ok()?;
        let mut fields = rest.trim().split('/');
        let encoding = fields.next()?.to_string();
        let clock_rate = fields.next()?.parse().ok()?;
        let channels = match fields.next() {
            Some(c) => c.parse().ok()?,
            None => 1,
        };
        Some(Rtpmap { payload, encoding, clock_rate, channels })
    }
}

/// One `m=` block with its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// Media type token, e.g. `audio`.
    pub media: String,
    pub port: u16,
    /// `RTP/AVP` or `RTP/SAVP`.
    pub transport: String,
    /// Payload type tokens in preference order.
    pub formats: Vec<String>,
    pub connection: Option<Connection>,
    pub attributes: Vec<SdpAttribute>,
}

impl MediaDescription {
    pub fn audio(port: u16) -> Self {
        MediaDescription {
            media: "audio".to_string(),
            port,
            transport: "RTP/AVP".to_string(),
            formats: Vec::new(),
            attributes: Vec::new(),
            connection: None,
        }
    }

    pub fn push_format(&mut self, payload: u8, encoding: &str, clock_rate: u32, channels: u8) {
        self.formats.push(payload.to_string());
        let rtpmap = if channels > 1 {
            format!("{} {}/{}/{}", payload, encoding, clock_rate, channels)
        } else {
            format!("{} {}/{}", payload, encoding, clock_rate)
        };
        self.attributes.push(SdpAttribute::value("rtpmap", rtpmap));
    }

    pub fn attribute(&self, name: &str) -> Option<&SdpAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Explicit direction attribute; `sendrecv` is the RFC default.
    pub fn direction(&self) -> Direction {
        for attr in &self.attributes {
            match attr.name.as_str() {
                "sendrecv" => return Direction::SendRecv,
                "sendonly" => return Direction::SendOnly,
                "recvonly" => return Direction::RecvOnly,
                "inactive" => return Direction::Inactive,
                _ => {}
            }
        }
        Direction::SendRecv
    }

    /// Replace any direction attribute with the given one.
    pub fn set_direction(&mut self, direction: Direction) {
        self.attributes
            .retain(|a| !matches!(a.name.as_str(), "sendrecv" | "sendonly" | "recvonly" | "inactive"));
        self.attributes.push(SdpAttribute::flag(direction.attribute_name()));
    }

    /// The rtpmap entry for a payload number, if present.
    pub fn rtpmap(&self, payload: u8) -> Option<Rtpmap> {
        self.attributes
            .iter()
            .filter(|a| a.name == "rtpmap")
            .filter_map(|a| a.value.as_deref().and_then(Rtpmap::parse))
            .find(|r| r.payload == payload)
    }

    /// `a=fmtp` value for a payload number.
    pub fn fmtp(&self, payload: u8) -> Option<&str> {
        let prefix = payload.to_string();
        self.attributes.iter().filter(|a| a.name == "fmtp").find_map(|a| {
            let v = a.value.as_deref()?;
            let (pt, rest) = v.split_once(char::is_whitespace)?;
            (pt == prefix).then(|| rest.trim())
        })
    }

    /// `a=ptime` in milliseconds.
    pub fn ptime(&self) -> Option<u32> {
        self.attribute("ptime").and_then(|a| a.value.as_deref()).and_then(|v| v.parse().ok())
    }

    /// SRTP keying attributes (`a=crypto`), in order.
    pub fn crypto_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().filter(|a| a.name == "crypto").filter_map(|a| a.value.as_deref())
    }

    /// True when this stream is secured (RTP/SAVP transport).
    pub fn is_srtp(&self) -> bool {
        self.transport.eq_ignore_ascii_case("RTP/SAVP")
    }

    /// A disabled stream per RFC 3264 (port zero).
    pub fn is_disabled(&self) -> bool {
        self.port == 0
    }
}

/// A full session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `v=`; always 0 today.
    pub version: u32,
    pub origin: Origin,
    /// `s=` line.
    pub session_name: String,
    pub connection: Option<Connection>,
    /// `t=` lines as (start, stop) pairs.
    pub times: Vec<(u64, u64)>,
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// A minimal audio session rooted at `address`.
    pub fn new(address: impl Into<String> + Clone) -> Self {
        SessionDescription {
            version: 0,
            origin: Origin::new(address.clone()),
            session_name: "-".to_string(),
            connection: Some(Connection::ip4(address)),
            times: vec![(0, 0)],
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    /// First audio media block.
    pub fn audio_media(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media == "audio")
    }

    pub fn audio_media_mut(&mut self) -> Option<&mut MediaDescription> {
        self.media.iter_mut().find(|m| m.media == "audio")
    }

    /// The connection that applies to a media block (media-level wins
    /// over session-level).
    pub fn connection_for(&self, media_index: usize) -> Option<&Connection> {
        self.media.get(media_index).and_then(|m| m.connection.as_ref()).or(self.connection.as_ref())
    }

    /// True when the description places the peer on hold: either the
    /// null connection address, or a non-receiving direction.
    pub fn is_hold(&self) -> bool {
        if let Some(c) = &self.connection {
            if c.is_null_address() {
                return true;
            }
        }
        self.media.iter().enumerate().any(|(i, m)| {
            self.connection_for(i).map(Connection::is_null_address).unwrap_or(false)
                || matches!(m.direction(), Direction::SendOnly | Direction::Inactive)
        })
    }

    /// Serialise per RFC 4566 line ordering.
    pub fn print(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.sess_id,
            self.origin.sess_version,
            self.origin.addr_type,
            self.origin.unicast_address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c=IN {} {}\r\n", c.addr_type, c.address)?;
        }
        for (start, stop) in &self.times {
            write!(f, "t={} {}\r\n", start, stop)?;
        }
        for attr in &self.attributes {
            write_attribute(f, attr)?;
        }
        for m in &self.media {
            write!(f, "m={} {} {} {}\r\n", m.media, m.port, m.transport, m.formats.join(" "))?;
            if let Some(c) = &m.connection {
                write!(f, "c=IN {} {}\r\n", c.addr_type, c.address)?;
            }
            for attr in &m.attributes {
                write_attribute(f, attr)?;
            }
        }
        Ok(())
    }
}

fn write_attribute(f: &mut fmt::Formatter<'_>, attr: &SdpAttribute) -> fmt::Result {
    match &attr.value {
        Some(v) => write!(f, "a={}:{}\r\n", attr.name, v),
        None => write!(f, "a={}\r\n", attr.name),
    }
}

impl FromStr for SessionDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut version = None;
        let mut origin = None;
        let mut session_name = None;
        let mut connection = None;
        let mut times = Vec::new();
        let mut attributes = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for raw in s.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| Error::SdpParse(format!("line without '=': {}", line)))?;
            if kind.len() != 1 {
                return Err(Error::SdpParse(format!("bad line type: {}", line)));
            }
            let in_media = media.last_mut();
            match kind.as_bytes()[0] {
                b'v' => {
                    version = Some(
                        value.trim().parse().map_err(|_| Error::SdpParse("bad v= line".into()))?,
                    )
                }
                b'o' => origin = Some(parse_origin(value)?),
                b's' => session_name = Some(value.to_string()),
                b'c' => {
                    let conn = parse_connection(value)?;
                    match in_media {
                        Some(m) => m.connection = Some(conn),
                        None => connection = Some(conn),
                    }
                }
                b't' => {
                    let (start, stop) = value
                        .trim()
                        .split_once(' ')
                        .ok_or_else(|| Error::SdpParse("bad t= line".into()))?;
                    times.push((
                        start.parse().map_err(|_| Error::SdpParse("bad t= start".into()))?,
                        stop.parse().map_err(|_| Error::SdpParse("bad t= stop".into()))?,
                    ));
                }
                b'a' => {
                    let attr = match value.split_once(':') {
                        Some((n, v)) => SdpAttribute::value(n, v),
                        None => SdpAttribute::flag(value),
                    };
                    match in_media {
                        Some(m) => m.attributes.push(attr),
                        None => attributes.push(attr),
                    }
                }
                b'm' => media.push(parse_media_line(value)?),
                // b=, k=, i=, u=, e=, p=, z=, r= are tolerated and dropped.
                _ => {}
            }
        }

        Ok(SessionDescription {
            version: version.ok_or_else(|| Error::SdpParse("missing v= line".into()))?,
            origin: origin.ok_or_else(|| Error::SdpParse("missing o= line".into()))?,
            session_name: session_name.ok_or_else(|| Error::SdpParse("missing s= line".into()))?,
            connection,
            times,
            attributes,
            media,
        })
    }
}

fn parse_origin(value: &str) -> Result<Origin> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 6 || fields[3] != "IN" {
        return Err(Error::SdpParse(format!("bad o= line: {}", value)));
    }
    Ok(Origin {
        username: fields[0].to_string(),
        sess_id: fields[1].parse().map_err(|_| Error::SdpParse("bad o= sess-id".into()))?,
        sess_version: fields[2].parse().map_err(|_| Error::SdpParse("bad o= version".into()))?,
        addr_type: fields[4].to_string(),
        unicast_address: fields[5].to_string(),
    })
}

fn parse_connection(value: &str) -> Result<Connection> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 3 || fields[0] != "IN" {
        return Err(Error::SdpParse(format!("bad c= line: {}", value)));
    }
    Ok(Connection { addr_type: fields[1].to_string(), address: fields[2].to_string() })
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Error::SdpParse(format!("bad m= line: {}", value)));
    }
    // `port/count` notation: the count is irrelevant for unicast audio.
    let port_field = fields[1].split('/').next().unwrap_or(fields[1]);
    Ok(MediaDescription {
        media: fields[0].to_string(),
        port: port_field.parse().map_err(|_| Error::SdpParse("bad m= port".into()))?,
        transport: fields[2].to_string(),
        formats: fields[3..].iter().map(|s| s.to_string()).collect(),
        connection: None,
        attributes: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 atlanta.com\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.101\r\n\
        t=0 0\r\n\
        m=audio 49172 RTP/AVP 0 8 96\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:96 opus/48000/2\r\n\
        a=ptime:20\r\n";

    #[test]
    fn parse_offer() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        assert_eq!(sdp.version, 0);
        assert_eq!(sdp.origin.username, "alice");
        assert_eq!(sdp.connection.as_ref().unwrap().address, "192.0.2.101");
        let audio = sdp.audio_media().unwrap();
        assert_eq!(audio.port, 49172);
        assert_eq!(audio.formats, vec!["0", "8", "96"]);
        assert_eq!(audio.ptime(), Some(20));
        let opus = audio.rtpmap(96).unwrap();
        assert_eq!(opus.encoding, "opus");
        assert_eq!(opus.channels, 2);
    }

    #[test]
    fn print_parse_round_trip_is_structural_identity() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        let printed = sdp.print();
        let reparsed: SessionDescription = printed.parse().unwrap();
        assert_eq!(reparsed, sdp);
    }

    #[test]
    fn equality_is_structural_not_textual() {
        // Same tree from different whitespace/line endings.
        let crlf: SessionDescription = OFFER.parse().unwrap();
        let lf: SessionDescription = OFFER.replace("\r\n", "\n").parse().unwrap();
        assert_eq!(crlf, lf);
    }

    #[test]
    fn direction_defaults_to_sendrecv() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        assert_eq!(sdp.audio_media().unwrap().direction(), Direction::SendRecv);
    }

    #[test]
    fn hold_detection() {
        let mut sdp: SessionDescription = OFFER.parse().unwrap();
        assert!(!sdp.is_hold());
        sdp.audio_media_mut().unwrap().set_direction(Direction::SendOnly);
        assert!(sdp.is_hold());

        let mut null_c: SessionDescription = OFFER.parse().unwrap();
        null_c.connection = Some(Connection::ip4("0.0.0.0"));
        assert!(null_c.is_hold());
    }

    #[test]
    fn media_level_connection_wins() {
        let mut sdp: SessionDescription = OFFER.parse().unwrap();
        sdp.media[0].connection = Some(Connection::ip4("198.51.100.7"));
        assert_eq!(sdp.connection_for(0).unwrap().address, "198.51.100.7");
    }

    #[test]
    fn set_direction_replaces_existing() {
        let mut sdp: SessionDescription = OFFER.parse().unwrap();
        sdp.audio_media_mut().unwrap().set_direction(Direction::SendOnly);
        sdp.audio_media_mut().unwrap().set_direction(Direction::SendRecv);
        let dirs = sdp
            .audio_media()
            .unwrap()
            .attributes
            .iter()
            .filter(|a| a.name == "sendonly" || a.name == "sendrecv")
            .count();
        assert_eq!(dirs, 1);
    }

    #[test]
    fn fmtp_lookup() {
        let raw = format!("{}a=fmtp:96 useinbandfec=1\r\n", OFFER);
        let sdp: SessionDescription = raw.parse().unwrap();
        assert_eq!(sdp.audio_media().unwrap().fmtp(96), Some("useinbandfec=1"));
        assert_eq!(sdp.audio_media().unwrap().fmtp(0), None);
    }

    #[test]
    fn missing_mandatory_line_is_an_error() {
        assert!("v=0\r\ns=-\r\n".parse::<SessionDescription>().is_err());
    }

    #[test]
    fn srtp_transport_detection() {
        let raw = OFFER.replace("RTP/AVP", "RTP/SAVP");
        let sdp: SessionDescription = raw.parse().unwrap();
        assert!(sdp.audio_media().unwrap().is_srtp());
    }
}
