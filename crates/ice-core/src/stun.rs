//! STUN message codec (RFC 5389).
//!
//! 20-byte header plus TLV attributes. Encoding writes the length
//! last and appends MESSAGE-INTEGRITY (HMAC-SHA1) and FINGERPRINT
//! (CRC32 xor 0x5354554E) on request; decoding validates the magic
//! cookie, the length, the fingerprint when present, and the
//! integrity against a caller-supplied key.

use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;
use sha1::Sha1;

use crate::error::{Error, Result};

/// STUN message header size
pub const STUN_HEADER_SIZE: usize = 20;

/// STUN magic cookie value (RFC 5389)
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// XOR mask applied to the CRC32 in FINGERPRINT
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

const INTEGRITY_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// STUN message types used by the ICE core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
    BindingIndication,
    /// Anything else, raw class/method bits.
    Other(u16),
}

impl StunMessageType {
    pub fn to_u16(self) -> u16 {
        match self {
            Self::BindingRequest => 0x0001,
            Self::BindingResponse => 0x0101,
            Self::BindingErrorResponse => 0x0111,
            Self::BindingIndication => 0x0011,
            Self::Other(raw) => raw,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0001 => Self::BindingRequest,
            0x0101 => Self::BindingResponse,
            0x0111 => Self::BindingErrorResponse,
            0x0011 => Self::BindingIndication,
            other => Self::Other(other),
        }
    }

    pub fn is_request(&self) -> bool {
        self.to_u16() & 0x0110 == 0x0000
    }

    pub fn is_success_response(&self) -> bool {
        self.to_u16() & 0x0110 == 0x0100
    }

    pub fn is_error_response(&self) -> bool {
        self.to_u16() & 0x0110 == 0x0110
    }
}

/// STUN attribute types the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunAttributeType {
    MappedAddress,
    XorMappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    Realm,
    Nonce,
    Software,
    Priority,
    UseCandidate,
    Fingerprint,
    IceControlled,
    IceControlling,
    Other(u16),
}

impl From<u16> for StunAttributeType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => Self::MappedAddress,
            0x0020 => Self::XorMappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x8022 => Self::Software,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            other => Self::Other(other),
        }
    }
}

impl From<StunAttributeType> for u16 {
    fn from(attr_type: StunAttributeType) -> Self {
        match attr_type {
            StunAttributeType::MappedAddress => 0x0001,
            StunAttributeType::XorMappedAddress => 0x0020,
            StunAttributeType::Username => 0x0006,
            StunAttributeType::MessageIntegrity => 0x0008,
            StunAttributeType::ErrorCode => 0x0009,
            StunAttributeType::UnknownAttributes => 0x000A,
            StunAttributeType::Realm => 0x0014,
            StunAttributeType::Nonce => 0x0015,
            StunAttributeType::Software => 0x8022,
            StunAttributeType::Priority => 0x0024,
            StunAttributeType::UseCandidate => 0x0025,
            StunAttributeType::Fingerprint => 0x8028,
            StunAttributeType::IceControlled => 0x8029,
            StunAttributeType::IceControlling => 0x802A,
            StunAttributeType::Other(value) => value,
        }
    }
}

/// One TLV attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    pub attr_type: StunAttributeType,
    pub value: Bytes,
}

impl StunAttribute {
    pub fn new(attr_type: StunAttributeType, value: Bytes) -> Self {
        Self { attr_type, value }
    }

    /// MAPPED-ADDRESS (plain, un-XORed).
    pub fn mapped_address(addr: SocketAddr) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u8(0);
        value.put_u8(match addr.ip() {
            IpAddr::V4(_) => 1,
            IpAddr::V6(_) => 2,
        });
        value.put_u16(addr.port());
        match addr.ip() {
            IpAddr::V4(ip) => value.put_slice(&ip.octets()),
            IpAddr::V6(ip) => value.put_slice(&ip.octets()),
        }
        Self::new(StunAttributeType::MappedAddress, value.freeze())
    }

    /// XOR-MAPPED-ADDRESS per RFC 5389 §15.2.
    pub fn xor_mapped_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Self {
        let mut value = BytesMut::with_capacity(20);
        value.put_u8(0);
        value.put_u8(match addr.ip() {
            IpAddr::V4(_) => 1,
            IpAddr::V6(_) => 2,
        });
        value.put_u16(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
        match addr.ip() {
            IpAddr::V4(ip) => {
                value.put_u32(u32::from_be_bytes(ip.octets()) ^ STUN_MAGIC_COOKIE);
            }
            IpAddr::V6(ip) => {
                let octets = ip.octets();
                let mut xored = [0u8; 16];
                for (i, x) in xored.iter_mut().enumerate().take(4) {
                    *x = octets[i] ^ ((STUN_MAGIC_COOKIE >> (24 - i * 8)) & 0xff) as u8;
                }
                for i in 0..12 {
                    xored[i + 4] = octets[i + 4] ^ transaction_id[i];
                }
                value.put_slice(&xored);
            }
        }
        Self::new(StunAttributeType::XorMappedAddress, value.freeze())
    }

    pub fn username(username: &str) -> Self {
        Self::new(StunAttributeType::Username, Bytes::copy_from_slice(username.as_bytes()))
    }

    pub fn software(software: &str) -> Self {
        Self::new(StunAttributeType::Software, Bytes::copy_from_slice(software.as_bytes()))
    }

    pub fn priority(priority: u32) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(priority);
        Self::new(StunAttributeType::Priority, value.freeze())
    }

    pub fn use_candidate() -> Self {
        Self::new(StunAttributeType::UseCandidate, Bytes::new())
    }

    pub fn ice_controlling(tie_breaker: u64) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u64(tie_breaker);
        Self::new(StunAttributeType::IceControlling, value.freeze())
    }

    pub fn ice_controlled(tie_breaker: u64) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u64(tie_breaker);
        Self::new(StunAttributeType::IceControlled, value.freeze())
    }

    /// ERROR-CODE: class/number plus reason phrase.
    pub fn error_code(code: u16, reason: &str) -> Self {
        let mut value = BytesMut::with_capacity(4 + reason.len());
        value.put_u16(0);
        value.put_u8((code / 100) as u8);
        value.put_u8((code % 100) as u8);
        value.put_slice(reason.as_bytes());
        Self::new(StunAttributeType::ErrorCode, value.freeze())
    }

    /// UNKNOWN-ATTRIBUTES: list of 16-bit attribute types.
    pub fn unknown_attributes(types: &[u16]) -> Self {
        let mut value = BytesMut::with_capacity(types.len() * 2);
        for t in types {
            value.put_u16(*t);
        }
        Self::new(StunAttributeType::UnknownAttributes, value.freeze())
    }

    /// Decode an (XOR-)MAPPED-ADDRESS value.
    pub fn as_socket_addr(&self, transaction_id: &[u8; 12]) -> Result<SocketAddr> {
        let xored = match self.attr_type {
            StunAttributeType::XorMappedAddress => true,
            StunAttributeType::MappedAddress => false,
            _ => return Err(Error::Stun("not an address attribute".to_string())),
        };
        if self.value.len() < 8 {
            return Err(Error::Stun("address attribute too short".to_string()));
        }
        let mut value = self.value.clone();
        value.advance(1);
        let family = value.get_u8();
        let raw_port = value.get_u16();
        let port =
            if xored { raw_port ^ (STUN_MAGIC_COOKIE >> 16) as u16 } else { raw_port };
        let ip = match family {
            1 => {
                let raw = value.get_u32();
                let host = if xored { raw ^ STUN_MAGIC_COOKIE } else { raw };
                IpAddr::from(host.to_be_bytes())
            }
            2 => {
                if value.remaining() < 16 {
                    return Err(Error::Stun("truncated IPv6 address".to_string()));
                }
                let mut octets = [0u8; 16];
                value.copy_to_slice(&mut octets);
                if xored {
                    for (i, o) in octets.iter_mut().enumerate().take(4) {
                        *o ^= ((STUN_MAGIC_COOKIE >> (24 - i * 8)) & 0xff) as u8;
                    }
                    for i in 0..12 {
                        octets[i + 4] ^= transaction_id[i];
                    }
                }
                IpAddr::from(octets)
            }
            other => {
                return Err(Error::Stun(format!("unsupported address family: {}", other)));
            }
        };
        Ok(SocketAddr::new(ip, port))
    }

    /// Decode an ERROR-CODE value to (code, reason).
    pub fn as_error_code(&self) -> Result<(u16, String)> {
        if self.attr_type != StunAttributeType::ErrorCode || self.value.len() < 4 {
            return Err(Error::Stun("not an ERROR-CODE attribute".to_string()));
        }
        let class = (self.value[2] & 0x07) as u16;
        let number = self.value[3] as u16;
        let reason = String::from_utf8_lossy(&self.value[4..]).to_string();
        Ok((class * 100 + number, reason))
    }

    /// Decode a 32-bit value (PRIORITY).
    pub fn as_u32(&self) -> Result<u32> {
        if self.value.len() != 4 {
            return Err(Error::Stun("attribute is not 32-bit".to_string()));
        }
        Ok(BigEndian::read_u32(&self.value))
    }

    /// Decode a 64-bit value (ICE-CONTROLLING / ICE-CONTROLLED).
    pub fn as_u64(&self) -> Result<u64> {
        if self.value.len() != 8 {
            return Err(Error::Stun("attribute is not 64-bit".to_string()));
        }
        Ok(BigEndian::read_u64(&self.value))
    }
}

/// A decoded or under-construction STUN message.
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub msg_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
    /// Original wire bytes (decode only), needed for integrity
    /// verification.
    raw: Option<Bytes>,
    /// Offset of the MESSAGE-INTEGRITY attribute in `raw`.
    integrity_offset: Option<usize>,
}

impl PartialEq for StunMessage {
    fn eq(&self, other: &Self) -> bool {
        // Integrity and fingerprint are transport artifacts; two
        // messages are equal when the meaningful content matches.
        let strip = |attrs: &[StunAttribute]| -> Vec<StunAttribute> {
            attrs
                .iter()
                .filter(|a| {
                    !matches!(
                        a.attr_type,
                        StunAttributeType::MessageIntegrity | StunAttributeType::Fingerprint
                    )
                })
                .cloned()
                .collect()
        };
        self.msg_type == other.msg_type
            && self.transaction_id == other.transaction_id
            && strip(&self.attributes) == strip(&other.attributes)
    }
}

impl StunMessage {
    pub fn new(msg_type: StunMessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill(&mut transaction_id);
        Self { msg_type, transaction_id, attributes: Vec::new(), raw: None, integrity_offset: None }
    }

    pub fn binding_request() -> Self {
        Self::new(StunMessageType::BindingRequest)
    }

    pub fn binding_indication() -> Self {
        Self::new(StunMessageType::BindingIndication)
    }

    /// Success response echoing a request's transaction id.
    pub fn binding_response(transaction_id: [u8; 12]) -> Self {
        Self {
            msg_type: StunMessageType::BindingResponse,
            transaction_id,
            attributes: Vec::new(),
            raw: None,
            integrity_offset: None,
        }
    }

    /// Error response echoing a request's transaction id.
    pub fn binding_error(transaction_id: [u8; 12], code: u16, reason: &str) -> Self {
        let mut msg = Self {
            msg_type: StunMessageType::BindingErrorResponse,
            transaction_id,
            attributes: Vec::new(),
            raw: None,
            integrity_offset: None,
        };
        msg.add_attribute(StunAttribute::error_code(code, reason));
        msg
    }

    pub fn add_attribute(&mut self, attr: StunAttribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    pub fn attribute(&self, attr_type: StunAttributeType) -> Option<&StunAttribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Encode without integrity or fingerprint.
    pub fn encode(&self) -> Bytes {
        self.encode_with(None, false)
    }

    /// Encode, appending MESSAGE-INTEGRITY (when a key is given) and
    /// FINGERPRINT (when requested), filling the length field last.
    pub fn encode_with(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16(self.msg_type.to_u16());
        buf.put_u16(0); // length, patched below
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        for attr in &self.attributes {
            // Integrity/fingerprint are always recomputed, never
            // copied through.
            if matches!(
                attr.attr_type,
                StunAttributeType::MessageIntegrity | StunAttributeType::Fingerprint
            ) {
                continue;
            }
            put_attribute(&mut buf, attr);
        }

        if let Some(key) = integrity_key {
            // Length as if the message ended right after the
            // integrity attribute (RFC 5389 §15.4).
            let hashed_len = buf.len() - STUN_HEADER_SIZE + 4 + INTEGRITY_LEN;
            BigEndian::write_u16(&mut buf[2..4], hashed_len as u16);
            let mac = hmac_sha1(key, &buf);
            put_attribute(
                &mut buf,
                &StunAttribute::new(
                    StunAttributeType::MessageIntegrity,
                    Bytes::copy_from_slice(&mac),
                ),
            );
        }

        if fingerprint {
            let final_len = buf.len() - STUN_HEADER_SIZE + 8;
            BigEndian::write_u16(&mut buf[2..4], final_len as u16);
            let crc = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;
            let mut value = BytesMut::with_capacity(4);
            value.put_u32(crc);
            put_attribute(
                &mut buf,
                &StunAttribute::new(StunAttributeType::Fingerprint, value.freeze()),
            );
        }

        let total_len = buf.len() - STUN_HEADER_SIZE;
        BigEndian::write_u16(&mut buf[2..4], total_len as u16);
        buf.freeze()
    }

    /// Quick check whether a datagram plausibly is STUN.
    pub fn looks_like_stun(data: &[u8]) -> bool {
        data.len() >= STUN_HEADER_SIZE
            && data[0] & 0xC0 == 0
            && BigEndian::read_u32(&data[4..8]) == STUN_MAGIC_COOKIE
    }

    /// Decode a message, validating cookie, length and (when present)
    /// the fingerprint. Integrity is checked separately via
    /// [`StunMessage::verify_integrity`] or [`decode_with_key`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STUN_HEADER_SIZE {
            return Err(Error::Stun("packet too small for STUN header".to_string()));
        }
        if bytes[0] & 0xC0 != 0 {
            return Err(Error::Stun("first two bits not zero".to_string()));
        }
        let msg_type = StunMessageType::from_u16(BigEndian::read_u16(&bytes[0..2]));
        let msg_len = BigEndian::read_u16(&bytes[2..4]) as usize;
        if BigEndian::read_u32(&bytes[4..8]) != STUN_MAGIC_COOKIE {
            return Err(Error::Stun("bad magic cookie".to_string()));
        }
        if msg_len % 4 != 0 || bytes.len() < STUN_HEADER_SIZE + msg_len {
            return Err(Error::Stun("bad message length".to_string()));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let mut attributes = Vec::new();
        let mut integrity_offset = None;
        let mut fingerprint_offset = None;
        let mut offset = STUN_HEADER_SIZE;
        let end = STUN_HEADER_SIZE + msg_len;
        while offset + 4 <= end {
            let attr_type_raw = BigEndian::read_u16(&bytes[offset..offset + 2]);
            let attr_len = BigEndian::read_u16(&bytes[offset + 2..offset + 4]) as usize;
            if offset + 4 + attr_len > end {
                return Err(Error::Stun("truncated attribute".to_string()));
            }
            let attr_type = StunAttributeType::from(attr_type_raw);
            if attr_type == StunAttributeType::MessageIntegrity && integrity_offset.is_none() {
                integrity_offset = Some(offset);
            }
            if attr_type == StunAttributeType::Fingerprint {
                fingerprint_offset = Some(offset);
            }
            attributes.push(StunAttribute {
                attr_type,
                value: Bytes::copy_from_slice(&bytes[offset + 4..offset + 4 + attr_len]),
            });
            offset += 4 + attr_len;
            offset += (4 - (attr_len % 4)) % 4;
        }

        let message = Self {
            msg_type,
            transaction_id,
            attributes,
            raw: Some(Bytes::copy_from_slice(&bytes[..end])),
            integrity_offset,
        };

        // FINGERPRINT covers everything before itself.
        if let Some(fp_offset) = fingerprint_offset {
            let attr = message
                .attribute(StunAttributeType::Fingerprint)
                .expect("fingerprint attribute recorded");
            let wire_crc = BigEndian::read_u32(&attr.value);
            let mut covered = bytes[..fp_offset].to_vec();
            BigEndian::write_u16(&mut covered[2..4], (fp_offset - STUN_HEADER_SIZE + 8) as u16);
            if crc32fast::hash(&covered) ^ FINGERPRINT_XOR != wire_crc {
                return Err(Error::FingerprintMismatch);
            }
        }

        Ok(message)
    }

    /// Decode and verify MESSAGE-INTEGRITY with `key`. A missing or
    /// wrong integrity attribute is an [`Error::IntegrityCheckFailure`].
    pub fn decode_with_key(bytes: &[u8], key: &[u8]) -> Result<Self> {
        let message = Self::decode(bytes)?;
        message.verify_integrity(key)?;
        Ok(message)
    }

    /// Verify MESSAGE-INTEGRITY on a previously decoded message.
    pub fn verify_integrity(&self, key: &[u8]) -> Result<()> {
        let (raw, offset) = match (&self.raw, self.integrity_offset) {
            (Some(raw), Some(offset)) => (raw, offset),
            _ => return Err(Error::IntegrityCheckFailure),
        };
        let attr = self
            .attribute(StunAttributeType::MessageIntegrity)
            .ok_or(Error::IntegrityCheckFailure)?;
        if attr.value.len() != INTEGRITY_LEN {
            return Err(Error::IntegrityCheckFailure);
        }
        let mut covered = raw[..offset].to_vec();
        BigEndian::write_u16(
            &mut covered[2..4],
            (offset - STUN_HEADER_SIZE + 4 + INTEGRITY_LEN) as u16,
        );
        let expected = hmac_sha1(key, &covered);
        if expected[..] == attr.value[..] {
            Ok(())
        } else {
            Err(Error::IntegrityCheckFailure)
        }
    }
}

fn put_attribute(buf: &mut BytesMut, attr: &StunAttribute) {
    let attr_type: u16 = attr.attr_type.into();
    buf.put_u16(attr_type);
    buf.put_u16(attr.value.len() as u16);
    buf.put_slice(&attr.value);
    let padding = (4 - (attr.value.len() % 4)) % 4;
    for _ in 0..padding {
        buf.put_u8(0);
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut result = [0u8; 20];
    result.copy_from_slice(&out);
    result
}

/// Short-term credential key: the password bytes themselves.
pub fn short_term_key(password: &str) -> Vec<u8> {
    password.as_bytes().to_vec()
}

/// Long-term credential key: MD5 of `username:realm:password`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password).as_bytes());
    hasher.finalize().to_vec()
}
