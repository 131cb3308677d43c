//! SIP request/response messages, access helpers, and the printer.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::header::{CSeq, Header, HeaderName, HeaderValue};
use crate::types::{Address, Method, StatusCode, Uri, Via};

/// SIP protocol version token. Only SIP/2.0 exists on this planet.
pub const SIP_VERSION: &str = "SIP/2.0";

/// Common header-list access for requests and responses.
pub trait HeaderAccess {
    fn headers(&self) -> &[Header];
    fn headers_mut(&mut self) -> &mut Vec<Header>;
    fn body(&self) -> &Bytes;

    /// First header with the given name.
    fn header(&self, name: &HeaderName) -> Option<&Header> {
        self.headers().iter().find(|h| &h.name == name)
    }

    /// All headers with the given name, in insertion order.
    fn headers_named<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a Header> {
        self.headers().iter().filter(move |h| &h.name == name)
    }

    /// Append a header.
    fn push_header(&mut self, header: Header) {
        self.headers_mut().push(header);
    }

    /// Replace the first header of this name, or append.
    fn set_header(&mut self, header: Header) {
        if let Some(slot) = self.headers_mut().iter_mut().find(|h| h.name == header.name) {
            *slot = header;
        } else {
            self.headers_mut().push(header);
        }
    }

    /// Remove every header with the given name.
    fn remove_headers(&mut self, name: &HeaderName) {
        self.headers_mut().retain(|h| &h.name != name);
    }

    fn from_header(&self) -> Option<&Address> {
        self.header(&HeaderName::From).and_then(Header::as_address)
    }

    fn to_header(&self) -> Option<&Address> {
        self.header(&HeaderName::To).and_then(Header::as_address)
    }

    fn call_id(&self) -> Option<&str> {
        match self.header(&HeaderName::CallId).map(|h| &h.value) {
            Some(HeaderValue::Raw(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    fn cseq(&self) -> Option<&CSeq> {
        match self.header(&HeaderName::CSeq).map(|h| &h.value) {
            Some(HeaderValue::CSeq(c)) => Some(c),
            _ => None,
        }
    }

    /// Topmost Via.
    fn via_top(&self) -> Option<&Via> {
        self.header(&HeaderName::Via).and_then(Header::as_via)
    }

    fn contact(&self) -> Option<&Address> {
        self.header(&HeaderName::Contact).and_then(Header::as_address)
    }

    fn content_length(&self) -> Option<u32> {
        match self.header(&HeaderName::ContentLength).map(|h| &h.value) {
            Some(HeaderValue::UInt(n)) => Some(*n),
            _ => None,
        }
    }

    fn content_type(&self) -> Option<&str> {
        match self.header(&HeaderName::ContentType).map(|h| &h.value) {
            Some(HeaderValue::Raw(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Print headers and body per RFC 3261 §7: insertion order, a
    /// Content-Length synthesised when missing, CRLF CRLF closing the
    /// head.
    fn print_into(&self, buf: &mut BytesMut) {
        let mut wrote_content_length = false;
        for header in self.headers() {
            if header.name == HeaderName::ContentLength {
                // Re-emit with the actual body length.
                buf.put_slice(b"Content-Length: ");
                buf.put_slice(self.body().len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                wrote_content_length = true;
                continue;
            }
            buf.put_slice(header.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        if !wrote_content_length {
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(self.body().len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(self.body());
    }
}

/// A SIP request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Request {
    /// New request with empty headers and body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Request { method, uri, headers: Vec::new(), body: Bytes::new() }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.set_header(Header::new(
            HeaderName::ContentType,
            HeaderValue::Raw(content_type.to_string()),
        ));
        self.body = body.into();
        self
    }

    /// Validate the mandatory header set: From, To, Call-ID, CSeq,
    /// at least one Via, and Max-Forwards. The CSeq method must match
    /// the request method.
    pub fn validate(&self) -> Result<()> {
        if self.from_header().is_none() {
            return Err(Error::MissingHeader("From"));
        }
        if self.to_header().is_none() {
            return Err(Error::MissingHeader("To"));
        }
        if self.call_id().is_none() {
            return Err(Error::MissingHeader("Call-ID"));
        }
        let cseq = self.cseq().ok_or(Error::MissingHeader("CSeq"))?;
        if cseq.method != self.method {
            return Err(Error::InvalidHeader(format!(
                "CSeq method {} does not match request method {}",
                cseq.method, self.method
            )));
        }
        if self.via_top().is_none() {
            return Err(Error::MissingHeader("Via"));
        }
        if self.header(&HeaderName::MaxForwards).is_none() {
            return Err(Error::MissingHeader("Max-Forwards"));
        }
        Ok(())
    }

    /// Serialise to wire bytes.
    pub fn print(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.uri.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(SIP_VERSION.as_bytes());
        buf.put_slice(b"\r\n");
        self.print_into(&mut buf);
        buf.freeze()
    }
}

impl HeaderAccess for Request {
    fn headers(&self) -> &[Header] {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
    fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.print()) {
            Ok(s) => f.write_str(s),
            Err(_) => f.write_str("<non-utf8 SIP message>"),
        }
    }
}

/// A SIP response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    /// Overrides the table phrase when set.
    pub reason: Option<String>,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response { status, reason: None, headers: Vec::new(), body: Bytes::new() }
    }

    /// Response with a non-default reason phrase.
    pub fn new_with_reason(status: StatusCode, reason: impl Into<String>) -> Self {
        Response { status, reason: Some(reason.into()), headers: Vec::new(), body: Bytes::new() }
    }

    /// Build a response for a request, copying the headers RFC 3261
    /// §8.2.6.2 requires: all Vias in order, From, To (tag untouched),
    /// Call-ID and CSeq.
    pub fn for_request(status: StatusCode, request: &Request) -> Self {
        let mut response = Response::new(status);
        for header in &request.headers {
            match header.name {
                HeaderName::Via
                | HeaderName::From
                | HeaderName::To
                | HeaderName::CallId
                | HeaderName::CSeq => response.headers.push(header.clone()),
                _ => {}
            }
        }
        response
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.set_header(Header::new(
            HeaderName::ContentType,
            HeaderValue::Raw(content_type.to_string()),
        ));
        self.body = body.into();
        self
    }

    /// Effective reason phrase.
    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| self.status.reason_phrase())
    }

    /// The To tag, if the response carries one.
    pub fn to_tag(&self) -> Option<&str> {
        self.to_header().and_then(Address::tag)
    }

    /// Serialise to wire bytes.
    pub fn print(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(SIP_VERSION.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.as_u16().to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason_phrase().as_bytes());
        buf.put_slice(b"\r\n");
        self.print_into(&mut buf);
        buf.freeze()
    }
}

impl HeaderAccess for Response {
    fn headers(&self) -> &[Header] {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
    fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.print()) {
            Ok(s) => f.write_str(s),
            Err(_) => f.write_str("<non-utf8 SIP message>"),
        }
    }
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r),
        }
    }

    /// Serialise to wire bytes.
    pub fn print(&self) -> Bytes {
        match self {
            Message::Request(r) => r.print(),
            Message::Response(r) => r.print(),
        }
    }
}

impl HeaderAccess for Message {
    fn headers(&self) -> &[Header] {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }
    fn headers_mut(&mut self) -> &mut Vec<Header> {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }
    fn body(&self) -> &Bytes {
        match self {
            Message::Request(r) => &r.body,
            Message::Response(r) => &r.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::via::ViaTransport;

    fn minimal_invite() -> Request {
        let mut req = Request::new(Method::Invite, "sip:bob@biloxi.com".parse().unwrap());
        req.push_header(Header::new(
            HeaderName::Via,
            HeaderValue::Via(Via::new(ViaTransport::Udp, "atlanta.com", Some(5060))),
        ));
        req.push_header(Header::from_wire(HeaderName::MaxForwards, "70").unwrap());
        req.push_header(
            Header::from_wire(HeaderName::From, "<sip:alice@atlanta.com>;tag=1928301774").unwrap(),
        );
        req.push_header(Header::from_wire(HeaderName::To, "<sip:bob@biloxi.com>").unwrap());
        req.push_header(Header::new(
            HeaderName::CallId,
            HeaderValue::Raw("a84b4c76e66710".to_string()),
        ));
        req.push_header(Header::new(
            HeaderName::CSeq,
            HeaderValue::CSeq(CSeq::new(314159, Method::Invite)),
        ));
        req
    }

    #[test]
    fn validate_accepts_complete_request() {
        assert!(minimal_invite().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_via() {
        let mut req = minimal_invite();
        req.remove_headers(&HeaderName::Via);
        assert_eq!(req.validate(), Err(Error::MissingHeader("Via")));
    }

    #[test]
    fn validate_rejects_cseq_method_mismatch() {
        let mut req = minimal_invite();
        req.set_header(Header::new(
            HeaderName::CSeq,
            HeaderValue::CSeq(CSeq::new(314159, Method::Bye)),
        ));
        assert!(req.validate().is_err());
    }

    #[test]
    fn printer_appends_content_length() {
        let req = minimal_invite();
        let wire = req.print();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("INVITE sip:bob@biloxi.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn printer_recomputes_content_length() {
        let mut req = minimal_invite().with_body("application/sdp", "v=0\r\n");
        // Stale value must be replaced by the real body length.
        req.set_header(Header::from_wire(HeaderName::ContentLength, "999").unwrap());
        let text = String::from_utf8(req.print().to_vec()).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn response_for_request_copies_route_headers() {
        let req = minimal_invite();
        let resp = Response::for_request(StatusCode::Ringing, &req);
        assert_eq!(resp.via_top(), req.via_top());
        assert_eq!(resp.call_id(), req.call_id());
        assert_eq!(resp.cseq(), req.cseq());
        assert_eq!(resp.reason_phrase(), "Ringing");
        // Nothing else leaks across.
        assert!(resp.header(&HeaderName::MaxForwards).is_none());
    }

    #[test]
    fn custom_reason_phrase() {
        let resp = Response::new_with_reason(
            StatusCode::ServerInternalError,
            "Another INVITE transaction in progress",
        );
        let text = String::from_utf8(resp.print().to_vec()).unwrap();
        assert!(text.starts_with("SIP/2.0 500 Another INVITE transaction in progress\r\n"));
    }
}
