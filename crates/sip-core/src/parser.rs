//! SIP message parser.
//!
//! Lenient about header ordering, linear whitespace and line folding
//! per RFC 3261 §7.3; strict about the structural headers the stack
//! cannot operate without. The head is parsed with `nom`; the body is
//! taken by Content-Length when present, otherwise to the end of the
//! datagram.

use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{char, digit1},
    combinator::map_res,
};
use tracing::trace;

use crate::error::{Error, Result};
use crate::message::{HeaderAccess, Message, Request, Response};
use crate::types::header::{Header, HeaderName};
use crate::types::method::is_token_byte;
use crate::types::{Method, StatusCode};

/// Parse one SIP message from a buffer.
///
/// The buffer must contain the complete head; the body may be shorter
/// than Content-Length only if `allow_partial_body` is false, in which
/// case that is an error. Datagram transports pass complete packets.
pub fn parse_message(input: &[u8]) -> Result<Message> {
    let head_end = find_head_end(input)
        .ok_or_else(|| Error::Parser("message head not terminated by CRLFCRLF".to_string()))?;
    let head = std::str::from_utf8(&input[..head_end.start])
        .map_err(|_| Error::Parser("message head is not valid UTF-8".to_string()))?;
    let rest = &input[head_end.end..];

    let mut lines = unfold_lines(head);
    let start_line = loop {
        match lines.next() {
            // Leading empty lines are permitted keep-alives.
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => return Err(Error::Parser("empty message".to_string())),
        }
    };

    let mut message = parse_start_line(&start_line)?;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("header without colon: {}", line)))?;
        let name = HeaderName::from_wire(name);
        if name.is_list_header() {
            for item in split_list_items(value) {
                message.push_header(Header::from_wire(name.clone(), item)?);
            }
        } else {
            message.push_header(Header::from_wire(name, value)?);
        }
    }

    // Body extraction.
    let body = match message.content_length() {
        Some(len) => {
            let len = len as usize;
            if rest.len() < len {
                return Err(Error::ContentLengthMismatch { expected: len, actual: rest.len() });
            }
            Bytes::copy_from_slice(&rest[..len])
        }
        None => Bytes::copy_from_slice(rest),
    };
    match &mut message {
        Message::Request(r) => r.body = body,
        Message::Response(r) => r.body = body,
    }

    trace!(
        is_request = message.is_request(),
        headers = message.headers().len(),
        "parsed SIP message"
    );
    Ok(message)
}

/// Parse a request, failing on responses.
pub fn parse_request(input: &[u8]) -> Result<Request> {
    match parse_message(input)? {
        Message::Request(r) => Ok(r),
        Message::Response(_) => Err(Error::Parser("expected a request".to_string())),
    }
}

/// Parse a response, failing on requests.
pub fn parse_response(input: &[u8]) -> Result<Response> {
    match parse_message(input)? {
        Message::Response(r) => Ok(r),
        Message::Request(_) => Err(Error::Parser("expected a response".to_string())),
    }
}

struct HeadEnd {
    /// Byte offset of the first empty line.
    start: usize,
    /// Byte offset where the body starts.
    end: usize,
}

/// Locate the empty line closing the head. CRLF CRLF per the RFC;
/// bare LF LF is tolerated.
fn find_head_end(input: &[u8]) -> Option<HeadEnd> {
    let mut i = 0;
    while i + 1 < input.len() {
        if input[i] == b'\r' && input[i + 1] == b'\n' {
            if input[i + 2..].starts_with(b"\r\n") {
                return Some(HeadEnd { start: i, end: i + 4 });
            }
            if input[i + 2..].starts_with(b"\n") {
                return Some(HeadEnd { start: i, end: i + 3 });
            }
        } else if input[i] == b'\n' && input[i + 1] == b'\n' {
            return Some(HeadEnd { start: i, end: i + 2 });
        }
        i += 1;
    }
    None
}

/// Split the head into logical lines, joining folded continuations
/// (lines starting with SP or HT) onto their predecessor.
fn unfold_lines(head: &str) -> impl Iterator<Item = String> + '_ {
    let mut out: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(line.trim_start());
        } else {
            out.push(line.to_string());
        }
    }
    out.into_iter()
}

/// Split a comma-separated list header value into items, respecting
/// double quotes and angle brackets.
fn split_list_items(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth_angle = 0i32;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (i, b) in value.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b'<' if !quoted => depth_angle += 1,
            b'>' if !quoted => depth_angle -= 1,
            b',' if !quoted && depth_angle == 0 => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|s| !s.is_empty());
    items
}

fn parse_start_line(line: &str) -> Result<Message> {
    if line.starts_with("SIP/") {
        let (status, reason) = status_line(line)
            .map(|(_, v)| v)
            .map_err(|_| Error::Parser(format!("bad status line: {}", line)))?;
        let status_code = StatusCode::from_u16(status)?;
        let mut response = Response::new(status_code);
        if reason != status_code.reason_phrase() {
            response.reason = Some(reason.to_string());
        }
        Ok(Message::Response(response))
    } else {
        let (method, uri) = request_line(line)
            .map(|(_, v)| v)
            .map_err(|_| Error::Parser(format!("bad request line: {}", line)))?;
        Ok(Message::Request(Request::new(method, uri)))
    }
}

/// `Request-Line = Method SP Request-URI SP SIP-Version`
fn request_line(i: &str) -> IResult<&str, (Method, crate::types::Uri)> {
    let (i, method) = map_res(take_while1(|c: char| is_token_byte(c as u8)), |m: &str| {
        m.parse::<Method>()
    })(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, uri) = map_res(take_till1(|c| c == ' '), |u: &str| u.parse::<crate::types::Uri>())(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, _) = tag("SIP/2.0")(i)?;
    Ok((i, (method, uri)))
}

/// `Status-Line = SIP-Version SP Status-Code SP Reason-Phrase`
fn status_line(i: &str) -> IResult<&str, (u16, &str)> {
    let (i, _) = tag("SIP/2.0")(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, code) = map_res(digit1, |d: &str| d.parse::<u16>())(i)?;
    let (reason, _) = char::<&str, nom::error::Error<&str>>(' ')(i).unwrap_or((i, ' '));
    Ok(("", (code, reason)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HeaderName;

    const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@pc33.atlanta.com>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\r\n";

    #[test]
    fn parse_rfc_example_invite() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri.host, "biloxi.com");
        assert_eq!(req.from_header().unwrap().tag(), Some("1928301774"));
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.atlanta.com"));
        assert_eq!(req.cseq().unwrap().seq, 314159);
        assert_eq!(req.body.as_ref(), b"v=0");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn parse_response_line() {
        let raw = "SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
            To: <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
            From: <sip:alice@atlanta.com>;tag=1928301774\r\n\
            Call-ID: x\r\n\
            CSeq: 314159 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status, StatusCode::Ringing);
        assert_eq!(resp.to_tag(), Some("a6c85cf"));
    }

    #[test]
    fn custom_reason_is_preserved() {
        let raw = "SIP/2.0 500 Another INVITE transaction in progress\r\n\
            Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@y>\r\n\
            Call-ID: c\r\nCSeq: 2 INVITE\r\nContent-Length: 0\r\n\r\n";
        let resp = parse_response(raw.as_bytes()).unwrap();
        assert_eq!(resp.reason_phrase(), "Another INVITE transaction in progress");
    }

    #[test]
    fn folded_and_compact_headers() {
        let raw = "OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
            v: SIP/2.0/UDP host;branch=z9hG4bKkjshdyff\r\n\
            Max-Forwards: 70\r\n\
            t: <sip:carol@chicago.com>\r\n\
            f: <sip:alice@atlanta.com>\r\n\
            \t;tag=887s\r\n\
            i: 987asjd97y7atg\r\n\
            CSeq: 986759 OPTIONS\r\n\r\n";
        let req = parse_request(raw.as_bytes()).unwrap();
        assert_eq!(req.from_header().unwrap().tag(), Some("887s"));
        assert_eq!(req.call_id(), Some("987asjd97y7atg"));
    }

    #[test]
    fn comma_folded_via_splits() {
        let raw = "BYE sip:bob@biloxi.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP a.com;branch=z9hG4bK1, SIP/2.0/UDP b.com;branch=z9hG4bK2\r\n\
            Max-Forwards: 70\r\n\
            To: <sip:bob@biloxi.com>;tag=x\r\nFrom: <sip:alice@atlanta.com>;tag=y\r\n\
            Call-ID: z\r\nCSeq: 2 BYE\r\n\r\n";
        let req = parse_request(raw.as_bytes()).unwrap();
        let vias: Vec<_> = req.headers_named(&HeaderName::Via).collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(vias[1].as_via().unwrap().sent_by_host, "b.com");
    }

    #[test]
    fn quoted_comma_does_not_split_contact() {
        let raw = "REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP h;branch=z9hG4bK9\r\nMax-Forwards: 70\r\n\
            To: <sip:bob@biloxi.com>\r\nFrom: <sip:bob@biloxi.com>;tag=456248\r\n\
            Call-ID: 843817637684230\r\nCSeq: 1826 REGISTER\r\n\
            Contact: \"Mr. Watson, Bob\" <sip:watson@worcester.bell-telephone.com>\r\n\r\n";
        let req = parse_request(raw.as_bytes()).unwrap();
        let contact = req.contact().unwrap();
        assert_eq!(contact.display_name.as_deref(), Some("Mr. Watson, Bob"));
    }

    #[test]
    fn body_shorter_than_content_length_is_an_error() {
        let raw = "MESSAGE sip:bob@b.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP h;branch=z9hG4bK3\r\nMax-Forwards: 70\r\n\
            To: <sip:bob@b.com>\r\nFrom: <sip:a@a.com>;tag=1\r\n\
            Call-ID: q\r\nCSeq: 1 MESSAGE\r\nContent-Length: 100\r\n\r\nshort";
        match parse_message(raw.as_bytes()) {
            Err(Error::ContentLengthMismatch { expected: 100, actual: 5 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn truncated_head_is_an_error() {
        assert!(parse_message(b"INVITE sip:bob@b.com SIP/2.0\r\nVia: SIP").is_err());
    }

    #[test]
    fn print_parse_round_trip() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let printed = msg.print();
        let reparsed = parse_message(&printed).unwrap();
        assert_eq!(reparsed, msg);
    }
}
