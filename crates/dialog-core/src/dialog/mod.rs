//! SIP dialogs (RFC 3261 §12): identity, state, CSeq bookkeeping,
//! route sets and in-dialog request construction.

pub mod manager;

use std::fmt;

use tracing::debug;

use waveline_sip_core::{
    Address, CSeq, Header, HeaderAccess, HeaderName, HeaderValue, Method, Request, Response, Uri,
    generate_tag,
};

use crate::errors::{Error, Result};

pub use manager::DialogManager;

/// Dialog identity: Call-ID plus the two tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    /// Unset while the dialog is half-established (UAC before the
    /// first tagged response).
    pub remote_tag: Option<String>,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: Option<String>,
    ) -> Self {
        DialogId { call_id: call_id.into(), local_tag: local_tag.into(), remote_tag }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}

/// Dialog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a tagged provisional response.
    Early,
    /// Established by a 2xx.
    Confirmed,
    /// Dead; kept only until the last usage releases it.
    Terminated,
}

/// One SIP dialog.
///
/// The dialog owns the CSeq counters for both directions, the frozen
/// route set and the remote target. INVITE sessions and event
/// subscriptions are "usages" of the dialog; the dialog dies when the
/// usage count reaches zero.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub call_id: String,
    /// Our From/To identity with tag.
    pub local_uri: Address,
    /// The peer's From/To identity (tag tracked in `id`).
    pub remote_uri: Address,
    /// Where in-dialog requests go.
    pub remote_target: Uri,
    /// Frozen at dialog establishment; reversed Record-Route for UAC.
    pub route_set: Vec<Address>,
    /// Contact we advertise.
    pub local_contact: Address,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    /// SIPS dialog per RFC 3261 §12.1.1.
    pub secure: bool,
    pub is_initiator: bool,
    usage_count: u32,
}

impl Dialog {
    /// UAC dialog seeded from the request we sent. Half-open until
    /// [`Dialog::on_uac_response`] sees a tagged response.
    pub fn new_uac(request: &Request, local_contact: Address) -> Result<Dialog> {
        let from = request
            .from_header()
            .ok_or_else(|| Error::BadRequest("request without From".to_string()))?
            .clone();
        let to = request
            .to_header()
            .ok_or_else(|| Error::BadRequest("request without To".to_string()))?
            .clone();
        let local_tag = from
            .tag()
            .ok_or_else(|| Error::BadRequest("UAC From without tag".to_string()))?
            .to_string();
        let call_id = request
            .call_id()
            .ok_or_else(|| Error::BadRequest("request without Call-ID".to_string()))?
            .to_string();
        let cseq = request
            .cseq()
            .ok_or_else(|| Error::BadRequest("request without CSeq".to_string()))?;

        Ok(Dialog {
            id: DialogId::new(call_id.clone(), local_tag, None),
            state: DialogState::Early,
            call_id,
            secure: request.uri.is_secure(),
            local_uri: from,
            remote_uri: to,
            remote_target: request.uri.clone(),
            route_set: Vec::new(),
            local_contact,
            local_cseq: cseq.seq,
            remote_cseq: 0,
            is_initiator: true,
            usage_count: 1,
        })
    }

    /// UAS dialog from a received dialog-establishing request. Picks
    /// a fresh local tag.
    pub fn new_uas(request: &Request, local_contact: Address) -> Result<Dialog> {
        let from = request
            .from_header()
            .ok_or_else(|| Error::BadRequest("request without From".to_string()))?
            .clone();
        let to = request
            .to_header()
            .ok_or_else(|| Error::BadRequest("request without To".to_string()))?
            .clone();
        let remote_tag = from
            .tag()
            .ok_or_else(|| Error::BadRequest("request From without tag".to_string()))?
            .to_string();
        let call_id = request
            .call_id()
            .ok_or_else(|| Error::BadRequest("request without Call-ID".to_string()))?
            .to_string();
        let cseq = request
            .cseq()
            .ok_or_else(|| Error::BadRequest("request without CSeq".to_string()))?;

        let local_tag = generate_tag();
        let mut local_uri = to;
        local_uri.set_tag(local_tag.clone());

        // Remote target from Contact; fall back to the From URI for
        // broken peers.
        let remote_target =
            request.contact().map(|c| c.uri.clone()).unwrap_or_else(|| from.uri.clone());

        // UAS keeps Record-Route order as received (§12.1.1).
        let route_set: Vec<Address> = request
            .headers_named(&HeaderName::RecordRoute)
            .filter_map(Header::as_address)
            .cloned()
            .collect();

        Ok(Dialog {
            id: DialogId::new(call_id.clone(), local_tag, Some(remote_tag)),
            state: DialogState::Early,
            call_id,
            secure: request.uri.is_secure(),
            local_uri,
            remote_uri: from,
            remote_target,
            route_set,
            local_contact,
            // The first in-dialog request we originate picks a fresh
            // sequence; keep it small but nonzero.
            local_cseq: 0,
            remote_cseq: cseq.seq,
            is_initiator: false,
            usage_count: 1,
        })
    }

    /// Fold a response into a UAC dialog: learn the remote tag,
    /// target and route set; promote the state on 2xx.
    pub fn on_uac_response(&mut self, response: &Response) -> Result<()> {
        if let Some(tag) = response.to_tag() {
            if self.id.remote_tag.is_none() {
                self.id.remote_tag = Some(tag.to_string());
                self.remote_uri.set_tag(tag);
                // Route set freezes now: reversed Record-Route (§12.1.2).
                self.route_set = response
                    .headers_named(&HeaderName::RecordRoute)
                    .filter_map(Header::as_address)
                    .cloned()
                    .collect();
                self.route_set.reverse();
            }
        }
        if let Some(contact) = response.contact() {
            self.remote_target = contact.uri.clone();
        }
        if response.status.is_success() {
            self.state = DialogState::Confirmed;
        }
        Ok(())
    }

    /// Promote a UAS dialog when we send the 2xx.
    pub fn confirm(&mut self) {
        self.state = DialogState::Confirmed;
    }

    /// Build the next in-dialog request. CSeq increments for every
    /// method except ACK and CANCEL, which reuse the INVITE's number.
    pub fn next_request(&mut self, method: Method) -> Request {
        let seq = match method {
            Method::Ack | Method::Cancel => self.local_cseq,
            _ => {
                self.local_cseq += 1;
                self.local_cseq
            }
        };
        self.build_request(method, seq)
    }

    /// Build an in-dialog request with an explicit sequence number
    /// (ACK to a 2xx uses the INVITE's).
    pub fn build_request(&self, method: Method, seq: u32) -> Request {
        // Loose routing (§12.2.1.1): with an lr first route the
        // request-URI is the remote target and the route set rides in
        // Route headers; otherwise the first route becomes the URI
        // and the target goes last.
        let (uri, routes) = match self.route_set.first() {
            None => (self.remote_target.clone(), Vec::new()),
            Some(first) if first.uri.is_loose_router() => {
                (self.remote_target.clone(), self.route_set.clone())
            }
            Some(first) => {
                let mut routes: Vec<Address> = self.route_set[1..].to_vec();
                routes.push(Address::new(self.remote_target.clone()));
                (first.uri.clone(), routes)
            }
        };

        let mut request = Request::new(method.clone(), uri);
        // Via is stamped by the caller with the local transport
        // address; the transaction layer fills the branch.
        for route in routes {
            request.push_header(Header::new(HeaderName::Route, HeaderValue::Address(route)));
        }
        request.push_header(Header::new(HeaderName::MaxForwards, HeaderValue::UInt(70)));
        request
            .push_header(Header::new(HeaderName::From, HeaderValue::Address(self.local_uri.clone())));
        request
            .push_header(Header::new(HeaderName::To, HeaderValue::Address(self.remote_uri.clone())));
        request.push_header(Header::new(HeaderName::CallId, HeaderValue::Raw(self.call_id.clone())));
        request.push_header(Header::new(HeaderName::CSeq, HeaderValue::CSeq(CSeq::new(seq, method))));
        request.push_header(Header::new(
            HeaderName::Contact,
            HeaderValue::Address(self.local_contact.clone()),
        ));
        request
    }

    /// Check and advance the remote CSeq for an in-dialog request
    /// (§12.2.2). ACK and CANCEL legitimately reuse the INVITE's
    /// number.
    pub fn validate_remote_cseq(&mut self, request: &Request) -> Result<()> {
        let cseq = request
            .cseq()
            .ok_or_else(|| Error::BadRequest("request without CSeq".to_string()))?;
        match request.method {
            Method::Ack | Method::Cancel => {
                if cseq.seq < self.remote_cseq {
                    return Err(Error::StaleCSeq { got: cseq.seq, last: self.remote_cseq });
                }
            }
            _ => {
                if self.remote_cseq != 0 && cseq.seq <= self.remote_cseq {
                    return Err(Error::StaleCSeq { got: cseq.seq, last: self.remote_cseq });
                }
                self.remote_cseq = cseq.seq;
            }
        }
        Ok(())
    }

    /// Register another usage (event subscription, session).
    pub fn inc_usage(&mut self) -> u32 {
        self.usage_count += 1;
        self.usage_count
    }

    /// Release a usage; at zero the dialog is ready to be dropped.
    pub fn dec_usage(&mut self) -> u32 {
        self.usage_count = self.usage_count.saturating_sub(1);
        if self.usage_count == 0 {
            debug!(id = %self.id, "last dialog usage released");
            self.state = DialogState::Terminated;
        }
        self.usage_count
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::{parse_request, parse_response};

    fn uac_invite() -> Request {
        parse_request(
            b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP atlanta.com;branch=z9hG4bKdlg1\r\nMax-Forwards: 70\r\n\
              To: <sip:bob@biloxi.com>\r\nFrom: <sip:alice@atlanta.com>;tag=alice1\r\n\
              Call-ID: dlg-test\r\nCSeq: 1 INVITE\r\n\
              Contact: <sip:alice@192.0.2.1:5060>\r\n\r\n",
        )
        .unwrap()
    }

    fn ok_response(with_rr: bool) -> Response {
        let rr = if with_rr {
            "Record-Route: <sip:p2.example.com;lr>\r\nRecord-Route: <sip:p1.example.com;lr>\r\n"
        } else {
            ""
        };
        let raw = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP atlanta.com;branch=z9hG4bKdlg1\r\n\
             To: <sip:bob@biloxi.com>;tag=bob1\r\nFrom: <sip:alice@atlanta.com>;tag=alice1\r\n\
             Call-ID: dlg-test\r\nCSeq: 1 INVITE\r\n{}\
             Contact: <sip:bob@192.0.2.4:5060>\r\n\r\n",
            rr
        );
        parse_response(raw.as_bytes()).unwrap()
    }

    fn contact() -> Address {
        "<sip:alice@192.0.2.1:5060>".parse().unwrap()
    }

    #[test]
    fn uac_dialog_establishes_from_response() {
        let mut dialog = Dialog::new_uac(&uac_invite(), contact()).unwrap();
        assert_eq!(dialog.id.remote_tag, None);
        dialog.on_uac_response(&ok_response(true)).unwrap();
        assert_eq!(dialog.id.remote_tag.as_deref(), Some("bob1"));
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.remote_target.host, "192.0.2.4");
        // Record-Route reversed for the UAC.
        assert_eq!(dialog.route_set[0].uri.host, "p1.example.com");
        assert_eq!(dialog.route_set[1].uri.host, "p2.example.com");
    }

    #[test]
    fn uas_dialog_mirrors_request() {
        let dialog = Dialog::new_uas(&uac_invite(), contact()).unwrap();
        assert_eq!(dialog.id.remote_tag.as_deref(), Some("alice1"));
        assert_eq!(dialog.remote_cseq, 1);
        assert!(!dialog.is_initiator);
        assert_eq!(dialog.remote_target.host, "192.0.2.1");
        assert!(dialog.local_uri.tag().is_some());
    }

    #[test]
    fn cseq_strictly_monotonic_per_direction() {
        let mut dialog = Dialog::new_uac(&uac_invite(), contact()).unwrap();
        dialog.on_uac_response(&ok_response(false)).unwrap();
        let seq0 = dialog.local_cseq;
        let bye = dialog.next_request(Method::Bye);
        assert_eq!(bye.cseq().unwrap().seq, seq0 + 1);
        let update = dialog.next_request(Method::Update);
        assert_eq!(update.cseq().unwrap().seq, seq0 + 2);
        // ACK reuses the current number.
        let ack = dialog.build_request(Method::Ack, 1);
        assert_eq!(ack.cseq().unwrap().seq, 1);
    }

    #[test]
    fn in_dialog_request_carries_identity() {
        let mut dialog = Dialog::new_uac(&uac_invite(), contact()).unwrap();
        dialog.on_uac_response(&ok_response(true)).unwrap();
        let bye = dialog.next_request(Method::Bye);
        assert_eq!(bye.call_id(), Some("dlg-test"));
        assert_eq!(bye.from_header().unwrap().tag(), Some("alice1"));
        assert_eq!(bye.to_header().unwrap().tag(), Some("bob1"));
        // Loose routing: URI is the remote target, routes ride along.
        assert_eq!(bye.uri.host, "192.0.2.4");
        let routes: Vec<_> = bye.headers_named(&HeaderName::Route).collect();
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn stale_remote_cseq_rejected() {
        let mut dialog = Dialog::new_uas(&uac_invite(), contact()).unwrap();
        let mut bye = parse_request(
            b"BYE sip:alice@atlanta.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP biloxi.com;branch=z9hG4bKbye\r\nMax-Forwards: 70\r\n\
              To: <sip:alice@atlanta.com>;tag=x\r\nFrom: <sip:bob@biloxi.com>;tag=alice1\r\n\
              Call-ID: dlg-test\r\nCSeq: 2 BYE\r\n\r\n",
        )
        .unwrap();
        assert!(dialog.validate_remote_cseq(&bye).is_ok());
        assert_eq!(dialog.remote_cseq, 2);
        // Replay with the same number must fail.
        assert!(matches!(
            dialog.validate_remote_cseq(&bye),
            Err(Error::StaleCSeq { got: 2, last: 2 })
        ));
        bye.set_header(Header::new(
            HeaderName::CSeq,
            HeaderValue::CSeq(CSeq::new(1, Method::Bye)),
        ));
        assert!(dialog.validate_remote_cseq(&bye).is_err());
    }

    #[test]
    fn usage_counting_drives_teardown() {
        let mut dialog = Dialog::new_uas(&uac_invite(), contact()).unwrap();
        assert_eq!(dialog.usage_count(), 1);
        dialog.inc_usage();
        assert_eq!(dialog.dec_usage(), 1);
        assert_ne!(dialog.state, DialogState::Terminated);
        assert_eq!(dialog.dec_usage(), 0);
        assert_eq!(dialog.state, DialogState::Terminated);
    }
}
