//! Call transfer (REFER, RFC 3515): sipfrag progress bodies and the
//! implicit event subscription that rides on the dialog.

use std::fmt;

use bytes::Bytes;

use waveline_sip_core::{
    Address, Header, HeaderAccess, HeaderName, HeaderValue, Method, Request,
};

use crate::errors::{Error, Result};

/// Content type of NOTIFY bodies carrying transfer progress.
pub const SIPFRAG_CONTENT_TYPE: &str = "message/sipfrag;version=2.0";

/// One line of SIP status used as transfer progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipFrag {
    pub status: u16,
    pub reason: String,
}

impl SipFrag {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        SipFrag { status, reason: reason.into() }
    }

    pub fn trying() -> Self {
        SipFrag::new(100, "Trying")
    }

    /// Parse a `SIP/2.0 180 Ringing` fragment.
    pub fn parse(body: &[u8]) -> Result<SipFrag> {
        let text = std::str::from_utf8(body)
            .map_err(|_| Error::InvalidState("sipfrag is not UTF-8".to_string()))?;
        let line = text.lines().next().unwrap_or("");
        let mut fields = line.splitn(3, ' ');
        match (fields.next(), fields.next(), fields.next()) {
            (Some("SIP/2.0"), Some(code), reason) => Ok(SipFrag {
                status: code
                    .parse()
                    .map_err(|_| Error::InvalidState(format!("bad sipfrag status: {}", line)))?,
                reason: reason.unwrap_or("").to_string(),
            }),
            _ => Err(Error::InvalidState(format!("bad sipfrag line: {}", line))),
        }
    }

    pub fn to_body(&self) -> Bytes {
        Bytes::from(format!("SIP/2.0 {} {}\r\n", self.status, self.reason))
    }

    /// Final fragments terminate the subscription.
    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

impl fmt::Display for SipFrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}", self.status, self.reason)
    }
}

/// State of the implicit refer subscription on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferSubscriptionState {
    Active,
    Terminated,
}

/// Server side of the implicit subscription created by an inbound
/// REFER. Lives on the dialog, independently of the INVITE usage.
#[derive(Debug)]
pub struct ReferSubscription {
    pub state: ReferSubscriptionState,
    /// The Refer-To target we are calling on the referrer's behalf.
    pub refer_to: Address,
    /// CSeq of the REFER that created us (for the Event id).
    pub refer_cseq: u32,
}

impl ReferSubscription {
    /// Accept an inbound in-dialog REFER.
    pub fn from_refer(request: &Request) -> Result<ReferSubscription> {
        let refer_to = request
            .header(&HeaderName::ReferTo)
            .and_then(Header::as_address)
            .cloned()
            .ok_or_else(|| Error::InvalidState("REFER without Refer-To".to_string()))?;
        let refer_cseq = request
            .cseq()
            .map(|c| c.seq)
            .ok_or_else(|| Error::InvalidState("REFER without CSeq".to_string()))?;
        Ok(ReferSubscription {
            state: ReferSubscriptionState::Active,
            refer_to,
            refer_cseq,
        })
    }

    /// Decorate an in-dialog NOTIFY with the refer event headers and
    /// a sipfrag body. Terminal fragments close the subscription.
    pub fn fill_notify(&mut self, mut notify: Request, frag: &SipFrag) -> Request {
        notify.push_header(Header::new(
            HeaderName::Event,
            HeaderValue::Raw(format!("refer;id={}", self.refer_cseq)),
        ));
        let sub_state = if frag.is_final() {
            self.state = ReferSubscriptionState::Terminated;
            "terminated;reason=noresource".to_string()
        } else {
            "active;expires=60".to_string()
        };
        notify.push_header(Header::new(
            HeaderName::SubscriptionState,
            HeaderValue::Raw(sub_state),
        ));
        notify.with_body(SIPFRAG_CONTENT_TYPE, frag.to_body())
    }
}

/// Extract transfer progress from an inbound NOTIFY on the client
/// side of the subscription. Returns the fragment and whether the
/// subscription terminated.
pub fn parse_notify(request: &Request) -> Result<(SipFrag, bool)> {
    let is_refer_event = request
        .header(&HeaderName::Event)
        .map(|h| matches!(&h.value, HeaderValue::Raw(v) if v.starts_with("refer")))
        .unwrap_or(false);
    if !is_refer_event {
        return Err(Error::InvalidState("NOTIFY without refer event".to_string()));
    }
    let terminated = request
        .header(&HeaderName::SubscriptionState)
        .map(|h| matches!(&h.value, HeaderValue::Raw(v) if v.starts_with("terminated")))
        .unwrap_or(false);
    let frag = SipFrag::parse(&request.body)?;
    Ok((frag, terminated))
}

/// Build the REFER request body-side: just the Refer-To header on an
/// in-dialog request skeleton.
pub fn fill_refer(mut refer: Request, target: &Address) -> Request {
    debug_assert_eq!(refer.method, Method::Refer);
    refer.push_header(Header::new(HeaderName::ReferTo, HeaderValue::Address(target.clone())));
    refer
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::parse_request;

    #[test]
    fn sipfrag_round_trip() {
        let frag = SipFrag::new(180, "Ringing");
        let parsed = SipFrag::parse(&frag.to_body()).unwrap();
        assert_eq!(parsed, frag);
        assert!(!parsed.is_final());
        assert!(SipFrag::new(200, "OK").is_final());
    }

    #[test]
    fn refer_subscription_lifecycle() {
        let refer = parse_request(
            b"REFER sip:bob@b.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP a.com;branch=z9hG4bKref\r\nMax-Forwards: 70\r\n\
              To: <sip:bob@b.com>;tag=bb\r\nFrom: <sip:alice@a.com>;tag=aa\r\n\
              Call-ID: xfer\r\nCSeq: 3 REFER\r\n\
              Refer-To: <sip:carol@chicago.com>\r\n\r\n",
        )
        .unwrap();
        let mut sub = ReferSubscription::from_refer(&refer).unwrap();
        assert_eq!(sub.refer_to.uri.user.as_deref(), Some("carol"));
        assert_eq!(sub.refer_cseq, 3);

        let skeleton = Request::new(Method::Notify, "sip:alice@a.com".parse().unwrap());
        let notify = sub.fill_notify(skeleton, &SipFrag::trying());
        assert_eq!(sub.state, ReferSubscriptionState::Active);
        assert_eq!(notify.body.as_ref(), b"SIP/2.0 100 Trying\r\n");
        assert_eq!(notify.content_type(), Some(SIPFRAG_CONTENT_TYPE));

        let skeleton = Request::new(Method::Notify, "sip:alice@a.com".parse().unwrap());
        let notify = sub.fill_notify(skeleton, &SipFrag::new(200, "OK"));
        assert_eq!(sub.state, ReferSubscriptionState::Terminated);
        let sub_state = notify
            .header(&HeaderName::SubscriptionState)
            .map(|h| h.value.to_string())
            .unwrap();
        assert!(sub_state.starts_with("terminated"));
    }

    #[test]
    fn notify_parsing() {
        let notify = parse_request(
            b"NOTIFY sip:alice@a.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP b.com;branch=z9hG4bKnot\r\nMax-Forwards: 70\r\n\
              To: <sip:alice@a.com>;tag=aa\r\nFrom: <sip:bob@b.com>;tag=bb\r\n\
              Call-ID: xfer\r\nCSeq: 4 NOTIFY\r\n\
              Event: refer;id=3\r\nSubscription-State: terminated;reason=noresource\r\n\
              Content-Type: message/sipfrag;version=2.0\r\n\
              Content-Length: 16\r\n\r\n\
              SIP/2.0 200 OK\r\n",
        )
        .unwrap();
        let (frag, terminated) = parse_notify(&notify).unwrap();
        assert_eq!(frag.status, 200);
        assert!(terminated);
    }
}
