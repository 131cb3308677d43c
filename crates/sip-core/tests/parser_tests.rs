//! Parser/printer round-trip coverage, including the property the
//! whole stack leans on: `parse(print(m))` is structurally `m`.

use bytes::Bytes;
use proptest::prelude::*;
use waveline_sip_core::prelude::*;

fn build_request(
    method: Method,
    seq: u32,
    call_id: &str,
    from_tag: &str,
    body: &[u8],
) -> Request {
    let mut req = Request::new(method.clone(), "sip:bob@biloxi.com:5060".parse().unwrap());
    req.push_header(Header::new(
        HeaderName::Via,
        HeaderValue::Via("SIP/2.0/UDP atlanta.com:5060;branch=z9hG4bKtest1".parse().unwrap()),
    ));
    req.push_header(Header::from_wire(HeaderName::MaxForwards, "70").unwrap());
    req.push_header(
        Header::from_wire(
            HeaderName::From,
            &format!("\"Alice\" <sip:alice@atlanta.com>;tag={}", from_tag),
        )
        .unwrap(),
    );
    req.push_header(Header::from_wire(HeaderName::To, "<sip:bob@biloxi.com>").unwrap());
    req.push_header(Header::new(HeaderName::CallId, HeaderValue::Raw(call_id.to_string())));
    req.push_header(Header::new(HeaderName::CSeq, HeaderValue::CSeq(CSeq::new(seq, method))));
    if !body.is_empty() {
        req = req.with_body("application/sdp", Bytes::copy_from_slice(body));
    }
    req
}

#[test]
fn request_round_trip_preserves_structure() {
    let req = build_request(Method::Invite, 1, "cid-1@host", "tag1", b"v=0\r\n");
    let reparsed = parse_request(&req.print()).unwrap();
    assert_eq!(reparsed.method, req.method);
    assert_eq!(reparsed.uri, req.uri);
    assert_eq!(reparsed.from_header(), req.from_header());
    assert_eq!(reparsed.cseq(), req.cseq());
    assert_eq!(reparsed.body, req.body);
}

#[test]
fn response_round_trip_preserves_structure() {
    let req = build_request(Method::Invite, 7, "cid-2@host", "tag2", b"");
    let mut resp = Response::for_request(StatusCode::Ok, &req);
    resp.push_header(Header::from_wire(HeaderName::Contact, "<sip:bob@192.0.2.4>").unwrap());
    let reparsed = parse_response(&resp.print()).unwrap();
    assert_eq!(reparsed.status, StatusCode::Ok);
    assert_eq!(reparsed.headers, resp.headers);
}

#[test]
fn all_standard_methods_survive_round_trip() {
    for method in [
        Method::Invite,
        Method::Ack,
        Method::Bye,
        Method::Cancel,
        Method::Options,
        Method::Register,
        Method::Prack,
        Method::Update,
        Method::Refer,
        Method::Subscribe,
        Method::Notify,
        Method::Message,
        Method::Info,
    ] {
        let req = build_request(method.clone(), 3, "cid@host", "t", b"");
        let reparsed = parse_request(&req.print()).unwrap();
        assert_eq!(reparsed.method, method);
        assert_eq!(reparsed.cseq().unwrap().method, method);
    }
}

#[test]
fn missing_mandatory_headers_fail_validation_not_parsing() {
    // A syntactically fine request with no Via still parses, so the
    // transport can answer 400; validation catches the hole.
    let raw = b"OPTIONS sip:x@y.com SIP/2.0\r\n\
        From: <sip:a@b.com>;tag=1\r\nTo: <sip:x@y.com>\r\n\
        Call-ID: abc\r\nCSeq: 1 OPTIONS\r\nMax-Forwards: 70\r\n\r\n";
    let req = parse_request(raw).unwrap();
    assert!(matches!(req.validate(), Err(Error::MissingHeader("Via"))));
}

proptest! {
    #[test]
    fn arbitrary_requests_round_trip(
        seq in 1u32..1_000_000,
        call_id in "[a-zA-Z0-9.@-]{1,40}",
        tag in "[a-zA-Z0-9]{1,16}",
        body in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let req = build_request(Method::Invite, seq, &call_id, &tag, &body);
        let reparsed = parse_request(&req.print()).unwrap();
        prop_assert_eq!(reparsed.cseq().unwrap().seq, seq);
        prop_assert_eq!(reparsed.call_id().unwrap(), call_id.as_str());
        prop_assert_eq!(reparsed.from_header().unwrap().tag().unwrap(), tag.as_str());
        prop_assert_eq!(reparsed.body.as_ref(), body.as_slice());
    }

    #[test]
    fn printer_output_reparses_to_equal_message(
        status_num in 100u16..700,
    ) {
        let req = build_request(Method::Invite, 1, "cid@h", "t", b"");
        let status = StatusCode::from_u16(status_num).unwrap();
        let resp = Response::for_request(status, &req);
        let reparsed = parse_response(&resp.print()).unwrap();
        prop_assert_eq!(reparsed, resp);
    }
}
