//! End-to-end transaction flows across two real UDP endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use waveline_dialog_core::prelude::*;
use waveline_sip_core::prelude::*;
use waveline_sip_transport::{Transport, UdpTransport};

struct Endpoint {
    manager: Arc<TransactionManager>,
    events: mpsc::Receiver<TransactionEvent>,
    addr: SocketAddr,
}

async fn endpoint() -> Endpoint {
    let (transport, rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
    let addr = transport.local_addr().unwrap();
    let (manager, events) =
        TransactionManager::new(Arc::new(transport), rx, Some(TimerSettings::fast()));
    Endpoint { manager, events, addr }
}

fn request(method: Method, from: SocketAddr, to: SocketAddr, call_id: &str) -> Request {
    let raw = format!(
        "{m} sip:bob@{to} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {from_ip}:{from_port}\r\n\
         Max-Forwards: 70\r\n\
         To: <sip:bob@{to}>\r\n\
         From: <sip:alice@{from_ip}>;tag=tx-test\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 {m}\r\n\
         Contact: <sip:alice@{from_ip}:{from_port}>\r\n\
         Content-Length: 0\r\n\r\n",
        m = method,
        to = to,
        from_ip = from.ip(),
        from_port = from.port(),
        call_id = call_id,
    );
    parse_request(raw.as_bytes()).unwrap()
}

/// Drain events until one satisfies `pred`, with a deadline.
async fn wait_for<F, T>(rx: &mut mpsc::Receiver<TransactionEvent>, mut pred: F) -> T
where
    F: FnMut(TransactionEvent) -> Option<T>,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(out) = pred(event) {
                return out;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn options_round_trip() {
    let mut alice = endpoint().await;
    let mut bob = endpoint().await;

    let req = request(Method::Options, alice.addr, bob.addr, "opt-1");
    alice.manager.send_request(req, bob.addr).unwrap();

    // Bob sees the new server transaction and answers 200.
    let (id, incoming) = wait_for(&mut bob.events, |e| match e {
        TransactionEvent::NewRequest { id, request, .. } => Some((id, request)),
        _ => None,
    })
    .await;
    assert_eq!(incoming.method, Method::Options);
    bob.manager.send_response(&id, Response::for_request(StatusCode::Ok, &incoming)).await.unwrap();

    // Alice's client transaction reports the 200.
    let response = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::SuccessResponse { response, .. } => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(response.status, StatusCode::Ok);

    // Both sides wind down to empty tables.
    wait_for(&mut alice.events, |e| matches!(e, TransactionEvent::Terminated { .. }).then_some(()))
        .await;
    wait_for(&mut bob.events, |e| matches!(e, TransactionEvent::Terminated { .. }).then_some(()))
        .await;
}

#[tokio::test]
async fn invite_ringing_then_ok() {
    let mut alice = endpoint().await;
    let mut bob = endpoint().await;

    let invite = request(Method::Invite, alice.addr, bob.addr, "inv-1");
    alice.manager.send_request(invite, bob.addr).unwrap();

    let (id, incoming) = wait_for(&mut bob.events, |e| match e {
        TransactionEvent::NewRequest { id, request, .. } => Some((id, request)),
        _ => None,
    })
    .await;

    // Ringing with a To tag, then 200 OK.
    let mut ringing = Response::for_request(StatusCode::Ringing, &incoming);
    let mut to = ringing.to_header().unwrap().clone();
    to.set_tag("uastag");
    ringing.set_header(Header::new(HeaderName::To, HeaderValue::Address(to.clone())));
    bob.manager.send_response(&id, ringing).await.unwrap();

    // The UAS core answers 100 Trying on its own; skip to the 180.
    let provisional = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::ProvisionalResponse { response, .. }
            if response.status == StatusCode::Ringing =>
        {
            Some(response)
        }
        _ => None,
    })
    .await;
    assert_eq!(provisional.to_tag(), Some("uastag"));

    let mut ok = Response::for_request(StatusCode::Ok, &incoming);
    ok.set_header(Header::new(HeaderName::To, HeaderValue::Address(to)));
    bob.manager.send_response(&id, ok).await.unwrap();

    let success = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::SuccessResponse { response, .. } => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(success.status, StatusCode::Ok);
    assert_eq!(success.to_tag(), Some("uastag"));
}

#[tokio::test]
async fn rejected_invite_is_acked_by_the_transaction_layer() {
    let mut alice = endpoint().await;
    let mut bob = endpoint().await;

    let invite = request(Method::Invite, alice.addr, bob.addr, "inv-2");
    alice.manager.send_request(invite, bob.addr).unwrap();

    let (id, incoming) = wait_for(&mut bob.events, |e| match e {
        TransactionEvent::NewRequest { id, request, .. } => Some((id, request)),
        _ => None,
    })
    .await;

    let mut busy = Response::for_request(StatusCode::BusyHere, &incoming);
    let mut to = busy.to_header().unwrap().clone();
    to.set_tag("busytag");
    busy.set_header(Header::new(HeaderName::To, HeaderValue::Address(to)));
    bob.manager.send_response(&id, busy).await.unwrap();

    let failure = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::FailureResponse { response, .. } => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(failure.status, StatusCode::BusyHere);

    // The UAC core ACKs the non-2xx automatically; Bob's server
    // transaction confirms on it.
    let ack = wait_for(&mut bob.events, |e| match e {
        TransactionEvent::AckReceived { request, .. } => Some(request),
        _ => None,
    })
    .await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.cseq().unwrap().seq, 1);
}

#[tokio::test]
async fn cancel_after_provisional_yields_487() {
    let mut alice = endpoint().await;
    let mut bob = endpoint().await;

    let invite = request(Method::Invite, alice.addr, bob.addr, "inv-3");
    let invite_key = alice.manager.send_request(invite, bob.addr).unwrap();

    let (uas_id, incoming) = wait_for(&mut bob.events, |e| match e {
        TransactionEvent::NewRequest { id, request, .. } => Some((id, request)),
        _ => None,
    })
    .await;

    // CANCEL before any provisional is refused.
    assert!(alice.manager.send_cancel(&invite_key).await.is_err());

    bob.manager
        .send_response(&uas_id, Response::for_request(StatusCode::Ringing, &incoming))
        .await
        .unwrap();
    wait_for(&mut alice.events, |e| {
        matches!(e, TransactionEvent::ProvisionalResponse { .. }).then_some(())
    })
    .await;

    // Now the CANCEL goes out; Bob's core answers it 200 and tells
    // the TU, which rejects the INVITE with 487.
    alice.manager.send_cancel(&invite_key).await.unwrap();
    let (cancelled_invite_id, _cancel_req) = wait_for(&mut bob.events, |e| match e {
        TransactionEvent::CancelReceived { id, request, .. } => Some((id, request)),
        _ => None,
    })
    .await;
    assert_eq!(cancelled_invite_id, uas_id);

    let mut terminated = Response::for_request(StatusCode::RequestTerminated, &incoming);
    let mut to = terminated.to_header().unwrap().clone();
    to.set_tag("t487");
    terminated.set_header(Header::new(HeaderName::To, HeaderValue::Address(to)));
    bob.manager.send_response(&uas_id, terminated).await.unwrap();

    // Alice sees 200 on the CANCEL and 487 on the INVITE.
    let failure = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::FailureResponse { response, .. } => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(failure.status, StatusCode::RequestTerminated);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let mut alice = endpoint().await;
    // A socket that swallows everything.
    let dead = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();

    let req = request(Method::Message, alice.addr, dead_addr, "timeout-1");
    let key = alice.manager.send_request(req, dead_addr).unwrap();

    let timed_out = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::TimedOut { id } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(timed_out, key);
}

#[tokio::test]
async fn stray_response_is_reported() {
    let mut alice = endpoint().await;

    let raw = "SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKnotmine\r\n\
        To: <sip:a@a>;tag=1\r\nFrom: <sip:b@b>;tag=2\r\n\
        Call-ID: stray\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(raw.as_bytes(), alice.addr).await.unwrap();

    let stray = wait_for(&mut alice.events, |e| match e {
        TransactionEvent::StrayResponse { response, .. } => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(stray.status, StatusCode::Ok);
}
