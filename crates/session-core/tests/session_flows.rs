//! End-to-end call scenarios between two endpoints on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use waveline_dialog_core::TimerSettings;
use waveline_infra_common::CoreConfig;
use waveline_session_core::prelude::*;
use waveline_session_core::endpoint::Endpoint;
use waveline_sip_core::prelude::*;

async fn endpoint(name: &str) -> (Arc<Endpoint>, mpsc::Receiver<SessionEvent>) {
    endpoint_with(name, CoreConfig::default()).await
}

async fn endpoint_with(
    name: &str,
    config: CoreConfig,
) -> (Arc<Endpoint>, mpsc::Receiver<SessionEvent>) {
    let identity: Address =
        format!("<sip:{}@127.0.0.1>", name).parse().unwrap();
    Endpoint::bind_with(
        config,
        "127.0.0.1:0".parse().unwrap(),
        identity,
        Some(TimerSettings::fast()),
        Vec::new(),
    )
    .await
    .unwrap()
}

fn offer_for(addr: SocketAddr) -> SessionDescription {
    let mut sdp = SessionDescription::new(addr.ip().to_string());
    let mut audio = MediaDescription::audio(40000 + (addr.port() % 1000));
    audio.push_format(0, "PCMU", 8000, 1);
    sdp.media.push(audio);
    sdp
}

fn uri_of(endpoint: &Endpoint, user: &str) -> Uri {
    let addr = endpoint.local_addr();
    Uri::sip_user(user, addr.ip().to_string()).with_port(addr.port())
}

async fn wait_event<F, T>(rx: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> T
where
    F: FnMut(SessionEvent) -> Option<T>,
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
    .expect("timed out waiting for session event")
}

async fn wait_state(
    rx: &mut mpsc::Receiver<SessionEvent>,
    wanted: CallState,
) -> Option<CallCause> {
    wait_event(rx, |e| match e {
        SessionEvent::StateChanged { new, cause, .. } if new == wanted => Some(cause),
        _ => None,
    })
    .await
}

/// Establish a call between two fresh endpoints and return
/// (alice, bob, their event streams, their session ids).
async fn established_pair() -> (
    Arc<Endpoint>,
    Arc<Endpoint>,
    mpsc::Receiver<SessionEvent>,
    mpsc::Receiver<SessionEvent>,
    SessionId,
    SessionId,
) {
    let (alice, mut alice_rx) = endpoint("alice").await;
    let (bob, mut bob_rx) = endpoint("bob").await;

    let alice_session = alice
        .make_call(uri_of(&bob, "bob"), offer_for(alice.local_addr()))
        .await
        .unwrap();

    let (bob_session, offer) = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::IncomingCall { session, offer, .. } => Some((session, offer)),
        _ => None,
    })
    .await;
    assert!(offer.is_some());

    bob.answer(&bob_session, StatusCode::Ringing, None).await.unwrap();
    bob.answer(&bob_session, StatusCode::Ok, Some(offer_for(bob.local_addr())))
        .await
        .unwrap();

    wait_state(&mut alice_rx, CallState::Confirmed).await;
    wait_state(&mut bob_rx, CallState::Confirmed).await;

    (alice, bob, alice_rx, bob_rx, alice_session, bob_session)
}

#[tokio::test]
async fn basic_call_reaches_confirmed_both_sides() {
    let (alice, bob, _alice_rx, _bob_rx, alice_session, bob_session) =
        established_pair().await;

    assert_eq!(alice.call_state(&alice_session).await.unwrap(), CallState::Confirmed);
    assert_eq!(bob.call_state(&bob_session).await.unwrap(), CallState::Confirmed);

    // Hang up; the caller side reaps the session.
    alice.end_session(&alice_session, 200).await.unwrap();
    assert!(alice.call_state(&alice_session).await.is_err());
}

#[tokio::test]
async fn both_sides_see_negotiated_media() {
    let (alice, mut alice_rx) = endpoint("alice").await;
    let (bob, mut bob_rx) = endpoint("bob").await;

    alice
        .make_call(uri_of(&bob, "bob"), offer_for(alice.local_addr()))
        .await
        .unwrap();
    let bob_session = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::IncomingCall { session, .. } => Some(session),
        _ => None,
    })
    .await;
    bob.answer(&bob_session, StatusCode::Ok, Some(offer_for(bob.local_addr())))
        .await
        .unwrap();

    let media = wait_event(&mut alice_rx, |e| match e {
        SessionEvent::MediaUpdate { media, .. } => Some(media),
        _ => None,
    })
    .await;
    assert_eq!(media.remote.audio_media().unwrap().formats, vec!["0"]);

    let media = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::MediaUpdate { media, .. } => Some(media),
        _ => None,
    })
    .await;
    assert_eq!(media.local.audio_media().unwrap().formats, vec!["0"]);
}

#[tokio::test]
async fn cancel_before_provisional_is_deferred_then_sent() {
    let (alice, mut alice_rx) = endpoint("alice").await;

    // A hand-rolled peer so no 100 Trying is sent automatically.
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let session = alice
        .make_call(
            Uri::sip_user("bob", "127.0.0.1").with_port(peer_addr.port()),
            offer_for(alice.local_addr()),
        )
        .await
        .unwrap();

    // Swallow the INVITE (and its retransmissions).
    let mut buf = vec![0u8; 65535];
    let (len, alice_addr) =
        timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await.unwrap().unwrap();
    let invite = parse_request(&buf[..len]).unwrap();
    assert_eq!(invite.method, Method::Invite);

    // Hang up before any response: the CANCEL must be deferred.
    alice.end_session(&session, 487).await.unwrap();

    // Now the provisional arrives...
    let trying = Response::for_request(StatusCode::Trying, &invite);
    peer.send_to(&trying.print(), alice_addr).await.unwrap();

    // ...and the deferred CANCEL shows up on the wire.
    let cancel = loop {
        let (len, _) =
            timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        if let Ok(req) = parse_request(&buf[..len]) {
            if req.method == Method::Cancel {
                break req;
            }
        }
    };
    assert_eq!(cancel.via_top().unwrap().branch(), invite.via_top().unwrap().branch());

    // Peer answers the CANCEL and terminates the INVITE with 487.
    let ok = Response::for_request(StatusCode::Ok, &cancel);
    peer.send_to(&ok.print(), alice_addr).await.unwrap();
    let mut terminated = Response::for_request(StatusCode::RequestTerminated, &invite);
    if let Some(to_slot) =
        terminated.headers.iter_mut().find(|h| h.name == HeaderName::To)
    {
        if let HeaderValue::Address(to) = &mut to_slot.value {
            to.set_tag("peer487");
        }
    }
    peer.send_to(&terminated.print(), alice_addr).await.unwrap();

    // The session dies with cause 487.
    let cause = wait_state(&mut alice_rx, CallState::Disconnected).await;
    assert_eq!(cause.unwrap().code, 487);
}

#[tokio::test]
async fn hold_and_unhold_round_trip() {
    let (alice, _bob, mut alice_rx, mut bob_rx, alice_session, _bob_session) =
        established_pair().await;

    alice.set_hold(&alice_session, true).await.unwrap();

    let state = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::MediaStateChanged { media, .. } => Some(media),
        _ => None,
    })
    .await;
    assert_eq!(state, MediaState::RemoteHold);

    let state = wait_event(&mut alice_rx, |e| match e {
        SessionEvent::MediaStateChanged { media, .. } => Some(media),
        _ => None,
    })
    .await;
    assert_eq!(state, MediaState::LocalHold);

    alice.set_hold(&alice_session, false).await.unwrap();
    let state = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::MediaStateChanged { media, .. } => Some(media),
        _ => None,
    })
    .await;
    assert_eq!(state, MediaState::Active);
}

#[tokio::test]
async fn overlapping_reinvite_is_refused_locally() {
    let (alice, _bob, _alice_rx, _bob_rx, alice_session, _b) = established_pair().await;

    let offer = offer_for(alice.local_addr());
    alice.reinvite(&alice_session, offer.clone()).await.unwrap();
    // Second re-INVITE while the first is in flight.
    match alice.reinvite(&alice_session, offer).await {
        Err(waveline_session_core::Error::InvitePending) => {}
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn transfer_progress_flows_back_to_referrer() {
    let (alice, bob, mut alice_rx, mut bob_rx, alice_session, bob_session) =
        established_pair().await;

    // Alice asks Bob to call Carol.
    let carol: Address = "<sip:carol@127.0.0.3>".parse().unwrap();
    alice.refer(&alice_session, &carol).await.unwrap();

    // Bob's application learns about the transfer; the engine already
    // answered 202 and sent NOTIFY 100 Trying.
    let refer_to = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::TransferRequested { refer_to, .. } => Some(refer_to),
        _ => None,
    })
    .await;
    assert_eq!(refer_to.uri.user.as_deref(), Some("carol"));

    let (status, terminated) = wait_event(&mut alice_rx, |e| match e {
        SessionEvent::TransferProgress { status, terminated, .. } => {
            Some((status, terminated))
        }
        _ => None,
    })
    .await;
    assert_eq!(status, 100);
    assert!(!terminated);

    // Bob reports the outcome of the new call.
    bob.notify_transfer(&bob_session, 200, "OK").await.unwrap();
    let (status, terminated) = wait_event(&mut alice_rx, |e| match e {
        SessionEvent::TransferProgress { status, terminated, .. } => {
            Some((status, terminated))
        }
        _ => None,
    })
    .await;
    assert_eq!(status, 200);
    assert!(terminated);

    // The referring call is untouched.
    assert_eq!(alice.call_state(&alice_session).await.unwrap(), CallState::Confirmed);
    assert_eq!(bob.call_state(&bob_session).await.unwrap(), CallState::Confirmed);
}

#[tokio::test]
async fn capacity_limit_rejects_with_486() {
    let mut config = CoreConfig::default();
    config.sig.max_calls = 1;
    let (bob, mut bob_rx) = endpoint_with("bob", config).await;

    let (alice1, mut alice1_rx) = endpoint("alice1").await;
    let (alice2, mut alice2_rx) = endpoint("alice2").await;

    let s1 = alice1
        .make_call(uri_of(&bob, "bob"), offer_for(alice1.local_addr()))
        .await
        .unwrap();
    let b1 = wait_event(&mut bob_rx, |e| match e {
        SessionEvent::IncomingCall { session, .. } => Some(session),
        _ => None,
    })
    .await;
    bob.answer(&b1, StatusCode::Ok, Some(offer_for(bob.local_addr()))).await.unwrap();
    wait_state(&mut alice1_rx, CallState::Confirmed).await;
    let _ = s1;

    // Second call hits the full slot table.
    let _s2 = alice2
        .make_call(uri_of(&bob, "bob"), offer_for(alice2.local_addr()))
        .await
        .unwrap();
    let cause = wait_state(&mut alice2_rx, CallState::Disconnected).await;
    assert_eq!(cause.unwrap().code, 486);
}

#[tokio::test]
async fn callee_hangup_disconnects_caller() {
    let (_alice, bob, mut alice_rx, mut bob_rx, _alice_session, bob_session) =
        established_pair().await;

    bob.end_session(&bob_session, 200).await.unwrap();
    wait_state(&mut bob_rx, CallState::Disconnected).await;
    let cause = wait_state(&mut alice_rx, CallState::Disconnected).await;
    assert_eq!(cause.unwrap().code, 200);
}
