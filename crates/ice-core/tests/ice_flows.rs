//! Two ICE agents negotiating over real UDP sockets on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use waveline_ice_core::prelude::*;
use waveline_ice_core::session::OutboundPacket;

/// Wire an ICE session to one UDP socket: drain its outbound queue
/// onto the socket and feed received datagrams back in.
fn wire(session: IceSession, socket: Arc<UdpSocket>, mut packets: mpsc::Receiver<OutboundPacket>) {
    let send_socket = socket.clone();
    tokio::spawn(async move {
        while let Some(packet) = packets.recv().await {
            let _ = send_socket.send_to(&packet.data, packet.dest).await;
        }
    });
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else { break };
            if StunMessage::looks_like_stun(&buf[..len]) {
                let _ = session.handle_packet(&buf[..len], src, 1).await;
            }
        }
    });
}

async fn agent(
    role: IceRole,
) -> (IceSession, mpsc::Receiver<IceEvent>, SocketAddr) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let (session, events, packets) = IceSession::new(role, 1, IceConfig::default());
    session.add_host_candidate(1, addr).await.unwrap();
    wire(session.clone(), socket, packets);
    (session, events, addr)
}

#[tokio::test]
async fn happy_path_nominates_within_a_few_ta() {
    let (left, mut left_events, _) = agent(IceRole::Controlling).await;
    let (right, mut right_events, _) = agent(IceRole::Controlled).await;

    let (l_ufrag, l_pwd) = left.credentials().await;
    let (r_ufrag, r_pwd) = right.credentials().await;

    left.set_remote(r_ufrag.clone(), r_pwd.clone(), right.local_candidates().await)
        .await
        .unwrap();
    right.set_remote(l_ufrag, l_pwd, left.local_candidates().await).await.unwrap();

    left.start().await.unwrap();
    right.start().await.unwrap();

    // Both sides complete; 5 Ta is 100 ms, allow scheduling slack.
    let completed = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(IceEvent::Completed { success }) = left_events.recv().await {
                return success;
            }
        }
    })
    .await
    .expect("controlling agent never completed");
    assert!(completed);

    let completed = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(IceEvent::Completed { success }) = right_events.recv().await {
                return success;
            }
        }
    })
    .await
    .expect("controlled agent never completed");
    assert!(completed);

    // Nominated pairs mirror each other.
    let (l_local, l_remote) = left.nominated_pair(1).await.unwrap();
    let (r_local, r_remote) = right.nominated_pair(1).await.unwrap();
    assert_eq!(l_local.addr, r_remote.addr);
    assert_eq!(l_remote.addr, r_local.addr);
    assert_eq!(left.completion().await, Some(true));
}

#[tokio::test]
async fn media_flows_on_the_nominated_pair() {
    let (left, mut left_events, _) = agent(IceRole::Controlling).await;
    let (right, _right_events, right_addr) = agent(IceRole::Controlled).await;

    let (l_ufrag, l_pwd) = left.credentials().await;
    let (r_ufrag, r_pwd) = right.credentials().await;
    left.set_remote(r_ufrag, r_pwd, right.local_candidates().await).await.unwrap();
    right.set_remote(l_ufrag, l_pwd, left.local_candidates().await).await.unwrap();
    left.start().await.unwrap();
    right.start().await.unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(IceEvent::Completed { success: true }) = left_events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("never completed");

    // send_data routes to the nominated remote address.
    let (_, remote) = left.nominated_pair(1).await.unwrap();
    assert_eq!(remote.addr, right_addr);
    left.send_data(1, bytes::Bytes::from_static(b"rtp-ish")).await.unwrap();
}

#[tokio::test]
async fn nominated_priority_never_downgrades() {
    let (left, mut left_events, _) = agent(IceRole::Controlling).await;
    let (right, _right_events, _) = agent(IceRole::Controlled).await;

    let (l_ufrag, l_pwd) = left.credentials().await;
    let (r_ufrag, r_pwd) = right.credentials().await;
    left.set_remote(r_ufrag, r_pwd, right.local_candidates().await).await.unwrap();
    right.set_remote(l_ufrag, l_pwd, left.local_candidates().await).await.unwrap();
    left.start().await.unwrap();
    right.start().await.unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(IceEvent::Completed { success: true }) = left_events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("never completed");

    // After completion, the nominated check is the highest-priority
    // succeeded check for its component.
    let checks = left.checks().await;
    let (nominated_local, _) = left.nominated_pair(1).await.unwrap();
    let nominated_priority = checks
        .iter()
        .find(|c| c.nominated && c.state == CheckState::Succeeded)
        .map(|c| c.priority)
        .unwrap();
    for check in checks.iter().filter(|c| c.state == CheckState::Succeeded) {
        assert!(check.priority <= nominated_priority || !check.nominated);
    }
    assert_eq!(nominated_local.component, 1);
}

#[tokio::test]
async fn checks_fail_toward_unreachable_peer() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let config = IceConfig {
        rto: Duration::from_millis(30),
        max_retransmits: 2,
        ..IceConfig::default()
    };
    let (session, mut events, packets) = IceSession::new(IceRole::Controlling, 1, config);
    session.add_host_candidate(1, addr).await.unwrap();
    wire(session.clone(), socket, packets);

    // A remote candidate nobody answers on.
    let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    session
        .set_remote("r", "p", vec![Candidate::host(1, dead_addr).unwrap()])
        .await
        .unwrap();
    session.start().await.unwrap();

    let completed = timeout(Duration::from_secs(3), async {
        loop {
            if let Some(IceEvent::Completed { success }) = events.recv().await {
                return success;
            }
        }
    })
    .await
    .expect("failure never reported");
    assert!(!completed);
}
