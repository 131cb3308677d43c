//! SDP print/parse round trips over generated descriptions.

use proptest::prelude::*;
use waveline_sip_core::prelude::*;

fn build_sdp(addr: &str, port: u16, payloads: &[u8], ptime: Option<u32>) -> SessionDescription {
    let mut sdp = SessionDescription::new(addr.to_string());
    let mut audio = MediaDescription::audio(port);
    for &pt in payloads {
        match pt {
            0 => audio.push_format(0, "PCMU", 8000, 1),
            8 => audio.push_format(8, "PCMA", 8000, 1),
            3 => audio.push_format(3, "GSM", 8000, 1),
            n => audio.push_format(n, "opus", 48000, 2),
        }
    }
    if let Some(pt) = ptime {
        audio.attributes.push(SdpAttribute::value("ptime", pt.to_string()));
    }
    sdp.media.push(audio);
    sdp
}

#[test]
fn typical_offer_round_trips() {
    let sdp = build_sdp("192.0.2.10", 49170, &[0, 8, 96], Some(20));
    let reparsed: SessionDescription = sdp.print().parse().unwrap();
    assert_eq!(reparsed, sdp);
}

#[test]
fn direction_attributes_round_trip() {
    for dir in [Direction::SendRecv, Direction::SendOnly, Direction::RecvOnly, Direction::Inactive]
    {
        let mut sdp = build_sdp("192.0.2.10", 4000, &[0], None);
        sdp.audio_media_mut().unwrap().set_direction(dir);
        let reparsed: SessionDescription = sdp.print().parse().unwrap();
        assert_eq!(reparsed.audio_media().unwrap().direction(), dir);
        assert_eq!(reparsed, sdp);
    }
}

proptest! {
    #[test]
    fn generated_descriptions_round_trip(
        port in 1024u16..65535,
        last_octet in 1u8..255,
        dynamic_pt in 96u8..128,
        ptime in proptest::option::of(10u32..60),
    ) {
        let addr = format!("192.0.2.{}", last_octet);
        let sdp = build_sdp(&addr, port, &[0, 8, dynamic_pt], ptime);
        let reparsed: SessionDescription = sdp.print().parse().unwrap();
        prop_assert_eq!(reparsed, sdp);
    }
}
