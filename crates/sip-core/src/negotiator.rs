//! SDP offer/answer negotiator (RFC 3264).
//!
//! Pure data, advanced only by the INVITE session. The negotiator
//! holds the in-flight offer/answer pair plus the last negotiated
//! ("active") pair, and moves through
//! `Null → LocalOffer|RemoteOffer → WaitNego → Done`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sdp::{MediaDescription, SessionDescription};

/// Negotiator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiatorState {
    /// Nothing offered yet.
    Null,
    /// We sent an offer and await the answer.
    LocalOffer,
    /// We received an offer and owe an answer.
    RemoteOffer,
    /// Both sides are on the table, `negotiate()` not yet run.
    WaitNego,
    /// Negotiation complete; active SDPs are valid.
    Done,
}

/// Outcome of a completed negotiation, ready for the media layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedMedia {
    pub local: SessionDescription,
    pub remote: SessionDescription,
}

/// The offer/answer state machine.
#[derive(Debug, Clone)]
pub struct SdpNegotiator {
    state: NegotiatorState,
    local_offer: Option<SessionDescription>,
    remote_offer: Option<SessionDescription>,
    local_answer: Option<SessionDescription>,
    remote_answer: Option<SessionDescription>,
    active_local: Option<SessionDescription>,
    active_remote: Option<SessionDescription>,
}

impl SdpNegotiator {
    pub fn new() -> Self {
        SdpNegotiator {
            state: NegotiatorState::Null,
            local_offer: None,
            remote_offer: None,
            local_answer: None,
            remote_answer: None,
            active_local: None,
            active_remote: None,
        }
    }

    /// Negotiator primed with an outgoing offer.
    pub fn with_local_offer(offer: SessionDescription) -> Result<Self> {
        let mut neg = SdpNegotiator::new();
        neg.set_local_offer(offer)?;
        Ok(neg)
    }

    /// Negotiator primed with a received offer.
    pub fn with_remote_offer(offer: SessionDescription) -> Result<Self> {
        let mut neg = SdpNegotiator::new();
        neg.set_remote_offer(offer)?;
        Ok(neg)
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Negotiated SDPs after `negotiate()` succeeded.
    pub fn active(&self) -> Option<NegotiatedMedia> {
        match (&self.active_local, &self.active_remote) {
            (Some(local), Some(remote)) => {
                Some(NegotiatedMedia { local: local.clone(), remote: remote.clone() })
            }
            _ => None,
        }
    }

    /// The offer we owe an answer to.
    pub fn remote_offer(&self) -> Option<&SessionDescription> {
        self.remote_offer.as_ref()
    }

    /// Register an outgoing offer. Valid from Null and Done (re-offer).
    pub fn set_local_offer(&mut self, offer: SessionDescription) -> Result<()> {
        match self.state {
            NegotiatorState::Null | NegotiatorState::Done | NegotiatorState::LocalOffer => {
                self.local_offer = Some(offer);
                self.remote_answer = None;
                self.state = NegotiatorState::LocalOffer;
                Ok(())
            }
            _ => Err(Error::InvalidNegotiatorState("set_local_offer")),
        }
    }

    /// Register a received offer. Valid from Null and Done (re-offer).
    pub fn set_remote_offer(&mut self, offer: SessionDescription) -> Result<()> {
        match self.state {
            NegotiatorState::Null | NegotiatorState::Done => {
                self.remote_offer = Some(offer);
                self.local_answer = None;
                self.state = NegotiatorState::RemoteOffer;
                Ok(())
            }
            _ => Err(Error::InvalidNegotiatorState("set_remote_offer")),
        }
    }

    /// Register the answer to a received offer.
    pub fn set_local_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.state != NegotiatorState::RemoteOffer {
            return Err(Error::InvalidNegotiatorState("set_local_answer"));
        }
        self.local_answer = Some(answer);
        self.state = NegotiatorState::WaitNego;
        Ok(())
    }

    /// Register the peer's answer to our offer.
    pub fn set_remote_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.state != NegotiatorState::LocalOffer {
            return Err(Error::InvalidNegotiatorState("set_remote_answer"));
        }
        self.remote_answer = Some(answer);
        self.state = NegotiatorState::WaitNego;
        Ok(())
    }

    /// Run the negotiation on the stored offer/answer pair.
    ///
    /// On success the state is Done and `active()` yields the pair.
    /// On failure the previous active pair (if any) stays valid and
    /// the state returns to Done or Null accordingly.
    pub fn negotiate(&mut self) -> Result<NegotiatedMedia> {
        if self.state != NegotiatorState::WaitNego {
            return Err(Error::InvalidNegotiatorState("negotiate"));
        }

        let (local, remote) = if let (Some(offer), Some(answer)) =
            (self.local_offer.take(), self.remote_answer.take())
        {
            (offer, answer)
        } else if let (Some(offer), Some(answer)) =
            (self.remote_offer.take(), self.local_answer.take())
        {
            (answer, offer)
        } else {
            self.rollback();
            return Err(Error::InvalidNegotiatorState("negotiate"));
        };

        match check_compatible(&local, &remote) {
            Ok(()) => {
                self.active_local = Some(local.clone());
                self.active_remote = Some(remote.clone());
                self.state = NegotiatorState::Done;
                Ok(NegotiatedMedia { local, remote })
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Build the answer to the current remote offer: mirror the
    /// stream list, keep only payload types we also support, reverse
    /// the direction. `local_template` supplies our address, port and
    /// codec set.
    pub fn build_answer(&self, local_template: &SessionDescription) -> Result<SessionDescription> {
        let offer = self
            .remote_offer
            .as_ref()
            .ok_or(Error::InvalidNegotiatorState("build_answer"))?;

        let mut answer = local_template.clone();
        answer.media.clear();

        for offered in &offer.media {
            let ours = local_template.media.iter().find(|m| m.media == offered.media);
            let mut m = match ours {
                Some(template) if !offered.is_disabled() => {
                    let common = common_formats(template, offered);
                    if common.is_empty() {
                        // Reject this stream only.
                        rejected_stream(offered)
                    } else {
                        let mut m = template.clone();
                        m.transport = offered.transport.clone();
                        m.formats = common;
                        m.attributes.retain(|a| {
                            a.name != "rtpmap" && a.name != "fmtp"
                        });
                        for fmt in &m.formats {
                            if let Ok(pt) = fmt.parse::<u8>() {
                                if let Some(map) = offered.rtpmap(pt) {
                                    let value = if map.channels > 1 {
                                        format!(
                                            "{} {}/{}/{}",
                                            map.payload, map.encoding, map.clock_rate, map.channels
                                        )
                                    } else {
                                        format!("{} {}/{}", map.payload, map.encoding, map.clock_rate)
                                    };
                                    m.attributes.push(crate::sdp::SdpAttribute::value("rtpmap", value));
                                }
                            }
                        }
                        m.set_direction(offered.direction().reversed());
                        m
                    }
                }
                _ => rejected_stream(offered),
            };
            // A disabled offer stream must stay disabled in the answer.
            if offered.is_disabled() {
                m.port = 0;
            }
            answer.media.push(m);
        }

        if answer.media.iter().all(MediaDescription::is_disabled) {
            return Err(Error::NoAcceptableMedia("no common codec in any stream".to_string()));
        }
        Ok(answer)
    }

    fn rollback(&mut self) {
        self.local_offer = None;
        self.remote_offer = None;
        self.local_answer = None;
        self.remote_answer = None;
        self.state = if self.active_local.is_some() {
            NegotiatorState::Done
        } else {
            NegotiatorState::Null
        };
    }
}

impl Default for SdpNegotiator {
    fn default() -> Self {
        SdpNegotiator::new()
    }
}

/// Formats present in both media blocks, in the offerer's order.
fn common_formats(ours: &MediaDescription, theirs: &MediaDescription) -> Vec<String> {
    theirs
        .formats
        .iter()
        .filter(|fmt| {
            if ours.formats.iter().any(|f| f == *fmt) {
                return true;
            }
            // Dynamic payloads match by encoding name, rate and channels.
            match fmt.parse::<u8>().ok() {
                Some(pt) if pt >= 96 => theirs.rtpmap(pt).map_or(false, |map| {
                    ours.formats.iter().any(|of| {
                        of.parse::<u8>().ok().and_then(|opt| ours.rtpmap(opt)).map_or(
                            false,
                            |omap| {
                                omap.encoding.eq_ignore_ascii_case(&map.encoding)
                                    && omap.clock_rate == map.clock_rate
                                    && omap.channels == map.channels
                            },
                        )
                    })
                }),
                _ => false,
            }
        })
        .cloned()
        .collect()
}

fn rejected_stream(offered: &MediaDescription) -> MediaDescription {
    MediaDescription {
        media: offered.media.clone(),
        port: 0,
        transport: offered.transport.clone(),
        formats: offered.formats.clone(),
        connection: None,
        attributes: Vec::new(),
    }
}

/// Both descriptions must share at least one live audio stream with a
/// common format.
fn check_compatible(local: &SessionDescription, remote: &SessionDescription) -> Result<()> {
    for (ours, theirs) in local.media.iter().zip(remote.media.iter()) {
        if ours.media != theirs.media {
            continue;
        }
        if ours.is_disabled() || theirs.is_disabled() {
            continue;
        }
        if !common_formats(ours, theirs).is_empty() {
            return Ok(());
        }
    }
    Err(Error::NoAcceptableMedia("offer and answer share no live stream".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::Direction;

    fn offer_pcmu() -> SessionDescription {
        "v=0\r\no=alice 1 1 IN IP4 a.com\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\n\
         m=audio 4000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n"
            .parse()
            .unwrap()
    }

    fn answer_pcmu() -> SessionDescription {
        "v=0\r\no=bob 1 1 IN IP4 b.com\r\ns=-\r\nc=IN IP4 192.0.2.2\r\nt=0 0\r\n\
         m=audio 5000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n"
            .parse()
            .unwrap()
    }

    fn answer_gsm_only() -> SessionDescription {
        "v=0\r\no=bob 1 1 IN IP4 b.com\r\ns=-\r\nc=IN IP4 192.0.2.2\r\nt=0 0\r\n\
         m=audio 5000 RTP/AVP 3\r\na=rtpmap:3 GSM/8000\r\n"
            .parse()
            .unwrap()
    }

    #[test]
    fn uac_flow_reaches_done() {
        let mut neg = SdpNegotiator::with_local_offer(offer_pcmu()).unwrap();
        assert_eq!(neg.state(), NegotiatorState::LocalOffer);
        neg.set_remote_answer(answer_pcmu()).unwrap();
        assert_eq!(neg.state(), NegotiatorState::WaitNego);
        let media = neg.negotiate().unwrap();
        assert_eq!(neg.state(), NegotiatorState::Done);
        assert_eq!(media.remote.audio_media().unwrap().port, 5000);
        assert!(neg.active().is_some());
    }

    #[test]
    fn uas_flow_reaches_done() {
        let mut neg = SdpNegotiator::with_remote_offer(offer_pcmu()).unwrap();
        assert_eq!(neg.state(), NegotiatorState::RemoteOffer);
        let answer = neg.build_answer(&answer_pcmu()).unwrap();
        assert_eq!(answer.audio_media().unwrap().formats, vec!["0"]);
        neg.set_local_answer(answer).unwrap();
        neg.negotiate().unwrap();
        assert_eq!(neg.state(), NegotiatorState::Done);
    }

    #[test]
    fn answer_reverses_direction() {
        let mut offer = offer_pcmu();
        offer.audio_media_mut().unwrap().set_direction(Direction::SendOnly);
        let neg = SdpNegotiator::with_remote_offer(offer).unwrap();
        let answer = neg.build_answer(&answer_pcmu()).unwrap();
        assert_eq!(answer.audio_media().unwrap().direction(), Direction::RecvOnly);
    }

    #[test]
    fn no_common_codec_fails_and_rolls_back() {
        let mut neg = SdpNegotiator::with_local_offer(offer_pcmu()).unwrap();
        neg.set_remote_answer(answer_gsm_only()).unwrap();
        match neg.negotiate() {
            Err(Error::NoAcceptableMedia(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        // No prior active SDP, so the machine drops back to Null.
        assert_eq!(neg.state(), NegotiatorState::Null);
        assert!(neg.active().is_none());
    }

    #[test]
    fn renegotiation_failure_keeps_previous_active() {
        let mut neg = SdpNegotiator::with_local_offer(offer_pcmu()).unwrap();
        neg.set_remote_answer(answer_pcmu()).unwrap();
        neg.negotiate().unwrap();

        // Re-offer meets an incompatible answer.
        neg.set_local_offer(offer_pcmu()).unwrap();
        neg.set_remote_answer(answer_gsm_only()).unwrap();
        assert!(neg.negotiate().is_err());
        assert_eq!(neg.state(), NegotiatorState::Done);
        let active = neg.active().unwrap();
        assert_eq!(active.remote.audio_media().unwrap().port, 5000);
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let mut neg = SdpNegotiator::new();
        assert!(neg.set_remote_answer(answer_pcmu()).is_err());
        assert!(neg.negotiate().is_err());
        assert!(neg.set_local_answer(answer_pcmu()).is_err());
    }

    #[test]
    fn dynamic_payloads_match_by_encoding() {
        let offer: SessionDescription =
            "v=0\r\no=a 1 1 IN IP4 a\r\ns=-\r\nc=IN IP4 1.1.1.1\r\nt=0 0\r\n\
             m=audio 4000 RTP/AVP 96\r\na=rtpmap:96 opus/48000/2\r\n"
                .parse()
                .unwrap();
        let ours: SessionDescription =
            "v=0\r\no=b 1 1 IN IP4 b\r\ns=-\r\nc=IN IP4 2.2.2.2\r\nt=0 0\r\n\
             m=audio 5000 RTP/AVP 102\r\na=rtpmap:102 opus/48000/2\r\n"
                .parse()
                .unwrap();
        let neg = SdpNegotiator::with_remote_offer(offer).unwrap();
        let answer = neg.build_answer(&ours).unwrap();
        // The answer echoes the offerer's payload number.
        assert_eq!(answer.audio_media().unwrap().formats, vec!["96"]);
    }
}
