//! Media session glue: turn a negotiated SDP pair into one audio
//! stream, expose it as a conference port, and keep RTP sequence and
//! timestamp continuity across restarts.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use waveline_infra_common::config::JitterBufferConfig;
use waveline_sip_core::sdp::SessionDescription;

use crate::error::{Error, Result};
use crate::port::MediaPort;
use crate::types::{AudioFrame, FrameKind, Sample};

/// Encode/decode one codec's frames. Implementations live outside the
/// core (G.711, GSM, Speex...).
pub trait Codec: Send {
    fn encode(&mut self, samples: &[Sample]) -> Result<Bytes>;
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<Sample>>;
}

/// Produces codecs for negotiated payloads; consumed by the core.
pub trait CodecFactory: Send + Sync {
    /// Instantiate a codec for an encoding name and clock rate.
    fn create(&self, encoding: &str, clock_rate: u32) -> Option<Box<dyn Codec>>;
}

/// Datagram sender for RTP; the socket (or ICE transport) is owned by
/// whoever built the stream.
pub trait PacketTransport: Send + Sync {
    fn send(&self, data: &[u8], dest: SocketAddr) -> Result<()>;
}

/// Everything needed to run one audio stream, extracted from the
/// negotiated local/remote SDP pair.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Where RTP goes.
    pub remote_rtp: SocketAddr,
    /// RTCP is the next port up unless the peer said otherwise.
    pub remote_rtcp: SocketAddr,
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
    /// Packet time in milliseconds.
    pub ptime: u32,
    pub jitter: JitterBufferConfig,
    /// SRTP keying material (`a=crypto` lines) when the transport is
    /// RTP/SAVP.
    pub crypto: Vec<String>,
    pub srtp: bool,
}

impl StreamInfo {
    /// Build stream parameters from a negotiated SDP pair.
    pub fn from_sdp(
        local: &SessionDescription,
        remote: &SessionDescription,
        jitter: JitterBufferConfig,
    ) -> Result<StreamInfo> {
        let remote_audio = remote
            .audio_media()
            .ok_or_else(|| Error::BadStreamInfo("remote SDP has no audio".to_string()))?;
        if remote_audio.is_disabled() {
            return Err(Error::BadStreamInfo("remote audio is disabled".to_string()));
        }
        let media_index = remote
            .media
            .iter()
            .position(|m| m.media == "audio")
            .unwrap_or(0);
        let connection = remote
            .connection_for(media_index)
            .ok_or_else(|| Error::BadStreamInfo("remote SDP has no connection".to_string()))?;
        let ip: std::net::IpAddr = connection
            .address
            .parse()
            .map_err(|_| Error::BadStreamInfo(format!("bad address {}", connection.address)))?;
        let remote_rtp = SocketAddr::new(ip, remote_audio.port);
        let remote_rtcp = SocketAddr::new(ip, remote_audio.port + 1);

        // First negotiated format wins.
        let local_audio = local
            .audio_media()
            .ok_or_else(|| Error::BadStreamInfo("local SDP has no audio".to_string()))?;
        let format = local_audio
            .formats
            .first()
            .ok_or_else(|| Error::BadStreamInfo("no negotiated format".to_string()))?;
        let payload_type: u8 = format
            .parse()
            .map_err(|_| Error::BadStreamInfo(format!("bad payload type {}", format)))?;
        let (encoding, clock_rate, channels) = match local_audio.rtpmap(payload_type) {
            Some(map) => (map.encoding, map.clock_rate, map.channels),
            // Static payload types may omit the rtpmap.
            None => match payload_type {
                0 => ("PCMU".to_string(), 8000, 1),
                8 => ("PCMA".to_string(), 8000, 1),
                3 => ("GSM".to_string(), 8000, 1),
                other => {
                    return Err(Error::BadStreamInfo(format!(
                        "dynamic payload {} without rtpmap",
                        other
                    )));
                }
            },
        };

        let ptime = remote_audio.ptime().or_else(|| local_audio.ptime()).unwrap_or(20);
        let srtp = remote_audio.is_srtp();
        let crypto = remote_audio.crypto_attributes().map(|s| s.to_string()).collect();

        Ok(StreamInfo {
            remote_rtp,
            remote_rtcp,
            payload_type,
            encoding,
            clock_rate,
            channels,
            ptime,
            jitter,
            crypto,
            srtp,
        })
    }

    /// Samples per frame at the stream's clock rate.
    pub fn samples_per_frame(&self) -> usize {
        (self.clock_rate as usize * self.ptime as usize * self.channels as usize) / 1000
    }
}

const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// A parsed RTP packet, just what the stream needs.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse an RTP datagram (RFC 3550 §5.1).
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::BadRtp("short packet".to_string()));
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(Error::BadRtp(format!("version {}", data[0] >> 6)));
        }
        let csrc_count = (data[0] & 0x0F) as usize;
        let header_len = RTP_HEADER_LEN + csrc_count * 4;
        if data.len() < header_len {
            return Err(Error::BadRtp("truncated CSRC list".to_string()));
        }
        Ok(RtpPacket {
            payload_type: data[1] & 0x7F,
            marker: data[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: Bytes::copy_from_slice(&data[header_len..]),
        })
    }

    /// Serialise with no CSRCs or extensions.
    pub fn build(
        payload_type: u8,
        marker: bool,
        sequence: u16,
        timestamp: u32,
        ssrc: u32,
        payload: &[u8],
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(if marker { 0x80 } else { 0 } | (payload_type & 0x7F));
        buf.put_u16(sequence);
        buf.put_u32(timestamp);
        buf.put_u32(ssrc);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// A small reorder buffer in front of the decoder.
///
/// Frames are keyed by RTP sequence number with wrap-aware ordering;
/// playback starts once `prefetch` frames are buffered and then
/// follows the sequence, reporting gaps as unplayable ticks.
pub struct JitterBuffer {
    frames: std::collections::BTreeMap<u16, Bytes>,
    /// Frames to hold before the first pop.
    prefetch: usize,
    max_frames: usize,
    expected: Option<u16>,
    prefetching: bool,
}

impl JitterBuffer {
    pub fn new(config: &JitterBufferConfig, ptime: u32) -> JitterBuffer {
        // Millisecond bounds become frame counts; -1 keeps defaults.
        let to_frames = |ms: i32, default: usize| {
            if ms < 0 { default } else { (ms as u32 / ptime.max(1)) as usize }
        };
        JitterBuffer {
            frames: std::collections::BTreeMap::new(),
            prefetch: to_frames(config.min_pre, 1),
            max_frames: to_frames(config.max, 16).max(2),
            expected: None,
            prefetching: true,
        }
    }

    /// The sequence every other buffered sequence is "ahead of",
    /// under wrapping arithmetic.
    fn oldest(&self) -> Option<u16> {
        let keys: Vec<u16> = self.frames.keys().copied().collect();
        keys.iter().copied().find(|&s| keys.iter().all(|&o| o.wrapping_sub(s) < 0x8000))
    }

    pub fn push(&mut self, seq: u16, payload: Bytes) {
        // Frames behind the playback point arrive too late to matter.
        if let Some(expected) = self.expected {
            let behind = expected.wrapping_sub(seq);
            if behind > 0 && behind < 0x8000 {
                return;
            }
        }
        if self.frames.len() >= self.max_frames {
            // Drop the oldest to bound latency.
            if let Some(oldest) = self.oldest() {
                self.frames.remove(&oldest);
            }
        }
        self.frames.insert(seq, payload);
    }

    /// Pop the next frame in order, or `None` when the buffer has
    /// nothing playable (prefetching or a gap).
    pub fn pop(&mut self) -> Option<Bytes> {
        if self.prefetching {
            if self.frames.len() <= self.prefetch {
                return None;
            }
            self.prefetching = false;
        }
        let expected = match self.expected {
            Some(seq) => seq,
            None => {
                let oldest = self.oldest()?;
                self.expected = Some(oldest);
                oldest
            }
        };
        match self.frames.remove(&expected) {
            Some(payload) => {
                self.expected = Some(expected.wrapping_add(1));
                Some(payload)
            }
            None => {
                // A persistent gap with plenty buffered: jump the
                // playback point forward rather than stalling.
                if self.frames.len() >= self.max_frames / 2 {
                    self.expected = self.oldest();
                }
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// One running audio stream, usable as a conference port: `get_frame`
/// pops the jitter buffer and decodes, `put_frame` encodes and ships
/// RTP.
pub struct MediaStream {
    name: String,
    info: StreamInfo,
    codec: Box<dyn Codec>,
    jitter: JitterBuffer,
    transport: Arc<dyn PacketTransport>,
    ssrc: u32,
    /// RTP continuity state, preserved across restarts.
    last_seq: u16,
    last_ts: u32,
    samples_per_frame: usize,
}

impl MediaStream {
    pub fn new(
        info: StreamInfo,
        factory: &dyn CodecFactory,
        transport: Arc<dyn PacketTransport>,
    ) -> Result<MediaStream> {
        let codec = factory
            .create(&info.encoding, info.clock_rate)
            .ok_or(Error::NoCodec(info.payload_type))?;
        let samples_per_frame = info.samples_per_frame();
        Ok(MediaStream {
            name: format!("stream/{}@{}", info.encoding, info.remote_rtp),
            jitter: JitterBuffer::new(&info.jitter, info.ptime),
            codec,
            transport,
            ssrc: rand::random(),
            last_seq: rand::random(),
            last_ts: rand::random(),
            samples_per_frame,
            info,
        })
    }

    /// Rebuild the stream for a changed remote (re-INVITE) while
    /// keeping sequence/timestamp continuity.
    pub fn restart(
        self,
        info: StreamInfo,
        factory: &dyn CodecFactory,
        transport: Arc<dyn PacketTransport>,
    ) -> Result<MediaStream> {
        let codec = factory
            .create(&info.encoding, info.clock_rate)
            .ok_or(Error::NoCodec(info.payload_type))?;
        let samples_per_frame = info.samples_per_frame();
        debug!(last_seq = self.last_seq, last_ts = self.last_ts, "stream restarted");
        Ok(MediaStream {
            name: format!("stream/{}@{}", info.encoding, info.remote_rtp),
            jitter: JitterBuffer::new(&info.jitter, info.ptime),
            codec,
            transport,
            ssrc: self.ssrc,
            last_seq: self.last_seq,
            last_ts: self.last_ts,
            samples_per_frame,
            info,
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// RTP continuity state (sequence, timestamp).
    pub fn rtp_state(&self) -> (u16, u32) {
        (self.last_seq, self.last_ts)
    }

    /// Feed one received RTP datagram into the jitter buffer.
    pub fn on_rx_rtp(&mut self, data: &[u8]) -> Result<()> {
        let packet = RtpPacket::parse(data)?;
        if packet.payload_type != self.info.payload_type {
            trace!(pt = packet.payload_type, "dropping packet with foreign payload type");
            return Ok(());
        }
        self.jitter.push(packet.sequence, packet.payload);
        Ok(())
    }
}

impl MediaPort for MediaStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn clock_rate(&self) -> u32 {
        self.info.clock_rate
    }

    fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    fn get_frame(&mut self, timestamp: u64) -> Result<AudioFrame> {
        match self.jitter.pop() {
            Some(payload) => {
                let samples = self.codec.decode(&payload)?;
                Ok(AudioFrame::audio(samples, timestamp))
            }
            None => Ok(AudioFrame::no_audio(timestamp)),
        }
    }

    fn put_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if frame.kind == FrameKind::NoAudio {
            // DTX: advance the timestamp without emitting a packet.
            self.last_ts = self.last_ts.wrapping_add(self.samples_per_frame as u32);
            return Ok(());
        }
        let payload = self.codec.encode(&frame.samples)?;
        self.last_seq = self.last_seq.wrapping_add(1);
        self.last_ts = self.last_ts.wrapping_add(self.samples_per_frame as u32);
        let packet = RtpPacket::build(
            self.info.payload_type,
            false,
            self.last_seq,
            self.last_ts,
            self.ssrc,
            &payload,
        );
        self.transport
            .send(&packet, self.info.remote_rtp)
            .map_err(|e| {
                warn!(error = %e, "RTP send failed");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sdp(addr: &str, port: u16, formats: &str, extra: &str) -> SessionDescription {
        format!(
            "v=0\r\no=- 1 1 IN IP4 {addr}\r\ns=-\r\nc=IN IP4 {addr}\r\nt=0 0\r\n\
             m=audio {port} RTP/AVP {formats}\r\na=rtpmap:0 PCMU/8000\r\n{extra}",
        )
        .parse()
        .unwrap()
    }

    #[test]
    fn stream_info_from_negotiated_pair() {
        let local = sdp("192.0.2.1", 4000, "0", "a=ptime:20\r\n");
        let remote = sdp("192.0.2.2", 5004, "0", "");
        let info = StreamInfo::from_sdp(&local, &remote, JitterBufferConfig::default()).unwrap();
        assert_eq!(info.remote_rtp, "192.0.2.2:5004".parse().unwrap());
        assert_eq!(info.remote_rtcp, "192.0.2.2:5005".parse().unwrap());
        assert_eq!(info.encoding, "PCMU");
        assert_eq!(info.clock_rate, 8000);
        assert_eq!(info.ptime, 20);
        assert_eq!(info.samples_per_frame(), 160);
        assert!(!info.srtp);
    }

    #[test]
    fn srtp_info_carries_crypto() {
        let local = sdp("192.0.2.1", 4000, "0", "");
        let remote_raw = sdp("192.0.2.2", 5004, "0", "a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:abc\r\n");
        let mut remote = remote_raw;
        remote.audio_media_mut().unwrap().transport = "RTP/SAVP".to_string();
        let info = StreamInfo::from_sdp(&local, &remote, JitterBufferConfig::default()).unwrap();
        assert!(info.srtp);
        assert_eq!(info.crypto.len(), 1);
    }

    #[test]
    fn disabled_remote_stream_is_an_error() {
        let local = sdp("192.0.2.1", 4000, "0", "");
        let remote = sdp("192.0.2.2", 0, "0", "");
        assert!(StreamInfo::from_sdp(&local, &remote, JitterBufferConfig::default()).is_err());
    }

    #[test]
    fn rtp_round_trip() {
        let wire = RtpPacket::build(0, true, 42, 16000, 0xdeadbeef, b"payload");
        let packet = RtpPacket::parse(&wire).unwrap();
        assert_eq!(packet.payload_type, 0);
        assert!(packet.marker);
        assert_eq!(packet.sequence, 42);
        assert_eq!(packet.timestamp, 16000);
        assert_eq!(packet.ssrc, 0xdeadbeef);
        assert_eq!(packet.payload.as_ref(), b"payload");
    }

    #[test]
    fn jitter_buffer_reorders() {
        let mut jb = JitterBuffer::new(&JitterBufferConfig::default(), 20);
        jb.push(11, Bytes::from_static(b"b"));
        jb.push(10, Bytes::from_static(b"a"));
        jb.push(12, Bytes::from_static(b"c"));
        assert_eq!(jb.pop().unwrap().as_ref(), b"a");
        assert_eq!(jb.pop().unwrap().as_ref(), b"b");
        assert_eq!(jb.pop().unwrap().as_ref(), b"c");
        assert!(jb.pop().is_none());
    }

    #[test]
    fn jitter_buffer_prefetch_holds_first_pop() {
        let config = JitterBufferConfig { min_pre: 40, ..JitterBufferConfig::default() };
        let mut jb = JitterBuffer::new(&config, 20);
        jb.push(1, Bytes::from_static(b"a"));
        assert!(jb.pop().is_none());
        jb.push(2, Bytes::from_static(b"b"));
        assert!(jb.pop().is_none());
        jb.push(3, Bytes::from_static(b"c"));
        assert_eq!(jb.pop().unwrap().as_ref(), b"a");
    }

    struct LoopCodec;
    impl Codec for LoopCodec {
        fn encode(&mut self, samples: &[Sample]) -> Result<Bytes> {
            let mut buf = BytesMut::with_capacity(samples.len() * 2);
            for s in samples {
                buf.put_i16(*s);
            }
            Ok(buf.freeze())
        }
        fn decode(&mut self, payload: &[u8]) -> Result<Vec<Sample>> {
            Ok(payload
                .chunks_exact(2)
                .map(|c| i16::from_be_bytes([c[0], c[1]]))
                .collect())
        }
    }

    struct LoopFactory;
    impl CodecFactory for LoopFactory {
        fn create(&self, _encoding: &str, _clock_rate: u32) -> Option<Box<dyn Codec>> {
            Some(Box::new(LoopCodec))
        }
    }

    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }
    impl PacketTransport for CaptureTransport {
        fn send(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push((data.to_vec(), dest));
            Ok(())
        }
    }

    fn stream_with_transport() -> (MediaStream, Arc<CaptureTransport>) {
        let local = sdp("192.0.2.1", 4000, "0", "");
        let remote = sdp("192.0.2.2", 5004, "0", "");
        let info = StreamInfo::from_sdp(&local, &remote, JitterBufferConfig::default()).unwrap();
        let transport = Arc::new(CaptureTransport::default());
        let stream = MediaStream::new(info, &LoopFactory, transport.clone()).unwrap();
        (stream, transport)
    }

    #[test]
    fn put_frame_ships_rtp_with_increasing_seq() {
        let (mut stream, transport) = stream_with_transport();
        let frame = AudioFrame::audio(vec![1i16; 160], 0);
        stream.put_frame(&frame).unwrap();
        stream.put_frame(&frame).unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let first = RtpPacket::parse(&sent[0].0).unwrap();
        let second = RtpPacket::parse(&sent[1].0).unwrap();
        assert_eq!(second.sequence, first.sequence.wrapping_add(1));
        assert_eq!(second.timestamp, first.timestamp.wrapping_add(160));
        assert_eq!(sent[0].1, "192.0.2.2:5004".parse().unwrap());
    }

    #[test]
    fn no_audio_frames_advance_ts_without_packets() {
        let (mut stream, transport) = stream_with_transport();
        stream.put_frame(&AudioFrame::no_audio(0)).unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
        let (_, ts_after) = stream.rtp_state();
        stream.put_frame(&AudioFrame::audio(vec![0i16; 160], 0)).unwrap();
        let sent = transport.sent.lock().unwrap();
        let packet = RtpPacket::parse(&sent[0].0).unwrap();
        assert_eq!(packet.timestamp, ts_after.wrapping_add(160));
    }

    #[test]
    fn restart_preserves_rtp_continuity() {
        let (mut stream, _transport) = stream_with_transport();
        stream.put_frame(&AudioFrame::audio(vec![0i16; 160], 0)).unwrap();
        let (seq, ts) = stream.rtp_state();

        let local = sdp("192.0.2.1", 4000, "0", "");
        let remote = sdp("198.51.100.7", 6004, "0", "");
        let new_info =
            StreamInfo::from_sdp(&local, &remote, JitterBufferConfig::default()).unwrap();
        let transport = Arc::new(CaptureTransport::default());
        let restarted = stream.restart(new_info, &LoopFactory, transport.clone()).unwrap();
        assert_eq!(restarted.rtp_state(), (seq, ts));
        assert_eq!(restarted.info().remote_rtp, "198.51.100.7:6004".parse().unwrap());
    }

    #[test]
    fn rx_path_decodes_in_order() {
        let (mut stream, _transport) = stream_with_transport();
        let mut codec = LoopCodec;
        for seq in [2u16, 1, 3] {
            let payload = codec.encode(&vec![seq as i16; 160]).unwrap();
            let wire = RtpPacket::build(0, false, seq, seq as u32 * 160, 7, &payload);
            stream.on_rx_rtp(&wire).unwrap();
        }
        let first = stream.get_frame(0).unwrap();
        assert_eq!(first.kind, FrameKind::Audio);
        assert_eq!(first.samples[0], 1);
        assert_eq!(stream.get_frame(0).unwrap().samples[0], 2);
        assert_eq!(stream.get_frame(0).unwrap().samples[0], 3);
        assert_eq!(stream.get_frame(0).unwrap().kind, FrameKind::NoAudio);
    }
}
