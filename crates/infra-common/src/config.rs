//! Endpoint-level configuration for the waveline core.
//!
//! The structs here mirror the recognised core options: signaling
//! behaviour (`SigConfig`), NAT traversal (`NatConfig`) and media
//! defaults (`MediaSettings`). Each engine crate consumes the slice it
//! cares about; the front-end owns persistence.

use serde::{Deserialize, Serialize};

/// Hard ceiling on simultaneous calls, regardless of configuration.
pub const MAX_CALLS_CEILING: usize = 32;

/// SRTP usage policy for outgoing and incoming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpUse {
    /// SRTP is not offered and not accepted.
    Disabled,
    /// SRTP is offered, plain RTP is accepted as fallback.
    Optional,
    /// SRTP is required; calls without it are rejected.
    Mandatory,
}

impl Default for SrtpUse {
    fn default() -> Self {
        SrtpUse::Disabled
    }
}

/// Signaling-security requirement before SRTP keys may travel in SDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpSecureSignaling {
    /// Keys may travel over any transport.
    NotRequired,
    /// Next hop must be TLS.
    TlsRequired,
    /// End-to-end SIPS scheme required.
    SipsRequired,
}

impl Default for SrtpSecureSignaling {
    fn default() -> Self {
        SrtpSecureSignaling::NotRequired
    }
}

/// TURN transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnConnType {
    Udp,
    Tcp,
}

impl Default for TurnConnType {
    fn default() -> Self {
        TurnConnType::Udp
    }
}

/// Signaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigConfig {
    /// Upper bound on simultaneous INVITE sessions. Clamped to
    /// [`MAX_CALLS_CEILING`].
    pub max_calls: usize,
    /// Worker threads driving the endpoint event loop. `0` means the
    /// caller polls the endpoint itself.
    pub thread_cnt: usize,
    /// Nameservers enabling SRV resolution; empty falls back to
    /// system host lookup.
    pub nameservers: Vec<String>,
    /// Route set prepended to every outgoing dialog.
    pub outbound_proxies: Vec<String>,
    /// Advertise and require 100rel (PRACK) support.
    pub require_100rel: bool,
    /// Advertise and require session-timer support.
    pub require_timer: bool,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for SigConfig {
    fn default() -> Self {
        Self {
            max_calls: 4,
            thread_cnt: 1,
            nameservers: Vec::new(),
            outbound_proxies: Vec::new(),
            require_100rel: false,
            require_timer: false,
            user_agent: concat!("waveline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl SigConfig {
    /// Effective call limit after applying the compile-time ceiling.
    pub fn effective_max_calls(&self) -> usize {
        self.max_calls.min(MAX_CALLS_CEILING)
    }
}

/// How the NAT type is advertised in outgoing SDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatTypeInSdp {
    /// No NAT information in SDP.
    None,
    /// Numeric NAT type only.
    Numeric,
    /// Numeric NAT type plus its name.
    NumericAndName,
}

impl Default for NatTypeInSdp {
    fn default() -> Self {
        NatTypeInSdp::None
    }
}

/// NAT traversal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NatConfig {
    /// STUN server discovery by DNS SRV on this domain.
    pub stun_domain: Option<String>,
    /// Explicit STUN server, `host[:port]`. Takes precedence over
    /// `stun_domain`.
    pub stun_host: Option<String>,
    /// NAT type advertisement mode.
    pub nat_type_in_sdp: NatTypeInSdp,
    /// Enable ICE for media transports.
    pub enable_ice: bool,
    /// Suppress host candidates (server-reflexive/relay only).
    pub ice_no_host_cands: bool,
    /// Disable the RTCP component (component 2).
    pub ice_no_rtcp: bool,
    /// Enable TURN relay candidates.
    pub enable_turn: bool,
    /// TURN server, `host[:port]`.
    pub turn_server: Option<String>,
    /// TURN transport.
    pub turn_conn_type: TurnConnType,
    /// TURN long-term credential (username, password).
    pub turn_auth_cred: Option<(String, String)>,
}

/// Jitter buffer bounds in milliseconds; `-1` keeps the stream default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterBufferConfig {
    pub init: i32,
    pub min_pre: i32,
    pub max_pre: i32,
    pub max: i32,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self { init: -1, min_pre: -1, max_pre: -1, max: -1 }
    }
}

/// Media defaults applied to every call and to the conference bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSettings {
    /// Bridge clock rate in Hz.
    pub clock_rate: u32,
    /// Channel count for the bridge (1 = mono).
    pub channel_count: u8,
    /// Audio frame length in milliseconds.
    pub audio_frame_ptime: u32,
    /// Echo canceller tail length in milliseconds (0 disables).
    pub ec_tail_len: u32,
    /// Jitter buffer bounds.
    pub jitter: JitterBufferConfig,
    /// Disable the voice activity detector / silence suppression.
    pub no_vad: bool,
    /// iLBC frame mode, 20 or 30 ms.
    pub ilbc_mode: u32,
    /// SRTP policy.
    pub use_srtp: SrtpUse,
    /// Signaling security required before offering SRTP.
    pub srtp_secure_signaling: SrtpSecureSignaling,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            clock_rate: 16_000,
            channel_count: 1,
            audio_frame_ptime: 20,
            ec_tail_len: 200,
            jitter: JitterBufferConfig::default(),
            no_vad: false,
            ilbc_mode: 30,
            use_srtp: SrtpUse::default(),
            srtp_secure_signaling: SrtpSecureSignaling::default(),
        }
    }
}

impl MediaSettings {
    /// Samples per frame at the bridge clock rate.
    pub fn samples_per_frame(&self) -> usize {
        (self.clock_rate as usize * self.audio_frame_ptime as usize * self.channel_count as usize)
            / 1000
    }
}

/// Top-level configuration handed to the endpoint at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub sig: SigConfig,
    pub nat: NatConfig,
    pub media: MediaSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.sig.max_calls, 4);
        assert_eq!(cfg.sig.thread_cnt, 1);
        assert_eq!(cfg.media.clock_rate, 16_000);
        assert_eq!(cfg.media.audio_frame_ptime, 20);
        assert_eq!(cfg.media.ec_tail_len, 200);
        assert_eq!(cfg.media.jitter.init, -1);
    }

    #[test]
    fn max_calls_is_clamped() {
        let mut sig = SigConfig::default();
        sig.max_calls = 1000;
        assert_eq!(sig.effective_max_calls(), MAX_CALLS_CEILING);
        sig.max_calls = 2;
        assert_eq!(sig.effective_max_calls(), 2);
    }

    #[test]
    fn samples_per_frame_derivation() {
        let media = MediaSettings::default();
        // 16 kHz mono at 20 ms
        assert_eq!(media.samples_per_frame(), 320);

        let wide = MediaSettings { clock_rate: 8000, ..MediaSettings::default() };
        assert_eq!(wide.samples_per_frame(), 160);
    }
}
