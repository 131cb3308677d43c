//! Media value types.

use std::fmt;

/// Raw audio sample.
pub type Sample = i16;

/// Frame kind. `NoAudio` is a typed silence marker: a sink with no
/// sources emits it instead of zeroed samples so RTP discontinuous
/// transmission keeps working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    NoAudio,
}

/// One frame of mono PCM audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub kind: FrameKind,
    pub samples: Vec<Sample>,
    /// Timestamp in samples at the owner's clock rate.
    pub timestamp: u64,
}

impl AudioFrame {
    pub fn audio(samples: Vec<Sample>, timestamp: u64) -> Self {
        AudioFrame { kind: FrameKind::Audio, samples, timestamp }
    }

    /// The typed "nothing to say" frame.
    pub fn no_audio(timestamp: u64) -> Self {
        AudioFrame { kind: FrameKind::NoAudio, samples: Vec::new(), timestamp }
    }

    pub fn is_audio(&self) -> bool {
        self.kind == FrameKind::Audio
    }
}

/// Whether the bridge may move samples in a direction of a port.
///
/// Directions are seen from the bridge: TX is bridge-to-port, RX is
/// port-to-bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOp {
    /// No flow at all.
    Disabled,
    /// TX only: deliver typed no-audio frames instead of samples.
    Muted,
    /// Normal flow.
    Enabled,
}

impl fmt::Display for PortOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortOp::Disabled => "disabled",
            PortOp::Muted => "muted",
            PortOp::Enabled => "enabled",
        })
    }
}

/// Handle to a conference port: slot index plus a generation counter
/// so a recycled slot cannot be addressed through a stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle {
    pub slot: usize,
    pub generation: u64,
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}#{}", self.slot, self.generation)
    }
}

/// Per-port info snapshot.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub handle: PortHandle,
    pub name: String,
    pub clock_rate: u32,
    pub samples_per_frame: usize,
    pub rx_setting: PortOp,
    pub tx_setting: PortOp,
    /// -128..=127, 0 = unity.
    pub rx_adj_level: i32,
    pub tx_adj_level: i32,
    pub listener_cnt: usize,
    pub transmitter_cnt: usize,
}
