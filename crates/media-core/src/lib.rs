//! # Media core for the waveline stack
//!
//! Two halves:
//!
//! - [`bridge`]: the audio conference bridge, an N-to-M mixer driven
//!   by a single clock with per-port rate conversion and level
//!   control. Slot 0 is the master (sound device) port with a capture
//!   ring absorbing bursty device callbacks.
//! - [`stream`]: media session glue. [`stream::StreamInfo`] distils a
//!   negotiated SDP pair into stream parameters;
//!   [`stream::MediaStream`] runs RTP in and out of a jitter buffer
//!   and codec, and plugs into the bridge as a
//!   [`port::MediaPort`].
//!
//! Codec implementations, sound devices and sockets stay outside:
//! the core consumes [`stream::CodecFactory`] and
//! [`stream::PacketTransport`].

pub mod bridge;
pub mod error;
pub mod level;
pub mod port;
pub mod resample;
pub mod stream;
pub mod types;

pub use bridge::{BridgeConfig, ConfBridge, RX_BUF_COUNT};
pub use error::{Error, Result};
pub use port::MediaPort;
pub use resample::{ResampleQuality, Resampler};
pub use stream::{
    Codec, CodecFactory, JitterBuffer, MediaStream, PacketTransport, RtpPacket, StreamInfo,
};
pub use types::{AudioFrame, FrameKind, PortHandle, PortInfo, PortOp, Sample};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::bridge::{BridgeConfig, ConfBridge};
    pub use crate::error::{Error, Result};
    pub use crate::port::MediaPort;
    pub use crate::resample::ResampleQuality;
    pub use crate::stream::{Codec, CodecFactory, MediaStream, PacketTransport, StreamInfo};
    pub use crate::types::{AudioFrame, FrameKind, PortHandle, PortInfo, PortOp, Sample};
}
