//! The media port abstraction the bridge talks to.

use crate::error::Result;
use crate::types::AudioFrame;

/// A source/sink of audio frames: a call stream, a tone generator, a
/// recorder. The bridge calls `get_frame` once per tick for ports
/// with listeners and `put_frame` to deliver the mix.
pub trait MediaPort: Send {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;

    /// Clock rate of the frames this port produces/consumes.
    fn clock_rate(&self) -> u32;

    /// Samples per frame at the port's clock rate.
    fn samples_per_frame(&self) -> usize;

    /// Pull one frame. Ports with nothing to say return a
    /// [`crate::types::FrameKind::NoAudio`] frame.
    fn get_frame(&mut self, timestamp: u64) -> Result<AudioFrame>;

    /// Push one mixed frame toward the port.
    fn put_frame(&mut self, frame: &AudioFrame) -> Result<()>;
}
