use thiserror::Error;

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the conference bridge and media glue
#[derive(Debug, Error)]
pub enum Error {
    /// The bridge has no free slot.
    #[error("Too many ports")]
    TooManyPorts,

    /// Slot id does not refer to a live port (stale generation or
    /// never allocated).
    #[error("Invalid port slot: {0}")]
    InvalidSlot(usize),

    /// Port cannot take the requested operation.
    #[error("Invalid port operation: {0}")]
    InvalidOperation(String),

    /// Level adjustment outside -128..=127.
    #[error("Level out of range: {0}")]
    LevelOutOfRange(i32),

    /// Rates that cannot be bridged by the resampler.
    #[error("Unsupported rate conversion {0} -> {1}")]
    UnsupportedConversion(u32, u32),

    /// The SDP did not yield a usable stream.
    #[error("Bad stream description: {0}")]
    BadStreamInfo(String),

    /// Codec factory could not provide the negotiated codec.
    #[error("No codec for payload {0}")]
    NoCodec(u8),

    /// Packet transport failed.
    #[error("Media transport error: {0}")]
    Transport(String),

    /// Malformed RTP packet.
    #[error("Bad RTP packet: {0}")]
    BadRtp(String),
}
