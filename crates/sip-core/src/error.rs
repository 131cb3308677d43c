use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP and SDP handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid SIP method
    #[error("Invalid SIP method: {0}")]
    InvalidMethod(String),

    /// Invalid SIP version
    #[error("Invalid SIP version")]
    InvalidVersion,

    /// Invalid status code
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Invalid SIP URI
    #[error("Invalid SIP URI: {0}")]
    InvalidUri(String),

    /// Invalid SIP header syntax
    #[error("Invalid SIP header: {0}")]
    InvalidHeader(String),

    /// Message could not be parsed at all
    #[error("Parse error: {0}")]
    Parser(String),

    /// Head parsed but the body is shorter than Content-Length
    #[error("Content-Length mismatch: expected {expected}, got {actual}")]
    ContentLengthMismatch {
        /// Length stated in the Content-Length header
        expected: usize,
        /// Actual length of body bytes available
        actual: usize,
    },

    /// Missing required header
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// SDP line could not be parsed
    #[error("SDP parse error: {0}")]
    SdpParse(String),

    /// SDP tree is structurally invalid
    #[error("SDP validation error: {0}")]
    SdpValidation(String),

    /// Offer/answer state machine was driven out of order
    #[error("Invalid negotiator state for {0}")]
    InvalidNegotiatorState(&'static str),

    /// Offer and answer share no codec or transport
    #[error("No acceptable media: {0}")]
    NoAcceptableMedia(String),
}
