use std::io;

use thiserror::Error;

/// Result type for STUN and ICE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for STUN and ICE operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed STUN message
    #[error("STUN error: {0}")]
    Stun(String),

    /// MESSAGE-INTEGRITY did not verify against the supplied key
    #[error("Integrity check failure")]
    IntegrityCheckFailure,

    /// FINGERPRINT present but wrong
    #[error("Fingerprint mismatch")]
    FingerprintMismatch,

    /// ICE protocol error
    #[error("ICE error: {0}")]
    Ice(String),

    /// Invalid candidate
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Operation illegal in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A STUN transaction or the whole checklist timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote credentials missing or wrong
    #[error("Authentication error: {0}")]
    Auth(String),
}
