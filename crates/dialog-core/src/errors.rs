use thiserror::Error;

/// Result type for transaction and dialog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transaction and dialog layers
#[derive(Debug, Error)]
pub enum Error {
    /// Transport send failed; the owning transaction terminates.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A transaction timer (B, F or H) expired.
    #[error("Transaction timed out")]
    TransactionTimeout,

    /// No transaction with this key exists.
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),

    /// Request is missing something the layer depends on.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Response could not be correlated.
    #[error("Bad response: {0}")]
    BadResponse(String),

    /// Attempted action is illegal in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No dialog with this id exists.
    #[error("Unknown dialog: {0}")]
    UnknownDialog(String),

    /// In-dialog request arrived with a stale CSeq.
    #[error("Out of order CSeq: got {got}, last {last}")]
    StaleCSeq { got: u32, last: u32 },

    /// Credentials missing or exhausted for a 401/407 challenge.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Internal channel to the transaction task is gone.
    #[error("Transaction task unavailable")]
    ChannelClosed,

    /// Message codec error from sip-core.
    #[error(transparent)]
    Codec(#[from] waveline_sip_core::Error),
}

impl From<waveline_sip_transport::Error> for Error {
    fn from(e: waveline_sip_transport::Error) -> Self {
        Error::TransportFailure(e.to_string())
    }
}
