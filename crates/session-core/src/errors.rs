use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the INVITE session engine
#[derive(Debug, Error)]
pub enum Error {
    /// Operation is illegal in the current call state.
    #[error("Invalid call state: {0}")]
    InvalidState(String),

    /// All call slots are in use (maps to 486 Busy Here).
    #[error("No free call slot")]
    NoFreeSlot,

    /// Another INVITE transaction is still pending in this dialog.
    #[error("Another INVITE transaction in progress")]
    InvitePending,

    /// Offer/answer could not converge (maps to 488).
    #[error("Media negotiation failed: {0}")]
    Negotiation(String),

    /// No session with this id.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// No redirect target is parked for processing.
    #[error("No pending redirect")]
    NoPendingRedirect,

    /// Transaction or dialog layer failure.
    #[error(transparent)]
    Dialog(#[from] waveline_dialog_core::Error),

    /// Message codec failure.
    #[error(transparent)]
    Codec(#[from] waveline_sip_core::Error),
}
