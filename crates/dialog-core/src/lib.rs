//! RFC 3261 transaction and dialog layers for the waveline stack.
//!
//! The [`transaction`] module implements the four Section 17 state
//! machines with their timers and retransmission behaviour, plus the
//! [`transaction::TransactionManager`] that owns the table and the
//! §17.2.3 matching rules. The [`dialog`] module adds dialog state:
//! CSeq counters, route sets, tags and usage counting. [`auth`]
//! recovers 401/407 challenges with stored digest credentials.
//!
//! Layering: transport events feed the transaction manager; the
//! manager's [`transaction::TransactionEvent`] stream feeds the
//! INVITE session engine in `session-core`.

pub mod auth;
pub mod dialog;
pub mod errors;
pub mod transaction;

pub use auth::{Authenticator, Credential};
pub use dialog::{Dialog, DialogId, DialogManager, DialogState};
pub use errors::{Error, Result};
pub use transaction::{
    TimerSettings, TransactionEvent, TransactionKey, TransactionKind, TransactionManager,
    TransactionState,
};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::auth::{Authenticator, Credential};
    pub use crate::dialog::{Dialog, DialogId, DialogManager, DialogState};
    pub use crate::errors::{Error, Result};
    pub use crate::transaction::{
        TimerSettings, TransactionEvent, TransactionKey, TransactionKind, TransactionManager,
        TransactionState,
    };
}
