//! # infra-common
//!
//! Horizontal infrastructure layer for the waveline stack:
//!
//! - Endpoint-level configuration surface shared by all engines
//! - Logging bootstrap on top of `tracing-subscriber`
//! - Small typed event channel helpers used between layers
//!
//! Every other waveline crate depends on this one; it depends on no
//! other waveline crate.

pub mod config;
pub mod events;
pub mod logging;

pub use config::{
    CoreConfig, JitterBufferConfig, MediaSettings, NatConfig, SigConfig, SrtpSecureSignaling,
    SrtpUse, TurnConnType,
};
pub use events::{EventReceiver, EventSender, event_channel};
pub use logging::{LoggingConfig, setup_logging};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
