//! # safestreets-core
//!
//! Core types, traits, and abstractions for the SafeStreets realtime layer.
//!
//! This crate provides the shared data structures and collaborator
//! contracts that the realtime hub crate depends on. It performs no I/O.

pub mod channels;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod messages;
pub mod traits;

// Re-export commonly used types at crate root
pub use channels::{allowed_channels, Channel, Role, ADMIN_AUTO_JOIN};
pub use error::{Error, Result};
pub use events::{EventEnvelope, RealtimeEvent, Severity, ThreatFinding};
pub use messages::{ClientMessage, ServerMessage};
pub use traits::{
    DeviceRecord, DeviceStore, IdentityVerifier, ReportRecord, ReportStatus, ReportStore,
    VerifiedAdmin, VerifiedUser,
};
