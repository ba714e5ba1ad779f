//! # safestreets-realtime
//!
//! Horizontally-scalable realtime event distribution for SafeStreets.
//!
//! This crate provides:
//! - A per-process connection registry mirrored into a Redis backplane
//! - Role-gated channel subscriptions with partial-success semantics
//! - Typed event broadcasting with bounded retry for failed publishes
//! - A periodic threat-detection sweep over the report/device stores
//! - Lifecycle sequencing, health reporting, and graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use safestreets_realtime::{RealtimeConfig, RealtimeHub};
//!
//! let hub = RealtimeHub::new(
//!     RealtimeConfig::from_env(),
//!     Arc::new(verifier),
//!     Arc::new(device_store),
//!     Arc::new(report_store),
//! );
//! hub.start().await;
//! hub.wait_ready().await;
//!
//! // Merge into the host HTTP server
//! let app = axum::Router::new().merge(hub.router());
//!
//! // Called by the REST layer after a report is approved
//! hub.notify_report_update(serde_json::json!({
//!     "reportId": "r-1", "status": "approved"
//! })).await;
//!
//! hub.shutdown().await;
//! ```

pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod hub;
pub mod registry;
pub mod session;
pub mod store;
pub mod sweep;
pub mod transport;

// Re-export core types
pub use safestreets_core::*;

pub use config::RealtimeConfig;
pub use dispatch::{ConnectionStats, EventDispatcher, FailedEvent, Target};
pub use fanout::{Fanout, LocalFanout, RedisFanout};
pub use hub::{HealthReport, RealtimeHub};
pub use registry::{ConnectionRecord, ConnectionRegistry, ReportFilter, SecurityFilter};
pub use session::SessionHandler;
pub use store::BackplaneStore;
pub use sweep::{SweepPolicy, ThreatSweep};
