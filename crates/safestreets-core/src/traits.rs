//! Collaborator contracts consumed by the realtime layer.
//!
//! The REST API, document store, and identity system live outside this
//! workspace; the hub only sees them through these traits, enabling
//! pluggable backends and deterministic tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::error::Result;

// =============================================================================
// IDENTITY
// =============================================================================

/// User record returned by a successful token verification.
#[derive(Debug, Clone)]
pub struct VerifiedUser {
    pub id: String,
    pub role: crate::channels::Role,
    pub permissions: Vec<String>,
}

/// Admin record returned by a successful session verification.
#[derive(Debug, Clone)]
pub struct VerifiedAdmin {
    pub id: String,
    pub username: String,
    pub permissions: Vec<String>,
    pub admin_level: u8,
}

/// Verifies tokens and admin sessions. Auth protocol design is out of
/// scope here; failures surface as [`crate::Error::Auth`].
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a citizen/registered-user token. `None` token means an
    /// anonymous connection, which still succeeds with the anonymous role.
    async fn verify_token(
        &self,
        token: Option<&str>,
        device_fingerprint: Option<&str>,
    ) -> Result<VerifiedUser>;

    /// Verify an admin session token.
    async fn verify_admin_session(
        &self,
        session_token: &str,
        device_fingerprint: Option<&str>,
    ) -> Result<VerifiedAdmin>;
}

// =============================================================================
// DEVICE STORE
// =============================================================================

/// Trust data for a device fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub fingerprint: String,
    pub risk_level: String,
    pub trust_score: f64,
    pub violation_count: u32,
    pub quarantined: bool,
    pub last_seen: DateTime<Utc>,
}

/// Device-record store used to attribute connections to trust data and to
/// feed the suspicious-device detector.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<DeviceRecord>>;

    async fn create(&self, record: DeviceRecord) -> Result<()>;

    async fn touch_last_seen(&self, fingerprint: &str) -> Result<()>;

    /// Devices with risk level high or critical, not quarantined, active
    /// within `window`, capped at `limit` records.
    async fn find_high_risk(&self, window: Duration, limit: usize) -> Result<Vec<DeviceRecord>>;
}

// =============================================================================
// REPORT STORE
// =============================================================================

/// Report workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Approved,
    Rejected,
}

/// Subset of a crime report the threat sweep reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub location: JsonValue,
    pub device_fingerprint: Option<String>,
    pub cross_border: bool,
}

/// Read-only report queries used by the threat sweep.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Reports created within `window` whose status is in `statuses`.
    async fn find_recent(
        &self,
        window: Duration,
        statuses: &[ReportStatus],
    ) -> Result<Vec<ReportRecord>>;

    /// Cross-border-flagged pending reports created within `window`.
    async fn find_cross_border_flagged(&self, window: Duration) -> Result<Vec<ReportRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ReportStatus::Pending).unwrap(),
            r#""pending""#
        );
        let s: ReportStatus = serde_json::from_str(r#""approved""#).unwrap();
        assert_eq!(s, ReportStatus::Approved);
    }

    #[test]
    fn device_record_serializes_camel_case() {
        let record = DeviceRecord {
            fingerprint: "fp".to_string(),
            risk_level: "high".to_string(),
            trust_score: 12.5,
            violation_count: 4,
            quarantined: false,
            last_seen: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""riskLevel":"high"#));
        assert!(json.contains(r#""violationCount":4"#));
    }
}
