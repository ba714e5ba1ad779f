//! Centralized default constants for the SafeStreets realtime layer.
//!
//! **This module is the single source of truth** for shared default values.
//! Both crates reference these constants instead of defining their own
//! magic numbers. The threat-policy values (burst threshold, device risk
//! window, scan cap) are carried over from the production system unchanged;
//! deployments override them through `SweepPolicy` and `RealtimeConfig`,
//! never by editing call sites.

use std::time::Duration;

// =============================================================================
// CONNECTION LIFECYCLE
// =============================================================================

/// Inactivity window after which a connection is considered stale (10 min).
pub const INACTIVITY_WINDOW: Duration = Duration::from_secs(600);

/// Interval between stale-connection sweeps (5 min).
pub const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

// =============================================================================
// EVENT DISTRIBUTION
// =============================================================================

/// Maximum redelivery attempts for a failed broadcast.
pub const MAX_RETRIES: u32 = 3;

/// Interval between failed-event retry sweeps.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Cap on the failed-events list; oldest entries are evicted first.
pub const FAILED_EVENTS_CAP: usize = 256;

/// Replay-cache TTL for security events (1 hour).
pub const SECURITY_EVENT_TTL_SECS: u64 = 3600;

/// Replay-cache TTL for report updates (30 minutes).
pub const REPORT_EVENT_TTL_SECS: u64 = 1800;

/// Replay-cache TTL for emergency alerts (2 hours).
pub const EMERGENCY_EVENT_TTL_SECS: u64 = 7200;

/// Length of the random alphanumeric suffix in generated event ids.
pub const EVENT_ID_SUFFIX_LEN: usize = 9;

// =============================================================================
// THREAT DETECTION POLICY
// =============================================================================

/// Interval between threat-detection sweeps (2 min).
pub const THREAT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Rolling window scanned for burst and cross-border detection (1 hour).
pub const THREAT_LOOKBACK: Duration = Duration::from_secs(3600);

/// Bucket width for coordinated-burst detection (10 min).
pub const BURST_WINDOW: Duration = Duration::from_secs(600);

/// Reports per bucket at or above which a burst is flagged.
pub const BURST_THRESHOLD: usize = 5;

/// Activity window for the suspicious-device detector (24 hours).
pub const DEVICE_RISK_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Maximum device records examined per sweep tick (bounded work).
pub const DEVICE_SCAN_LIMIT: usize = 10;

// =============================================================================
// BACKPLANE
// =============================================================================

/// Redis channel prefix for fleet-wide fanout.
pub const BACKPLANE_CHANNEL_PREFIX: &str = "ssrt:";

/// Key prefix for mirrored connection records.
pub const CONN_MIRROR_PREFIX: &str = "ssrt:conn:";

/// Key prefix for mirrored subscription preferences.
pub const SUB_MIRROR_PREFIX: &str = "ssrt:sub:";

/// Key prefix for replay-cached events.
pub const EVENT_CACHE_PREFIX: &str = "ssrt:event:";

/// Mirror-record TTL; refreshed on every authenticated mutation so stale
/// entries age out even if a process dies without cleanup (15 min).
pub const CONN_MIRROR_TTL_SECS: u64 = 900;

/// Attempts made when attaching the backplane before falling open to
/// single-process mode.
pub const BACKPLANE_ATTACH_ATTEMPTS: u32 = 5;

/// Cap on the per-attempt backoff delay while attaching the backplane.
pub const BACKPLANE_ATTACH_BACKOFF_CAP: Duration = Duration::from_secs(3);

/// Upper bound on a single backplane connect attempt. Keeps the attach
/// loop's total time bounded even against a blackholed address, where the
/// OS connect timeout would otherwise apply.
pub const BACKPLANE_ATTACH_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Grace period between the shutdown notice and transport teardown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on gathering a health snapshot; past it the report
/// degrades to unhealthy instead of hanging the caller.
pub const HEALTH_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between websocket-metrics self-reports.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_policy_is_consistent() {
        // The burst bucket must fit inside the lookback window.
        assert!(BURST_WINDOW < THREAT_LOOKBACK);
        assert!(BURST_THRESHOLD >= 2);
    }

    #[test]
    fn stale_sweep_runs_within_inactivity_window() {
        assert!(STALE_SWEEP_INTERVAL <= INACTIVITY_WINDOW);
    }

    #[test]
    fn event_ttls_ordered_by_severity_of_purpose() {
        assert!(REPORT_EVENT_TTL_SECS < SECURITY_EVENT_TTL_SECS);
        assert!(SECURITY_EVENT_TTL_SECS < EMERGENCY_EVENT_TTL_SECS);
    }

    #[test]
    fn mirror_ttl_outlives_inactivity_window() {
        assert!(CONN_MIRROR_TTL_SECS as u64 > INACTIVITY_WINDOW.as_secs());
    }

    #[test]
    fn attach_budget_is_bounded() {
        // Worst case: every attempt times out and waits the full backoff.
        let worst = (BACKPLANE_ATTACH_TIMEOUT + BACKPLANE_ATTACH_BACKOFF_CAP)
            * BACKPLANE_ATTACH_ATTEMPTS;
        assert!(worst <= Duration::from_secs(60));
    }
}
