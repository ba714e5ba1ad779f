//! Periodic threat-detection sweep over the report and device stores.
//!
//! Three independent detectors run per tick. Each detector's store
//! failure is caught and logged on its own, so one broken query never
//! starves the other two. All thresholds are fixed policy constants
//! surfaced through [`SweepPolicy`] rather than per-call parameters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, error, info};

use safestreets_core::defaults;
use safestreets_core::{
    DeviceStore, ReportStatus, ReportStore, Severity, ThreatFinding,
};

/// Detection thresholds and windows.
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    /// How far back the burst detector looks.
    pub lookback: Duration,
    /// Bucket width for burst detection.
    pub burst_window: Duration,
    /// Reports per bucket that trip the burst detector.
    pub burst_threshold: usize,
    /// Activity window for the suspicious-device detector.
    pub device_risk_window: Duration,
    /// Device records scanned per tick.
    pub device_scan_limit: usize,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            lookback: defaults::THREAT_LOOKBACK,
            burst_window: defaults::BURST_WINDOW,
            burst_threshold: defaults::BURST_THRESHOLD,
            device_risk_window: defaults::DEVICE_RISK_WINDOW,
            device_scan_limit: defaults::DEVICE_SCAN_LIMIT,
        }
    }
}

/// Runs the three detectors and yields findings for broadcast.
pub struct ThreatSweep {
    policy: SweepPolicy,
    report_store: Arc<dyn ReportStore>,
    device_store: Arc<dyn DeviceStore>,
    active: AtomicBool,
}

impl ThreatSweep {
    pub fn new(
        policy: SweepPolicy,
        report_store: Arc<dyn ReportStore>,
        device_store: Arc<dyn DeviceStore>,
    ) -> Self {
        Self {
            policy,
            report_store,
            device_store,
            active: AtomicBool::new(true),
        }
    }

    /// Whether the sweep is enabled. Cleared during shutdown.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.active.store(false, Ordering::SeqCst);
        info!("Threat sweep disabled");
    }

    /// One sweep tick. Returns severity-tagged findings; empty when the
    /// sweep is disabled or nothing tripped.
    pub async fn run_once(&self) -> Vec<(Severity, ThreatFinding)> {
        if !self.is_active() {
            return Vec::new();
        }

        let mut findings = Vec::new();

        match self.detect_coordinated_bursts().await {
            Ok(mut hits) => findings.append(&mut hits),
            Err(e) => error!(error = %e, "Burst detector failed"),
        }
        match self.detect_suspicious_devices().await {
            Ok(mut hits) => findings.append(&mut hits),
            Err(e) => error!(error = %e, "Device detector failed"),
        }
        match self.detect_cross_border().await {
            Ok(mut hits) => findings.append(&mut hits),
            Err(e) => error!(error = %e, "Cross-border detector failed"),
        }

        if !findings.is_empty() {
            info!(finding_count = findings.len(), "Threat sweep produced findings");
        } else {
            debug!("Threat sweep clean");
        }
        findings
    }

    /// Bucket recent pending/approved reports by fixed windows; any bucket
    /// at or over the threshold is one finding.
    async fn detect_coordinated_bursts(
        &self,
    ) -> safestreets_core::Result<Vec<(Severity, ThreatFinding)>> {
        let reports = self
            .report_store
            .find_recent(
                self.policy.lookback,
                &[ReportStatus::Pending, ReportStatus::Approved],
            )
            .await?;

        let window_secs = self.policy.burst_window.as_secs() as i64;
        let mut buckets: BTreeMap<i64, usize> = BTreeMap::new();
        for report in &reports {
            let bucket = report.created_at.timestamp().div_euclid(window_secs);
            *buckets.entry(bucket).or_insert(0) += 1;
        }

        Ok(buckets
            .into_iter()
            .filter(|(_, count)| *count >= self.policy.burst_threshold)
            .map(|(bucket, count)| {
                let window_start = bucket_start(bucket, window_secs);
                (
                    Severity::High,
                    ThreatFinding::CoordinatedAttack {
                        window_start,
                        report_count: count,
                        pattern: "high_frequency".to_string(),
                    },
                )
            })
            .collect())
    }

    /// High/critical-risk devices active recently and not quarantined.
    async fn detect_suspicious_devices(
        &self,
    ) -> safestreets_core::Result<Vec<(Severity, ThreatFinding)>> {
        let devices = self
            .device_store
            .find_high_risk(self.policy.device_risk_window, self.policy.device_scan_limit)
            .await?;

        Ok(devices
            .into_iter()
            .map(|device| {
                let severity = if device.risk_level == "critical" {
                    Severity::Critical
                } else {
                    Severity::High
                };
                (
                    severity,
                    ThreatFinding::SuspiciousDevice {
                        device_fingerprint: device.fingerprint,
                        trust_score: device.trust_score,
                        violation_count: device.violation_count,
                    },
                )
            })
            .collect())
    }

    /// Pending cross-border-flagged reports from the last hour.
    async fn detect_cross_border(
        &self,
    ) -> safestreets_core::Result<Vec<(Severity, ThreatFinding)>> {
        let reports = self
            .report_store
            .find_cross_border_flagged(self.policy.lookback)
            .await?;

        Ok(reports
            .into_iter()
            .map(|report| {
                (
                    Severity::High,
                    ThreatFinding::CrossBorderThreat {
                        report_id: report.id,
                        location: report.location,
                        device_fingerprint: report.device_fingerprint,
                    },
                )
            })
            .collect())
    }
}

fn bucket_start(bucket: i64, window_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(bucket * window_secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
