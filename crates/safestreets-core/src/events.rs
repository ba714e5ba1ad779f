//! Realtime event types and the broadcast envelope.
//!
//! Every outbound broadcast is a [`RealtimeEvent`] wrapped in an
//! [`EventEnvelope`] carrying provenance (id, timestamp, origin server).
//! Events are immutable after construction. Payloads are a tagged union
//! keyed by `type`, so event handling is exhaustively checked at compile
//! time instead of pattern-matching on an untyped object bag.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::defaults;

/// Severity attached to security and emergency events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A finding produced by the threat sweep (or handed in by the REST layer).
///
/// Field names serialize in camelCase to match the web clients' wire
/// contract; type tags stay snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "threat_type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ThreatFinding {
    /// Burst of reports inside one detection bucket.
    CoordinatedAttack {
        window_start: DateTime<Utc>,
        report_count: usize,
        pattern: String,
    },
    /// High-risk device seen recently and not quarantined.
    SuspiciousDevice {
        device_fingerprint: String,
        trust_score: f64,
        violation_count: u32,
    },
    /// Cross-border-flagged pending report.
    CrossBorderThreat {
        report_id: String,
        location: JsonValue,
        device_fingerprint: Option<String>,
    },
    /// Free-form finding reported by an external caller
    /// (`notify_security_event` from the REST layer).
    External { kind: String, details: JsonValue },
}

/// Domain event broadcast to channel subscribers.
///
/// Serialized with a `type` tag using the wire names the clients expect,
/// e.g. `{"type":"security_event","severity":"high",...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    SecurityEvent {
        severity: Severity,
        #[serde(flatten)]
        threat: ThreatFinding,
    },
    /// Escalated copy of a critical security event, delivered on the
    /// reserved admin channel regardless of subscriptions.
    CriticalSecurityAlert {
        severity: Severity,
        #[serde(flatten)]
        threat: ThreatFinding,
    },
    ReportUpdate {
        report_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    FemaleSafetyUpdate {
        report_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    SystemStats {
        local_connections: usize,
        global_connections: usize,
        admin_connections: usize,
    },
    EmergencyAlert {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    /// Admin-channel duplicate of an emergency alert.
    EmergencyAdminAlert {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    WebsocketMetrics {
        local_connections: usize,
        global_connections: usize,
        admin_connections: usize,
        failed_events: usize,
        published: u64,
        delivered: u64,
        dropped: u64,
    },
    ServerShutdown {
        message: String,
    },
    /// Admin notification with a caller-chosen event name
    /// (`emit_to_admins` from the REST layer).
    AdminNotice {
        event: String,
        data: JsonValue,
    },
}

impl RealtimeEvent {
    /// Wire name of this event type.
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::SecurityEvent { .. } => "security_event",
            RealtimeEvent::CriticalSecurityAlert { .. } => "critical_security_alert",
            RealtimeEvent::ReportUpdate { .. } => "report_update",
            RealtimeEvent::FemaleSafetyUpdate { .. } => "female_safety_update",
            RealtimeEvent::SystemStats { .. } => "system_stats",
            RealtimeEvent::EmergencyAlert { .. } => "emergency_alert",
            RealtimeEvent::EmergencyAdminAlert { .. } => "emergency_admin_alert",
            RealtimeEvent::WebsocketMetrics { .. } => "websocket_metrics",
            RealtimeEvent::ServerShutdown { .. } => "server_shutdown",
            RealtimeEvent::AdminNotice { .. } => "admin_notice",
        }
    }

    /// Severity, for types that carry one.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            RealtimeEvent::SecurityEvent { severity, .. }
            | RealtimeEvent::CriticalSecurityAlert { severity, .. } => Some(*severity),
            _ => None,
        }
    }

    /// Replay-cache TTL for this event type, None when the type is not
    /// cached for late-joining replay.
    pub fn replay_ttl_secs(&self) -> Option<u64> {
        match self {
            RealtimeEvent::SecurityEvent { .. } | RealtimeEvent::CriticalSecurityAlert { .. } => {
                Some(defaults::SECURITY_EVENT_TTL_SECS)
            }
            RealtimeEvent::ReportUpdate { .. } | RealtimeEvent::FemaleSafetyUpdate { .. } => {
                Some(defaults::REPORT_EVENT_TTL_SECS)
            }
            RealtimeEvent::EmergencyAlert { .. } | RealtimeEvent::EmergencyAdminAlert { .. } => {
                Some(defaults::EMERGENCY_EVENT_TTL_SECS)
            }
            _ => None,
        }
    }
}

/// Provenance wrapper around a broadcast event.
///
/// The `id` is `{type}_{unix_millis}_{random_suffix}` — unique enough for
/// logging and client-side dedup, not a uniqueness guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub origin_server_id: String,
    pub payload: RealtimeEvent,
}

impl EventEnvelope {
    /// Tag an event with id, timestamp, and origin at broadcast time.
    pub fn new(event: RealtimeEvent, origin_server_id: &str) -> Self {
        let now = Utc::now();
        let kind = event.kind();
        Self {
            id: generate_event_id(kind, now),
            event_type: kind.to_string(),
            timestamp: now,
            origin_server_id: origin_server_id.to_string(),
            payload: event,
        }
    }
}

/// Build a `{type}_{unix_millis}_{suffix}` event id.
fn generate_event_id(kind: &str, at: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(defaults::EVENT_ID_SUFFIX_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", kind, at.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_security(severity: Severity) -> RealtimeEvent {
        RealtimeEvent::SecurityEvent {
            severity,
            threat: ThreatFinding::CoordinatedAttack {
                window_start: Utc::now(),
                report_count: 6,
                pattern: "high_frequency".to_string(),
            },
        }
    }

    #[test]
    fn event_id_shape() {
        let env = EventEnvelope::new(sample_security(Severity::High), "server-1");
        let parts: Vec<&str> = env.id.splitn(3, '_').collect();
        assert!(env.id.starts_with("security_event_"));
        assert_eq!(parts.len(), 3);
        assert_eq!(env.event_type, "security_event");
        assert_eq!(env.origin_server_id, "server-1");
    }

    #[test]
    fn event_ids_differ_across_calls() {
        let a = EventEnvelope::new(sample_security(Severity::Low), "s");
        let b = EventEnvelope::new(sample_security(Severity::Low), "s");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn security_event_json_tagging() {
        let json = serde_json::to_string(&sample_security(Severity::Critical)).unwrap();
        assert!(json.contains(r#""type":"security_event"#));
        assert!(json.contains(r#""severity":"critical"#));
        assert!(json.contains(r#""threat_type":"coordinated_attack"#));
        assert!(json.contains(r#""reportCount":6"#));
    }

    #[test]
    fn report_update_skips_missing_details() {
        let event = RealtimeEvent::ReportUpdate {
            report_id: "r-1".to_string(),
            status: "approved".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"report_update"#));
        assert!(!json.contains("details"));
    }

    #[test]
    fn replay_ttls_follow_event_class() {
        assert_eq!(
            sample_security(Severity::High).replay_ttl_secs(),
            Some(defaults::SECURITY_EVENT_TTL_SECS)
        );
        let report = RealtimeEvent::ReportUpdate {
            report_id: "r".into(),
            status: "pending".into(),
            details: None,
        };
        assert_eq!(
            report.replay_ttl_secs(),
            Some(defaults::REPORT_EVENT_TTL_SECS)
        );
        let emergency = RealtimeEvent::EmergencyAlert {
            message: "m".into(),
            details: None,
        };
        assert_eq!(
            emergency.replay_ttl_secs(),
            Some(defaults::EMERGENCY_EVENT_TTL_SECS)
        );
        // The admin duplicate is cached with the same TTL as the primary.
        let admin_duplicate = RealtimeEvent::EmergencyAdminAlert {
            message: "m".into(),
            details: None,
        };
        assert_eq!(
            admin_duplicate.replay_ttl_secs(),
            Some(defaults::EMERGENCY_EVENT_TTL_SECS)
        );
        let shutdown = RealtimeEvent::ServerShutdown {
            message: "bye".into(),
        };
        assert_eq!(shutdown.replay_ttl_secs(), None);
    }

    #[test]
    fn severity_ordering_puts_critical_last() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = EventEnvelope::new(
            RealtimeEvent::EmergencyAlert {
                message: "flood warning".to_string(),
                details: Some(serde_json::json!({"district": "Sylhet"})),
            },
            "server-2",
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, env.id);
        assert!(matches!(
            back.payload,
            RealtimeEvent::EmergencyAlert { .. }
        ));
    }

    #[test]
    fn external_finding_serializes_kind_and_details() {
        let event = RealtimeEvent::SecurityEvent {
            severity: Severity::Medium,
            threat: ThreatFinding::External {
                kind: "manual_flag".to_string(),
                details: serde_json::json!({"by": "ops"}),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""threat_type":"external"#));
        assert!(json.contains(r#""kind":"manual_flag"#));
    }
}
