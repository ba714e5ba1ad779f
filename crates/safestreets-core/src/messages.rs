//! Wire schema for the realtime transport.
//!
//! Inbound messages (client → server) and outbound replies (server →
//! client) as internally-tagged enums. Field names follow the web
//! clients' camelCase convention; the `type` tag values are snake_case.
//!
//! Malformed inbound JSON is a parse error at the transport layer, logged
//! and ignored — it never reaches these types half-constructed.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::events::EventEnvelope;

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start the citizen/anonymous authentication flow.
    Authenticate {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        device_fingerprint: Option<String>,
        #[serde(default)]
        user_type: Option<String>,
    },
    /// Start the admin authentication flow.
    AdminAuthenticate {
        session_token: String,
        #[serde(default)]
        device_fingerprint: Option<String>,
    },
    /// Join channels; granted channels are the intersection with the
    /// role's allowed set (partial success).
    Subscribe {
        channels: Vec<String>,
        #[serde(default)]
        options: JsonValue,
    },
    /// Leave channels; idempotent.
    Unsubscribe { channels: Vec<String> },
    /// Admin-only: narrow which security events this connection wants.
    SubscribeSecurity {
        #[serde(default)]
        threat_level: Option<String>,
        #[serde(default)]
        device_events: bool,
        #[serde(default)]
        report_events: bool,
        #[serde(default)]
        system_events: bool,
    },
    /// Admin-only: narrow which report updates this connection wants.
    SubscribeReports {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        priority: Option<String>,
        #[serde(default)]
        female_safety: bool,
    },
    /// Keepalive/activity marker; refreshes the inactivity clock.
    Activity {
        #[serde(flatten)]
        data: JsonValue,
    },
    Ping,
}

/// Admin identity echoed back after admin authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminProfile {
    pub username: String,
    pub permissions: Vec<String>,
    pub admin_level: u8,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: String,
        server_id: String,
    },
    Authenticated {
        success: bool,
        user_type: String,
        permissions: Vec<String>,
    },
    AuthError {
        message: String,
    },
    AdminAuthenticated {
        success: bool,
        user: AdminProfile,
        available_channels: Vec<String>,
    },
    AdminAuthError {
        message: String,
    },
    SubscriptionConfirmed {
        subscribed_channels: Vec<String>,
        rejected_channels: Vec<String>,
    },
    SubscriptionError {
        message: String,
    },
    UnsubscriptionConfirmed {
        unsubscribed_channels: Vec<String>,
    },
    SecuritySubscriptionConfirmed,
    ReportSubscriptionConfirmed,
    Pong {
        timestamp: i64,
    },
    /// A broadcast event fanned out to this connection's channels.
    Event(EventEnvelope),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_authenticate_with_optional_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"authenticate","deviceFingerprint":"fp-1","userType":"citizen"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Authenticate {
                token,
                device_fingerprint,
                user_type,
            } => {
                assert!(token.is_none());
                assert_eq!(device_fingerprint.as_deref(), Some("fp-1"));
                assert_eq!(user_type.as_deref(), Some("citizen"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_subscribe_defaults_options() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","channels":["general_updates","security_monitoring"]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { channels, options } => {
                assert_eq!(channels.len(), 2);
                assert!(options.is_null());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_ping_and_activity() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"activity","page":"map","idleMs":120}"#).unwrap();
        match msg {
            ClientMessage::Activity { data } => {
                assert_eq!(data["page"], "map");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_subscribe_security_filters() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe_security","threatLevel":"high","deviceEvents":true}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SubscribeSecurity {
                threat_level,
                device_events,
                report_events,
                ..
            } => {
                assert_eq!(threat_level.as_deref(), Some("high"));
                assert!(device_events);
                assert!(!report_events);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn malformed_message_is_a_parse_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch_missiles"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn subscription_confirmed_uses_camel_case() {
        let msg = ServerMessage::SubscriptionConfirmed {
            subscribed_channels: vec!["general_updates".to_string()],
            rejected_channels: vec!["security_monitoring".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"subscription_confirmed"#));
        assert!(json.contains(r#""subscribedChannels":["general_updates"]"#));
        assert!(json.contains(r#""rejectedChannels":["security_monitoring"]"#));
    }

    #[test]
    fn admin_authenticated_shape() {
        let msg = ServerMessage::AdminAuthenticated {
            success: true,
            user: AdminProfile {
                username: "ops".to_string(),
                permissions: vec!["moderate".to_string()],
                admin_level: 2,
            },
            available_channels: vec!["admin_global".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""adminLevel":2"#));
        assert!(json.contains(r#""availableChannels":["admin_global"]"#));
    }
}
