//! Broadcast channels and role-based channel authorization.
//!
//! Channels are not persisted entities: they exist as backplane routing
//! keys and each process's local membership sets. The invariant enforced
//! here is that a connection's joined channels are always a subset of the
//! set its role authorizes.

use serde::{Deserialize, Serialize};

/// A named logical broadcast domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    SecurityMonitoring,
    ReportUpdates,
    SystemStats,
    FemaleSafetyReports,
    PoliceUpdates,
    GeneralUpdates,
    SystemNotifications,
    /// Reserved channel: every admin is a member, used for critical
    /// escalations that must not depend on an opt-in subscription.
    AdminGlobal,
}

impl Channel {
    /// All channels, in declaration order.
    pub const ALL: [Channel; 8] = [
        Channel::SecurityMonitoring,
        Channel::ReportUpdates,
        Channel::SystemStats,
        Channel::FemaleSafetyReports,
        Channel::PoliceUpdates,
        Channel::GeneralUpdates,
        Channel::SystemNotifications,
        Channel::AdminGlobal,
    ];

    /// Wire/routing-key name for this channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::SecurityMonitoring => "security_monitoring",
            Channel::ReportUpdates => "report_updates",
            Channel::SystemStats => "system_stats",
            Channel::FemaleSafetyReports => "female_safety_reports",
            Channel::PoliceUpdates => "police_updates",
            Channel::GeneralUpdates => "general_updates",
            Channel::SystemNotifications => "system_notifications",
            Channel::AdminGlobal => "admin_global",
        }
    }

    /// Parse a channel from its wire name (case-sensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "security_monitoring" => Some(Channel::SecurityMonitoring),
            "report_updates" => Some(Channel::ReportUpdates),
            "system_stats" => Some(Channel::SystemStats),
            "female_safety_reports" => Some(Channel::FemaleSafetyReports),
            "police_updates" => Some(Channel::PoliceUpdates),
            "general_updates" => Some(Channel::GeneralUpdates),
            "system_notifications" => Some(Channel::SystemNotifications),
            "admin_global" => Some(Channel::AdminGlobal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role attached to a connection after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Anonymous,
    Citizen,
    Admin,
    Police,
    Researcher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::Citizen => "citizen",
            Role::Admin => "admin",
            Role::Police => "police",
            Role::Researcher => "researcher",
        }
    }

    /// Parse a role from its wire name; unknown values map to anonymous.
    pub fn parse_loose(s: &str) -> Self {
        match s {
            "citizen" => Role::Citizen,
            "admin" => Role::Admin,
            "police" => Role::Police,
            "researcher" => Role::Researcher,
            _ => Role::Anonymous,
        }
    }
}

/// Citizen-level channels, the floor every role gets.
const CITIZEN_CHANNELS: &[Channel] = &[Channel::GeneralUpdates, Channel::SystemNotifications];

/// Police: citizen set plus operational channels.
const POLICE_CHANNELS: &[Channel] = &[
    Channel::GeneralUpdates,
    Channel::SystemNotifications,
    Channel::PoliceUpdates,
    Channel::SecurityMonitoring,
];

/// Channels every admin is auto-joined to on authentication, without an
/// explicit subscribe step.
pub const ADMIN_AUTO_JOIN: &[Channel] = &[
    Channel::SecurityMonitoring,
    Channel::ReportUpdates,
    Channel::SystemStats,
    Channel::FemaleSafetyReports,
    Channel::AdminGlobal,
];

/// The channel set a role is authorized to join.
pub fn allowed_channels(role: Role) -> &'static [Channel] {
    match role {
        Role::Anonymous | Role::Citizen | Role::Researcher => CITIZEN_CHANNELS,
        Role::Police => POLICE_CHANNELS,
        Role::Admin => &Channel::ALL,
    }
}
