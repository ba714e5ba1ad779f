//! Per-connection message handling: authentication, channel membership,
//! and activity tracking.
//!
//! Every inbound message refreshes the connection's activity clock. Auth
//! failures are reported to the offending connection only and leave it
//! open in the unauthenticated state; the server never retries auth.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use safestreets_core::{
    allowed_channels, Channel, ClientMessage, DeviceRecord, DeviceStore,
    IdentityVerifier, Role, ServerMessage, ADMIN_AUTO_JOIN,
};
use safestreets_core::messages::AdminProfile;
use tokio::sync::mpsc;

use crate::registry::{ConnectionRecord, ConnectionRegistry, ReportFilter, SecurityFilter};

/// Handles the inbound side of a connection's lifecycle.
pub struct SessionHandler {
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    devices: Arc<dyn DeviceStore>,
    server_id: String,
}

impl SessionHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        devices: Arc<dyn DeviceStore>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            verifier,
            devices,
            server_id: server_id.into(),
        }
    }

    /// Register a just-accepted connection and greet it. Returns the
    /// assigned connection id.
    pub async fn on_connect(&self, sender: mpsc::UnboundedSender<ServerMessage>) -> String {
        let connection_id = format!("conn-{}", Uuid::new_v4());
        self.registry
            .register(ConnectionRecord::new(connection_id.clone(), sender))
            .await;
        self.registry
            .deliver_to(
                &connection_id,
                ServerMessage::ConnectionEstablished {
                    connection_id: connection_id.clone(),
                    server_id: self.server_id.clone(),
                },
            )
            .await;
        connection_id
    }

    /// Deregister a connection whose transport has closed.
    pub async fn on_disconnect(&self, connection_id: &str) {
        self.registry.remove(connection_id).await;
    }

    /// Dispatch one inbound message.
    pub async fn handle(&self, connection_id: &str, message: ClientMessage) {
        self.registry.touch(connection_id).await;

        match message {
            ClientMessage::Authenticate {
                token,
                device_fingerprint,
                ..
            } => {
                self.authenticate(connection_id, token, device_fingerprint)
                    .await
            }
            ClientMessage::AdminAuthenticate {
                session_token,
                device_fingerprint,
            } => {
                self.admin_authenticate(connection_id, session_token, device_fingerprint)
                    .await
            }
            ClientMessage::Subscribe { channels, .. } => {
                self.subscribe(connection_id, channels).await
            }
            ClientMessage::Unsubscribe { channels } => {
                self.unsubscribe(connection_id, channels).await
            }
            ClientMessage::SubscribeSecurity {
                threat_level,
                device_events,
                report_events,
                system_events,
            } => {
                let filter = SecurityFilter {
                    threat_level,
                    device_events,
                    report_events,
                    system_events,
                };
                self.subscribe_security(connection_id, filter).await
            }
            ClientMessage::SubscribeReports {
                status,
                priority,
                female_safety,
            } => {
                let filter = ReportFilter {
                    status,
                    priority,
                    female_safety,
                };
                self.subscribe_reports(connection_id, filter).await
            }
            ClientMessage::Activity { .. } => {
                // Activity clock already refreshed above.
            }
            ClientMessage::Ping => {
                self.reply(
                    connection_id,
                    ServerMessage::Pong {
                        timestamp: Utc::now().timestamp_millis(),
                    },
                )
                .await;
            }
        }
    }

    async fn authenticate(
        &self,
        connection_id: &str,
        token: Option<String>,
        device_fingerprint: Option<String>,
    ) {
        let verified = self
            .verifier
            .verify_token(token.as_deref(), device_fingerprint.as_deref())
            .await;
        match verified {
            Ok(user) => {
                if let Some(fp) = &device_fingerprint {
                    self.attribute_device(fp).await;
                }
                self.registry
                    .update(connection_id, |record| {
                        record.authenticated = true;
                        record.role = user.role;
                        record.identity = Some(user.id.clone());
                        record.device_fingerprint = device_fingerprint.clone();
                        record.permissions = user.permissions.clone();
                    })
                    .await;
                debug!(
                    connection_id = %connection_id,
                    role = user.role.as_str(),
                    "Connection authenticated"
                );
                self.reply(
                    connection_id,
                    ServerMessage::Authenticated {
                        success: true,
                        user_type: user.role.as_str().to_string(),
                        permissions: user.permissions,
                    },
                )
                .await;
            }
            Err(e) => {
                // Connection stays open, unauthenticated.
                warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "Authentication failed"
                );
                self.reply(
                    connection_id,
                    ServerMessage::AuthError {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn admin_authenticate(
        &self,
        connection_id: &str,
        session_token: String,
        device_fingerprint: Option<String>,
    ) {
        let verified = self
            .verifier
            .verify_admin_session(&session_token, device_fingerprint.as_deref())
            .await;
        match verified {
            Ok(admin) => {
                self.registry
                    .update(connection_id, |record| {
                        record.authenticated = true;
                        record.role = Role::Admin;
                        record.identity = Some(admin.id.clone());
                        record.device_fingerprint = device_fingerprint.clone();
                        record.permissions = admin.permissions.clone();
                        record.admin_level = Some(admin.admin_level);
                        // Admins join their channel set without an explicit
                        // subscribe step.
                        record.channels.extend(ADMIN_AUTO_JOIN.iter().copied());
                    })
                    .await;
                debug!(
                    connection_id = %connection_id,
                    role = Role::Admin.as_str(),
                    "Admin authenticated"
                );
                self.reply(
                    connection_id,
                    ServerMessage::AdminAuthenticated {
                        success: true,
                        user: AdminProfile {
                            username: admin.username,
                            permissions: admin.permissions,
                            admin_level: admin.admin_level,
                        },
                        available_channels: allowed_channels(Role::Admin)
                            .iter()
                            .map(|c| c.as_str().to_string())
                            .collect(),
                    },
                )
                .await;
            }
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "Admin authentication failed"
                );
                self.reply(
                    connection_id,
                    ServerMessage::AdminAuthError {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Grant the intersection of the requested channels with the role's
    /// allowed set; everything else is rejected, never the whole request.
    async fn subscribe(&self, connection_id: &str, requested: Vec<String>) {
        let Some((authenticated, role)) = self.auth_state(connection_id).await else {
            return;
        };
        if !authenticated {
            self.reply(
                connection_id,
                ServerMessage::SubscriptionError {
                    message: "authentication required before subscribing".to_string(),
                },
            )
            .await;
            return;
        }

        let allowed = allowed_channels(role);
        let mut granted: Vec<Channel> = Vec::new();
        let mut rejected: Vec<String> = Vec::new();
        for name in requested {
            match Channel::parse(&name) {
                Some(channel) if allowed.contains(&channel) => granted.push(channel),
                _ => rejected.push(name),
            }
        }

        if !rejected.is_empty() {
            debug!(
                connection_id = %connection_id,
                role = role.as_str(),
                rejected = rejected.len(),
                "Subscription partially rejected"
            );
        }

        let granted_names: Vec<String> =
            granted.iter().map(|c| c.as_str().to_string()).collect();
        self.registry
            .update(connection_id, |record| {
                record.channels.extend(granted.iter().copied());
            })
            .await;
        self.reply(
            connection_id,
            ServerMessage::SubscriptionConfirmed {
                subscribed_channels: granted_names,
                rejected_channels: rejected,
            },
        )
        .await;
    }

    /// Leave channels. Unknown names and channels never joined are
    /// acknowledged the same way, so repeats are harmless.
    async fn unsubscribe(&self, connection_id: &str, requested: Vec<String>) {
        let leaving: HashSet<Channel> = requested
            .iter()
            .filter_map(|name| Channel::parse(name))
            .collect();
        self.registry
            .update(connection_id, |record| {
                record.channels.retain(|c| !leaving.contains(c));
            })
            .await;
        self.reply(
            connection_id,
            ServerMessage::UnsubscriptionConfirmed {
                unsubscribed_channels: requested,
            },
        )
        .await;
    }

    async fn subscribe_security(&self, connection_id: &str, filter: SecurityFilter) {
        if !self.is_admin(connection_id).await {
            self.reply(
                connection_id,
                ServerMessage::SubscriptionError {
                    message: "security subscriptions are admin-only".to_string(),
                },
            )
            .await;
            return;
        }
        self.registry
            .update(connection_id, |record| {
                record.security_filter = Some(filter);
            })
            .await;
        self.reply(connection_id, ServerMessage::SecuritySubscriptionConfirmed)
            .await;
    }

    async fn subscribe_reports(&self, connection_id: &str, filter: ReportFilter) {
        if !self.is_admin(connection_id).await {
            self.reply(
                connection_id,
                ServerMessage::SubscriptionError {
                    message: "report subscriptions are admin-only".to_string(),
                },
            )
            .await;
            return;
        }
        self.registry
            .update(connection_id, |record| {
                record.report_filter = Some(filter);
            })
            .await;
        self.reply(connection_id, ServerMessage::ReportSubscriptionConfirmed)
            .await;
    }

    /// Keep device trust data current for the authenticating fingerprint.
    /// Store failures never block authentication.
    async fn attribute_device(&self, fingerprint: &str) {
        let result = match self.devices.find_by_fingerprint(fingerprint).await {
            Ok(Some(_)) => self.devices.touch_last_seen(fingerprint).await,
            Ok(None) => {
                self.devices
                    .create(DeviceRecord {
                        fingerprint: fingerprint.to_string(),
                        risk_level: "low".to_string(),
                        trust_score: 50.0,
                        violation_count: 0,
                        quarantined: false,
                        last_seen: Utc::now(),
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "Device attribution failed");
        }
    }

    async fn auth_state(&self, connection_id: &str) -> Option<(bool, Role)> {
        self.registry
            .with_record(connection_id, |record| (record.authenticated, record.role))
            .await
    }

    async fn is_admin(&self, connection_id: &str) -> bool {
        matches!(self.auth_state(connection_id).await, Some((true, Role::Admin)))
    }

    async fn reply(&self, connection_id: &str, message: ServerMessage) {
        self.registry.deliver_to(connection_id, message).await;
    }
}
