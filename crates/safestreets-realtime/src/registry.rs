//! Per-process connection registry with backplane mirroring.
//!
//! The local map is the source of truth for connections this process
//! accepted; a partial record is mirrored into the backplane for
//! fleet-wide visibility. Mirror writes are best-effort — a failed write
//! is logged and local state stands. A given connection id is only ever
//! registered on the one process that accepted its transport, so mirror
//! updates never race across processes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use safestreets_core::defaults::{CONN_MIRROR_PREFIX, CONN_MIRROR_TTL_SECS, SUB_MIRROR_PREFIX};
use safestreets_core::{Channel, EventEnvelope, Role, ServerMessage};

use crate::store::BackplaneStore;

/// Admin preference: which security events this connection wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFilter {
    pub threat_level: Option<String>,
    pub device_events: bool,
    pub report_events: bool,
    pub system_events: bool,
}

/// Admin preference: which report updates this connection wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilter {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub female_safety: bool,
}

/// One live transport connection owned by this process.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub authenticated: bool,
    pub role: Role,
    /// External user record reference; anonymous connections have none.
    pub identity: Option<String>,
    pub device_fingerprint: Option<String>,
    pub channels: HashSet<Channel>,
    /// Present only for admin connections.
    pub admin_level: Option<u8>,
    pub permissions: Vec<String>,
    pub security_filter: Option<SecurityFilter>,
    pub report_filter: Option<ReportFilter>,
    /// Outbound handle into this connection's transport task.
    pub sender: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionRecord {
    /// Fresh unauthenticated record for a just-accepted connection.
    pub fn new(connection_id: String, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            connected_at: now,
            last_activity_at: now,
            authenticated: false,
            role: Role::Anonymous,
            identity: None,
            device_fingerprint: None,
            channels: HashSet::new(),
            admin_level: None,
            permissions: Vec::new(),
            security_filter: None,
            report_filter: None,
            sender,
        }
    }
}

/// Partial record replicated into the backplane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionMirror {
    connection_id: String,
    server_id: String,
    authenticated: bool,
    role: Role,
    channels: Vec<Channel>,
    last_activity_at: DateTime<Utc>,
    device_fingerprint: Option<String>,
}

/// Admin filter preferences replicated into their own sub-record, keyed
/// under `SUB_MIRROR_PREFIX`. Written only once a connection has set at
/// least one filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionMirror {
    connection_id: String,
    server_id: String,
    security_filter: Option<SecurityFilter>,
    report_filter: Option<ReportFilter>,
}

/// Registry of connections accepted by this process.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionRecord>>,
    store: BackplaneStore,
    server_id: String,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(store: BackplaneStore, server_id: impl Into<String>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            store,
            server_id: server_id.into(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert a connection and mirror it. Mirror failure is logged only —
    /// local state remains authoritative for this process.
    pub async fn register(&self, record: ConnectionRecord) {
        let mirror = self.mirror_of(&record);
        let id = record.connection_id.clone();
        {
            let mut map = self.connections.write().await;
            map.insert(id.clone(), record);
        }
        self.write_mirror(&id, mirror).await;
        debug!(connection_id = %id, "Connection registered");
    }

    /// Merge a patch into a record and re-mirror. Filter preferences are
    /// mirrored into their own sub-record. No-op when absent.
    pub async fn update<F>(&self, connection_id: &str, patch: F)
    where
        F: FnOnce(&mut ConnectionRecord),
    {
        let mirrors = {
            let mut map = self.connections.write().await;
            match map.get_mut(connection_id) {
                Some(record) => {
                    patch(record);
                    Some((self.mirror_of(record), self.sub_mirror_of(record)))
                }
                None => None,
            }
        };
        if let Some((mirror, sub_mirror)) = mirrors {
            self.write_mirror(connection_id, mirror).await;
            if let Some(sub) = sub_mirror {
                self.write_sub_mirror(connection_id, sub).await;
            }
        }
    }

    /// Read a projection of a record without touching the mirror.
    pub async fn with_record<F, T>(&self, connection_id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&ConnectionRecord) -> T,
    {
        let map = self.connections.read().await;
        map.get(connection_id).map(f)
    }

    /// Refresh the activity clock for a connection.
    pub async fn touch(&self, connection_id: &str) {
        self.update(connection_id, |record| {
            record.last_activity_at = Utc::now();
        })
        .await;
    }

    /// Remove a connection locally and from the backplane, including its
    /// subscription-preference sub-record.
    pub async fn remove(&self, connection_id: &str) {
        let removed = {
            let mut map = self.connections.write().await;
            map.remove(connection_id)
        };
        if removed.is_some() {
            let conn_key = format!("{CONN_MIRROR_PREFIX}{connection_id}");
            let sub_key = format!("{SUB_MIRROR_PREFIX}{connection_id}");
            self.store.delete(&conn_key).await;
            self.store.delete(&sub_key).await;
            debug!(connection_id = %connection_id, "Connection removed");
        }
    }

    /// Number of connections registered on this process.
    pub async fn count_local(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of locally-registered admin connections.
    pub async fn count_admins(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.role == Role::Admin)
            .count()
    }

    /// Fleet-wide connection count via the backplane; falls back to the
    /// local count when the backplane is unavailable.
    pub async fn count_global(&self) -> usize {
        match self.store.count_prefix(CONN_MIRROR_PREFIX).await {
            Some(count) => count,
            None => self.count_local().await,
        }
    }

    /// Evict connections idle past `threshold`. Returns evicted ids.
    /// Dropping a record drops its outbound sender, which ends the
    /// transport task and closes the socket.
    pub async fn sweep_stale(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::seconds(600));
        let stale: Vec<String> = {
            let map = self.connections.read().await;
            map.values()
                .filter(|r| r.last_activity_at < cutoff)
                .map(|r| r.connection_id.clone())
                .collect()
        };
        for id in &stale {
            self.remove(id).await;
        }
        if !stale.is_empty() {
            info!(evicted = stale.len(), "Stale connections swept");
        }
        stale
    }

    /// Drop every connection. Shutdown path: dropping the records drops
    /// their senders, which closes the transports.
    pub async fn clear(&self) {
        let ids: Vec<String> = {
            let map = self.connections.read().await;
            map.keys().cloned().collect()
        };
        for id in &ids {
            self.remove(id).await;
        }
        if !ids.is_empty() {
            info!(closed = ids.len(), "All connections released");
        }
    }

    /// Send a message to one connection. Returns false when the connection
    /// is absent or its transport task has gone away.
    pub async fn deliver_to(&self, connection_id: &str, message: ServerMessage) -> bool {
        let map = self.connections.read().await;
        match map.get(connection_id) {
            Some(record) => self.try_send(record, message),
            None => false,
        }
    }

    /// Fan an event out to local members of a channel. Returns the number
    /// of sockets delivered to.
    pub async fn deliver_to_channel(&self, channel: Channel, envelope: &EventEnvelope) -> usize {
        let map = self.connections.read().await;
        let mut delivered = 0;
        for record in map.values() {
            if record.channels.contains(&channel)
                && self.try_send(record, ServerMessage::Event(envelope.clone()))
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to every locally-registered connection, bypassing channel
    /// membership. Emergency/shutdown path only.
    pub async fn deliver_to_all(&self, envelope: &EventEnvelope) -> usize {
        let map = self.connections.read().await;
        let mut delivered = 0;
        for record in map.values() {
            if self.try_send(record, ServerMessage::Event(envelope.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to every locally-registered admin connection.
    pub async fn deliver_to_admins(&self, envelope: &EventEnvelope) -> usize {
        let map = self.connections.read().await;
        let mut delivered = 0;
        for record in map.values() {
            if record.role == Role::Admin
                && self.try_send(record, ServerMessage::Event(envelope.clone()))
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Messages delivered / dropped since startup.
    pub fn delivery_counters(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    fn try_send(&self, record: &ConnectionRecord, message: ServerMessage) -> bool {
        if record.sender.send(message).is_ok() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn mirror_of(&self, record: &ConnectionRecord) -> ConnectionMirror {
        ConnectionMirror {
            connection_id: record.connection_id.clone(),
            server_id: self.server_id.clone(),
            authenticated: record.authenticated,
            role: record.role,
            channels: record.channels.iter().copied().collect(),
            last_activity_at: record.last_activity_at,
            device_fingerprint: record.device_fingerprint.clone(),
        }
    }

    fn sub_mirror_of(&self, record: &ConnectionRecord) -> Option<SubscriptionMirror> {
        if record.security_filter.is_none() && record.report_filter.is_none() {
            return None;
        }
        Some(SubscriptionMirror {
            connection_id: record.connection_id.clone(),
            server_id: self.server_id.clone(),
            security_filter: record.security_filter.clone(),
            report_filter: record.report_filter.clone(),
        })
    }

    async fn write_mirror(&self, connection_id: &str, mirror: ConnectionMirror) {
        let key = format!("{CONN_MIRROR_PREFIX}{connection_id}");
        if !self.store.set_ex(&key, &mirror, CONN_MIRROR_TTL_SECS).await {
            // Local map stays authoritative; fleet-wide counts degrade.
            warn!(connection_id = %connection_id, "Connection mirror write failed");
        }
    }

    async fn write_sub_mirror(&self, connection_id: &str, mirror: SubscriptionMirror) {
        let key = format!("{SUB_MIRROR_PREFIX}{connection_id}");
        if !self.store.set_ex(&key, &mirror, CONN_MIRROR_TTL_SECS).await {
            warn!(connection_id = %connection_id, "Subscription mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safestreets_core::RealtimeEvent;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(BackplaneStore::disabled(), "test-server")
    }

    async fn connect(
        reg: &ConnectionRegistry,
        id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.register(ConnectionRecord::new(id.to_string(), tx)).await;
        rx
    }

    fn shutdown_event() -> EventEnvelope {
        EventEnvelope::new(
            RealtimeEvent::ServerShutdown {
                message: "test".to_string(),
            },
            "test-server",
        )
    }

    #[tokio::test]
    async fn register_update_remove() {
        let reg = registry();
        let _rx = connect(&reg, "c1").await;
        assert_eq!(reg.count_local().await, 1);

        reg.update("c1", |r| {
            r.authenticated = true;
            r.role = Role::Citizen;
        })
        .await;

        reg.remove("c1").await;
        assert_eq!(reg.count_local().await, 0);

        // Removing again is a no-op, and updates to absent ids do nothing.
        reg.remove("c1").await;
        reg.update("c1", |r| r.authenticated = true).await;
    }

    #[tokio::test]
    async fn count_global_falls_back_to_local() {
        let reg = registry();
        let _a = connect(&reg, "a").await;
        let _b = connect(&reg, "b").await;
        // Disabled store → SCAN unavailable → local count.
        assert_eq!(reg.count_global().await, 2);
    }

    #[tokio::test]
    async fn channel_delivery_respects_membership() {
        let reg = registry();
        let mut rx_member = connect(&reg, "member").await;
        let mut rx_other = connect(&reg, "other").await;

        reg.update("member", |r| {
            r.channels.insert(Channel::ReportUpdates);
        })
        .await;

        let env = EventEnvelope::new(
            RealtimeEvent::ReportUpdate {
                report_id: "r-1".to_string(),
                status: "approved".to_string(),
                details: None,
            },
            "test-server",
        );
        let delivered = reg.deliver_to_channel(Channel::ReportUpdates, &env).await;
        assert_eq!(delivered, 1);
        assert!(matches!(
            rx_member.try_recv().unwrap(),
            ServerMessage::Event(_)
        ));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn deliver_to_all_ignores_membership() {
        let reg = registry();
        let mut rx = connect(&reg, "loner").await;
        // No channels joined at all.
        let delivered = reg.deliver_to_all(&shutdown_event()).await;
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn deliver_to_admins_filters_by_role() {
        let reg = registry();
        let mut rx_admin = connect(&reg, "admin").await;
        let mut rx_citizen = connect(&reg, "citizen").await;
        reg.update("admin", |r| r.role = Role::Admin).await;
        reg.update("citizen", |r| r.role = Role::Citizen).await;

        let delivered = reg.deliver_to_admins(&shutdown_event()).await;
        assert_eq!(delivered, 1);
        assert!(rx_admin.try_recv().is_ok());
        assert!(rx_citizen.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_connections() {
        let reg = registry();
        let _rx_idle = connect(&reg, "idle").await;
        let _rx_live = connect(&reg, "live").await;

        reg.update("idle", |r| {
            r.last_activity_at = Utc::now() - chrono::Duration::minutes(20);
        })
        .await;

        let evicted = reg.sweep_stale(Duration::from_secs(600)).await;
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert_eq!(reg.count_local().await, 1);
    }

    #[tokio::test]
    async fn filter_preferences_produce_a_subscription_mirror() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut record = ConnectionRecord::new("admin".to_string(), tx);

        // No filters set, no sub-record to mirror.
        assert!(reg.sub_mirror_of(&record).is_none());

        record.security_filter = Some(SecurityFilter {
            threat_level: Some("high".to_string()),
            device_events: true,
            report_events: false,
            system_events: false,
        });
        let mirror = reg.sub_mirror_of(&record).unwrap();
        let json = serde_json::to_string(&mirror).unwrap();
        assert!(json.contains(r#""connectionId":"admin""#));
        assert!(json.contains(r#""threatLevel":"high""#));

        record.security_filter = None;
        record.report_filter = Some(ReportFilter {
            status: Some("pending".to_string()),
            priority: None,
            female_safety: true,
        });
        let mirror = reg.sub_mirror_of(&record).unwrap();
        let json = serde_json::to_string(&mirror).unwrap();
        assert!(json.contains(r#""femaleSafety":true"#));
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_drop() {
        let reg = registry();
        let rx = connect(&reg, "gone").await;
        drop(rx);
        let delivered = reg.deliver_to_all(&shutdown_event()).await;
        assert_eq!(delivered, 0);
        let (_, dropped) = reg.delivery_counters();
        assert_eq!(dropped, 1);
    }
}
