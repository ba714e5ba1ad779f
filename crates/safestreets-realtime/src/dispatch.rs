//! Event distribution engine.
//!
//! Broadcasting is best-effort from the caller's perspective: a publish
//! failure is never returned to the caller. Failed publishes land in a
//! bounded failed-events list and are retried on a timer; an entry that
//! exhausts its retry budget stays in the list (skipped by the sweep)
//! until the cap evicts it, so operators can inspect what was lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use safestreets_core::defaults::{EVENT_CACHE_PREFIX, FAILED_EVENTS_CAP, MAX_RETRIES};
use safestreets_core::{Channel, EventEnvelope, RealtimeEvent, Severity};

use crate::fanout::Fanout;
use crate::registry::ConnectionRegistry;
use crate::store::BackplaneStore;

/// Where a publish is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Channel(Channel),
    /// Every connection, ignoring channel membership.
    All,
    /// Every admin connection, ignoring channel membership.
    Admins,
}

/// A broadcast that could not be published, held for the retry sweep.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub envelope: EventEnvelope,
    pub target: Target,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: String,
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub local_connections: usize,
    pub global_connections: usize,
    pub admin_connections: usize,
    pub failed_events: usize,
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
}

/// Constructs, tags, caches, and publishes typed events.
pub struct EventDispatcher {
    /// Swapped from local to backplane fanout during startup.
    fanout: tokio::sync::RwLock<Arc<dyn Fanout>>,
    registry: Arc<ConnectionRegistry>,
    cache: BackplaneStore,
    server_id: String,
    ready: AtomicBool,
    published: AtomicU64,
    failed: Mutex<VecDeque<FailedEvent>>,
    failed_cap: usize,
    /// Admin notices that arrived before the engine was ready.
    pending_admin: Mutex<Vec<RealtimeEvent>>,
}

impl EventDispatcher {
    pub fn new(
        fanout: Arc<dyn Fanout>,
        registry: Arc<ConnectionRegistry>,
        cache: BackplaneStore,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            fanout: tokio::sync::RwLock::new(fanout),
            registry,
            cache,
            server_id: server_id.into(),
            ready: AtomicBool::new(false),
            published: AtomicU64::new(0),
            failed: Mutex::new(VecDeque::new()),
            failed_cap: FAILED_EVENTS_CAP,
            pending_admin: Mutex::new(Vec::new()),
        }
    }

    /// Cap override for tests.
    pub fn with_failed_cap(mut self, cap: usize) -> Self {
        self.failed_cap = cap;
        self
    }

    /// Replace the fanout. Used once at startup when the backplane attach
    /// succeeds after the dispatcher was constructed local-only.
    pub async fn set_fanout(&self, fanout: Arc<dyn Fanout>) {
        *self.fanout.write().await = fanout;
    }

    /// Handle on the fanout currently in use.
    pub async fn current_fanout(&self) -> Arc<dyn Fanout> {
        self.fanout.read().await.clone()
    }

    /// Mark the engine ready and flush admin notices queued during startup.
    pub async fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        let pending: Vec<RealtimeEvent> = {
            let mut queue = self.pending_admin.lock().await;
            queue.drain(..).collect()
        };
        if !pending.is_empty() {
            info!(flushed = pending.len(), "Flushing queued admin notices");
            for event in pending {
                self.broadcast(event).await;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Tag, cache, and publish an event to its channel. Returns the event
    /// id. Never fails from the caller's perspective.
    ///
    /// A critical security event is additionally escalated to
    /// `admin_global` as a distinct `critical_security_alert`, so critical
    /// findings never depend on someone having joined `security_monitoring`.
    pub async fn broadcast(&self, event: RealtimeEvent) -> String {
        let escalation = match &event {
            RealtimeEvent::SecurityEvent { severity, threat }
                if *severity == Severity::Critical =>
            {
                Some(RealtimeEvent::CriticalSecurityAlert {
                    severity: *severity,
                    threat: threat.clone(),
                })
            }
            _ => None,
        };

        let target = route(&event);
        let envelope = EventEnvelope::new(event, &self.server_id);
        let id = envelope.id.clone();
        self.publish_enveloped(envelope, target).await;

        if let Some(alert) = escalation {
            let alert_env = EventEnvelope::new(alert, &self.server_id);
            debug!(
                event_id = %alert_env.id,
                "Escalating critical security event"
            );
            self.publish_enveloped(alert_env, Target::Channel(Channel::AdminGlobal))
                .await;
        }
        id
    }

    /// Global broadcast bypassing channel membership, duplicated to admin
    /// connections as `emergency_admin_alert`. Never queued up front; a
    /// failed publish gets exactly one more attempt in the retry sweep.
    pub async fn emergency_broadcast(&self, message: String, details: Option<JsonValue>) -> String {
        let envelope = EventEnvelope::new(
            RealtimeEvent::EmergencyAlert {
                message: message.clone(),
                details: details.clone(),
            },
            &self.server_id,
        );
        let id = envelope.id.clone();
        self.cache_envelope(&envelope).await;
        if let Err(e) = self.publish_target(Target::All, &envelope).await {
            warn!(event_id = %id, error = %e, "Emergency publish failed");
            self.enqueue_failed(envelope, Target::All, e.to_string(), MAX_RETRIES - 1)
                .await;
        } else {
            self.published.fetch_add(1, Ordering::Relaxed);
        }

        let admin_env = EventEnvelope::new(
            RealtimeEvent::EmergencyAdminAlert { message, details },
            &self.server_id,
        );
        self.cache_envelope(&admin_env).await;
        if let Err(e) = self.publish_target(Target::Admins, &admin_env).await {
            self.enqueue_failed(admin_env, Target::Admins, e.to_string(), MAX_RETRIES - 1)
                .await;
        } else {
            self.published.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    /// Notify admin connections of an application event. Queued until the
    /// engine is ready, then flushed in arrival order.
    pub async fn emit_to_admins(&self, event: impl Into<String>, data: JsonValue) {
        let notice = RealtimeEvent::AdminNotice {
            event: event.into(),
            data,
        };
        if !self.is_ready() {
            self.pending_admin.lock().await.push(notice);
            return;
        }
        self.broadcast(notice).await;
    }

    /// One retry pass over the failed-events list. Entries that exhausted
    /// their budget are skipped; everything else gets one more attempt.
    pub async fn retry_failed(&self) {
        let candidates: Vec<FailedEvent> = {
            let mut queue = self.failed.lock().await;
            let mut keep = VecDeque::with_capacity(queue.len());
            let mut take = Vec::new();
            while let Some(entry) = queue.pop_front() {
                if entry.retry_count < MAX_RETRIES {
                    take.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *queue = keep;
            take
        };
        if candidates.is_empty() {
            return;
        }

        debug!(retrying = candidates.len(), "Retry sweep started");
        for mut entry in candidates {
            entry.retry_count += 1;
            let result = self.publish_target(entry.target, &entry.envelope).await;
            match result {
                Ok(_) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        event_id = %entry.envelope.id,
                        retry_count = entry.retry_count,
                        "Failed event redelivered"
                    );
                }
                Err(e) => {
                    entry.last_error = e.to_string();
                    if entry.retry_count >= MAX_RETRIES {
                        warn!(
                            event_id = %entry.envelope.id,
                            event_type = %entry.envelope.event_type,
                            retry_count = entry.retry_count,
                            "Event exhausted retry budget"
                        );
                    }
                    self.push_failed(entry).await;
                }
            }
        }
    }

    /// Number of entries currently in the failed-events list.
    pub async fn failed_count(&self) -> usize {
        self.failed.lock().await.len()
    }

    /// Snapshot of the failed-events list for inspection.
    pub async fn failed_snapshot(&self) -> Vec<FailedEvent> {
        self.failed.lock().await.iter().cloned().collect()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Gather connection and delivery counters.
    pub async fn connection_stats(&self) -> ConnectionStats {
        let (delivered, dropped) = self.registry.delivery_counters();
        ConnectionStats {
            local_connections: self.registry.count_local().await,
            global_connections: self.registry.count_global().await,
            admin_connections: self.registry.count_admins().await,
            failed_events: self.failed_count().await,
            events_published: self.published_count(),
            events_delivered: delivered,
            events_dropped: dropped,
        }
    }

    async fn publish_enveloped(&self, envelope: EventEnvelope, target: Target) {
        if !self.is_ready() {
            debug!(
                event_id = %envelope.id,
                "Broadcast before ready, queueing"
            );
            self.enqueue_failed(envelope, target, "engine not ready".to_string(), 0)
                .await;
            return;
        }

        // Cache-write happens-before publish, per broadcast.
        self.cache_envelope(&envelope).await;

        match self.publish_target(target, &envelope).await {
            Ok(delivered) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    delivered = delivered,
                    "Event published"
                );
            }
            Err(e) => {
                warn!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Publish failed, queueing for retry"
                );
                self.enqueue_failed(envelope, target, e.to_string(), 0).await;
            }
        }
    }

    async fn publish_target(
        &self,
        target: Target,
        envelope: &EventEnvelope,
    ) -> safestreets_core::Result<usize> {
        let fanout = self.current_fanout().await;
        match target {
            Target::Channel(channel) => fanout.publish(channel, envelope).await,
            Target::All => fanout.publish_all(envelope).await,
            Target::Admins => fanout.publish_admins(envelope).await,
        }
    }

    /// Best-effort replay cache write with a type-specific TTL.
    async fn cache_envelope(&self, envelope: &EventEnvelope) {
        let Some(ttl) = envelope.payload.replay_ttl_secs() else {
            return;
        };
        let key = format!("{EVENT_CACHE_PREFIX}{}", envelope.id);
        if !self.cache.set_ex(&key, envelope, ttl).await && self.cache.is_connected().await {
            warn!(event_id = %envelope.id, "Replay cache write failed");
        }
    }

    async fn enqueue_failed(
        &self,
        envelope: EventEnvelope,
        target: Target,
        error: String,
        retry_count: u32,
    ) {
        self.push_failed(FailedEvent {
            envelope,
            target,
            enqueued_at: Utc::now(),
            retry_count,
            last_error: error,
        })
        .await;
    }

    async fn push_failed(&self, entry: FailedEvent) {
        let mut queue = self.failed.lock().await;
        if queue.len() >= self.failed_cap {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    event_id = %evicted.envelope.id,
                    "Failed-events list full, evicting oldest"
                );
            }
        }
        queue.push_back(entry);
    }
}

/// Channel routing by event type.
fn route(event: &RealtimeEvent) -> Target {
    match event {
        RealtimeEvent::SecurityEvent { .. } => Target::Channel(Channel::SecurityMonitoring),
        RealtimeEvent::CriticalSecurityAlert { .. } => Target::Channel(Channel::AdminGlobal),
        RealtimeEvent::ReportUpdate { .. } => Target::Channel(Channel::ReportUpdates),
        RealtimeEvent::FemaleSafetyUpdate { .. } => Target::Channel(Channel::FemaleSafetyReports),
        RealtimeEvent::SystemStats { .. } | RealtimeEvent::WebsocketMetrics { .. } => {
            Target::Channel(Channel::SystemStats)
        }
        RealtimeEvent::EmergencyAlert { .. } | RealtimeEvent::ServerShutdown { .. } => Target::All,
        RealtimeEvent::EmergencyAdminAlert { .. } | RealtimeEvent::AdminNotice { .. } => {
            Target::Admins
        }
    }
}
