//! Lifecycle and health controller for the realtime layer.
//!
//! Startup order: the transport router and message handlers exist from
//! construction; `start` then attempts the backplane attach (degrading to
//! single-process mode on failure), spawns the background tasks, and
//! finally flips the ready flag. Callers that broadcast before readiness
//! get queueing, not errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use safestreets_core::defaults::{HEALTH_SNAPSHOT_TIMEOUT, SHUTDOWN_GRACE};
use safestreets_core::{
    DeviceStore, IdentityVerifier, RealtimeEvent, ReportStore, Severity, ThreatFinding,
};

use crate::config::RealtimeConfig;
use crate::dispatch::{ConnectionStats, EventDispatcher};
use crate::fanout::{Fanout, LocalFanout, RedisFanout};
use crate::registry::ConnectionRegistry;
use crate::session::SessionHandler;
use crate::store::BackplaneStore;
use crate::sweep::{SweepPolicy, ThreatSweep};

/// Health snapshot. Producing one never fails; internal problems surface
/// as `status: "unhealthy"` with a message instead.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub local_connections: usize,
    pub global_connections: usize,
    pub admin_connections: usize,
    pub backplane_attached: bool,
    pub threat_sweep_active: bool,
    pub failed_events: usize,
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub uptime_secs: u64,
}

impl HealthReport {
    /// Degraded report carrying the failure message, with zeroed counters.
    pub fn unhealthy(message: impl Into<String>, uptime_secs: u64) -> Self {
        Self {
            status: "unhealthy".to_string(),
            error: Some(message.into()),
            local_connections: 0,
            global_connections: 0,
            admin_connections: 0,
            backplane_attached: false,
            threat_sweep_active: false,
            failed_events: 0,
            events_published: 0,
            events_delivered: 0,
            events_dropped: 0,
            uptime_secs,
        }
    }
}

/// The realtime layer's front door: owns the registry, dispatcher, sweep,
/// and background tasks, and exposes the programmatic API the REST layer
/// calls.
pub struct RealtimeHub {
    config: RealtimeConfig,
    store: BackplaneStore,
    registry: Arc<ConnectionRegistry>,
    session: Arc<SessionHandler>,
    dispatcher: Arc<EventDispatcher>,
    sweep: Arc<ThreatSweep>,
    ready_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl RealtimeHub {
    /// Wire up the hub. The transport router and message handlers are
    /// usable immediately; call [`start`](Self::start) to attach the
    /// backplane and begin background work.
    pub fn new(
        config: RealtimeConfig,
        verifier: Arc<dyn IdentityVerifier>,
        device_store: Arc<dyn DeviceStore>,
        report_store: Arc<dyn ReportStore>,
    ) -> Self {
        let store = BackplaneStore::disabled();
        let registry = Arc::new(ConnectionRegistry::new(store.clone(), &config.server_id));
        let session = Arc::new(SessionHandler::new(
            Arc::clone(&registry),
            verifier,
            Arc::clone(&device_store),
            &config.server_id,
        ));
        let dispatcher = Arc::new(
            EventDispatcher::new(
                Arc::new(LocalFanout::new(Arc::clone(&registry))),
                Arc::clone(&registry),
                store.clone(),
                &config.server_id,
            )
            .with_failed_cap(config.failed_events_cap),
        );
        let sweep = Arc::new(ThreatSweep::new(
            SweepPolicy::default(),
            report_store,
            device_store,
        ));
        let (ready_tx, _) = watch::channel(false);

        Self {
            config,
            store,
            registry,
            session,
            dispatcher,
            sweep,
            ready_tx,
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Attach the backplane, spawn background tasks, and mark the hub
    /// ready. Backplane failure degrades to single-process mode; it never
    /// aborts startup.
    pub async fn start(&self) {
        if self.config.redis_enabled {
            if self.store.attach(&self.config.redis_url).await {
                match RedisFanout::attach(&self.config.redis_url, Arc::clone(&self.registry)).await
                {
                    Ok(fanout) => {
                        self.dispatcher.set_fanout(Arc::new(fanout)).await;
                        info!(server_id = %self.config.server_id, "Backplane fanout attached");
                    }
                    Err(e) => {
                        warn!(error = %e, "Backplane fanout unavailable, staying single-process");
                    }
                }
            } else {
                warn!("Backplane unavailable, staying single-process");
            }
        } else {
            info!("Backplane disabled by configuration");
        }

        self.spawn_background_tasks().await;
        self.dispatcher.mark_ready().await;
        let _ = self.ready_tx.send(true);
        info!(server_id = %self.config.server_id, "Realtime hub ready");
    }

    /// Resolve once the hub is ready. Safe to call before `start`.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.subscribe().borrow()
    }

    /// Websocket router for merging into the host HTTP server.
    pub fn router(&self) -> axum::Router {
        crate::transport::router(Arc::clone(&self.session))
    }

    /// Broadcast a security event handed in by the REST layer. Severity is
    /// read from `data.severity`, defaulting to medium.
    pub async fn notify_security_event(&self, data: JsonValue) -> String {
        let severity = data
            .get("severity")
            .and_then(|v| v.as_str())
            .and_then(parse_severity)
            .unwrap_or(Severity::Medium);
        let kind = data
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("external")
            .to_string();
        self.dispatcher
            .broadcast(RealtimeEvent::SecurityEvent {
                severity,
                threat: ThreatFinding::External {
                    kind,
                    details: data,
                },
            })
            .await
    }

    /// Broadcast a report status change. Reports flagged `femaleSafety`
    /// go to the female-safety channel instead of the general one.
    pub async fn notify_report_update(&self, data: JsonValue) -> String {
        let report_id = data
            .get("reportId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let female_safety = data
            .get("femaleSafety")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let event = if female_safety {
            RealtimeEvent::FemaleSafetyUpdate {
                report_id,
                details: Some(data),
            }
        } else {
            let status = data
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("updated")
                .to_string();
            RealtimeEvent::ReportUpdate {
                report_id,
                status,
                details: Some(data),
            }
        };
        self.dispatcher.broadcast(event).await
    }

    /// Global emergency broadcast, bypassing channel membership.
    pub async fn emergency_alert(&self, data: JsonValue) -> String {
        let message = data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Emergency alert")
            .to_string();
        self.dispatcher.emergency_broadcast(message, Some(data)).await
    }

    /// Notify admin connections; queued if called before the hub is ready.
    pub async fn emit_to_admins(&self, event: impl Into<String>, data: JsonValue) {
        self.dispatcher.emit_to_admins(event, data).await;
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        self.dispatcher.connection_stats().await
    }

    /// Health snapshot. Never fails: gathering the counters is bounded,
    /// and past the bound the report degrades to unhealthy instead of
    /// hanging the caller on a wedged lock.
    pub async fn health_check(&self) -> HealthReport {
        let uptime_secs = self.started_at.elapsed().as_secs();
        let snapshot = tokio::time::timeout(HEALTH_SNAPSHOT_TIMEOUT, async {
            (self.connection_stats().await, self.store.is_connected().await)
        })
        .await;
        let (stats, backplane_attached) = match snapshot {
            Ok(parts) => parts,
            Err(_) => {
                warn!("Health snapshot timed out");
                return HealthReport::unhealthy("health snapshot timed out", uptime_secs);
            }
        };
        HealthReport {
            status: "healthy".to_string(),
            error: None,
            local_connections: stats.local_connections,
            global_connections: stats.global_connections,
            admin_connections: stats.admin_connections,
            backplane_attached,
            threat_sweep_active: self.sweep.is_active(),
            failed_events: stats.failed_events,
            events_published: stats.events_published,
            events_delivered: stats.events_delivered,
            events_dropped: stats.events_dropped,
            uptime_secs,
        }
    }

    /// Graceful teardown: disable the sweep, announce shutdown, wait the
    /// grace period, release connections, then detach the backplane. Each
    /// step is best-effort; a failure never aborts the rest.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(server_id = %self.config.server_id, "Realtime hub shutting down");

        self.sweep.disable();

        self.dispatcher
            .broadcast(RealtimeEvent::ServerShutdown {
                message: "Server is shutting down".to_string(),
            })
            .await;

        tokio::time::sleep(SHUTDOWN_GRACE).await;

        {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.registry.clear().await;

        self.dispatcher.current_fanout().await.detach().await;
        self.store.detach().await;
        let _ = self.ready_tx.send(false);
        info!("Realtime hub stopped");
    }

    async fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock().await;

        // Threat sweep: findings become security_event broadcasts.
        {
            let sweep = Arc::clone(&self.sweep);
            let dispatcher = Arc::clone(&self.dispatcher);
            let interval = self.config.threat_sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !sweep.is_active() {
                        continue;
                    }
                    for (severity, threat) in sweep.run_once().await {
                        dispatcher
                            .broadcast(RealtimeEvent::SecurityEvent { severity, threat })
                            .await;
                    }
                }
            }));
        }

        // Stale-connection eviction.
        {
            let registry = Arc::clone(&self.registry);
            let interval = self.config.stale_sweep_interval;
            let window = self.config.inactivity_window;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    registry.sweep_stale(window).await;
                }
            }));
        }

        // Failed-event retry.
        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let interval = self.config.retry_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    dispatcher.retry_failed().await;
                }
            }));
        }

        // Periodic metrics self-report.
        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let interval = self.config.metrics_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stats = dispatcher.connection_stats().await;
                    dispatcher
                        .broadcast(RealtimeEvent::WebsocketMetrics {
                            local_connections: stats.local_connections,
                            global_connections: stats.global_connections,
                            admin_connections: stats.admin_connections,
                            failed_events: stats.failed_events,
                            published: stats.events_published,
                            delivered: stats.events_delivered,
                            dropped: stats.events_dropped,
                        })
                        .await;
                }
            }));
        }

        if tasks.is_empty() {
            error!("No background tasks spawned");
        }
    }

    /// Registry handle for tests and embedding hosts.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Session handler for tests and embedding hosts.
    pub fn session(&self) -> Arc<SessionHandler> {
        Arc::clone(&self.session)
    }

    /// Dispatcher handle for tests and embedding hosts.
    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }
}

fn parse_severity(s: &str) -> Option<Severity> {
    match s {
        "low" => Some(Severity::Low),
        "medium" => Some(Severity::Medium),
        "high" => Some(Severity::High),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}
