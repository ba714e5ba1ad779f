//! End-to-end flows through the hub: authentication, subscription
//! gating, event distribution, escalation, retry exhaustion, emergency
//! bypass, and stale eviction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use safestreets_realtime::{
    allowed_channels, Channel, ClientMessage, ConnectionRegistry, DeviceRecord, DeviceStore,
    Error, EventEnvelope, Fanout, IdentityVerifier, RealtimeConfig, RealtimeHub, ReportRecord,
    ReportStatus, ReportStore, Result, Role, ServerMessage, SessionHandler, SweepPolicy,
    ThreatFinding, ThreatSweep, VerifiedAdmin, VerifiedUser,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct TestVerifier;

#[async_trait]
impl IdentityVerifier for TestVerifier {
    async fn verify_token(&self, token: Option<&str>, _: Option<&str>) -> Result<VerifiedUser> {
        match token {
            Some("citizen-token") => Ok(VerifiedUser {
                id: "u-1".to_string(),
                role: Role::Citizen,
                permissions: vec!["report".to_string()],
            }),
            None => Ok(VerifiedUser {
                id: "anon-1".to_string(),
                role: Role::Anonymous,
                permissions: vec![],
            }),
            Some(_) => Err(Error::Auth("invalid token".to_string())),
        }
    }

    async fn verify_admin_session(&self, token: &str, _: Option<&str>) -> Result<VerifiedAdmin> {
        if token == "admin-session" {
            Ok(VerifiedAdmin {
                id: "a-1".to_string(),
                username: "ops".to_string(),
                permissions: vec!["moderate".to_string()],
                admin_level: 3,
            })
        } else {
            Err(Error::Auth("invalid session".to_string()))
        }
    }
}

#[derive(Default)]
struct TestStores {
    burst_reports: Vec<ReportRecord>,
}

#[async_trait]
impl DeviceStore for TestStores {
    async fn find_by_fingerprint(&self, _: &str) -> Result<Option<DeviceRecord>> {
        Ok(None)
    }
    async fn create(&self, _: DeviceRecord) -> Result<()> {
        Ok(())
    }
    async fn touch_last_seen(&self, _: &str) -> Result<()> {
        Ok(())
    }
    async fn find_high_risk(&self, _: Duration, _: usize) -> Result<Vec<DeviceRecord>> {
        Ok(vec![])
    }
}

#[async_trait]
impl ReportStore for TestStores {
    async fn find_recent(&self, _: Duration, _: &[ReportStatus]) -> Result<Vec<ReportRecord>> {
        Ok(self.burst_reports.clone())
    }
    async fn find_cross_border_flagged(&self, _: Duration) -> Result<Vec<ReportRecord>> {
        Ok(vec![])
    }
}

struct RefusingFanout;

#[async_trait]
impl Fanout for RefusingFanout {
    async fn publish(&self, _: Channel, _: &EventEnvelope) -> Result<usize> {
        Err(Error::Backplane("refused".to_string()))
    }
    async fn publish_all(&self, _: &EventEnvelope) -> Result<usize> {
        Err(Error::Backplane("refused".to_string()))
    }
    async fn publish_admins(&self, _: &EventEnvelope) -> Result<usize> {
        Err(Error::Backplane("refused".to_string()))
    }
    fn is_distributed(&self) -> bool {
        false
    }
    async fn detach(&self) {}
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn started_hub() -> RealtimeHub {
    init_tracing();
    let hub = RealtimeHub::new(
        RealtimeConfig::default()
            .with_server_id("it-hub")
            .with_redis_enabled(false),
        Arc::new(TestVerifier),
        Arc::new(TestStores::default()),
        Arc::new(TestStores::default()),
    );
    hub.start().await;
    hub.wait_ready().await;
    hub
}

struct Client {
    id: String,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Client {
    async fn connect(session: &SessionHandler) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = session.on_connect(tx).await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::ConnectionEstablished { .. })
        ));
        Self { id, rx }
    }

    /// Event type names received so far, dropping non-event replies.
    fn event_kinds(&mut self) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            if let ServerMessage::Event(env) = msg {
                kinds.push(env.event_type);
            }
        }
        kinds
    }

    fn next_reply(&mut self) -> ServerMessage {
        self.rx.try_recv().expect("expected a reply")
    }
}

async fn authenticate_citizen(session: &SessionHandler, client: &mut Client) {
    session
        .handle(
            &client.id,
            ClientMessage::Authenticate {
                token: Some("citizen-token".to_string()),
                device_fingerprint: None,
                user_type: None,
            },
        )
        .await;
    assert!(matches!(
        client.next_reply(),
        ServerMessage::Authenticated { success: true, .. }
    ));
}

async fn authenticate_admin(session: &SessionHandler, client: &mut Client) {
    session
        .handle(
            &client.id,
            ClientMessage::AdminAuthenticate {
                session_token: "admin-session".to_string(),
                device_fingerprint: None,
            },
        )
        .await;
    assert!(matches!(
        client.next_reply(),
        ServerMessage::AdminAuthenticated { success: true, .. }
    ));
}

// ---------------------------------------------------------------------------
// Scenario A: citizen subscription gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn citizen_subscription_is_gated_and_gets_only_granted_events() {
    let hub = started_hub().await;
    let session = hub.session();
    let mut client = Client::connect(&session).await;
    authenticate_citizen(&session, &mut client).await;

    session
        .handle(
            &client.id,
            ClientMessage::Subscribe {
                channels: vec![
                    "general_updates".to_string(),
                    "security_monitoring".to_string(),
                ],
                options: serde_json::Value::Null,
            },
        )
        .await;
    match client.next_reply() {
        ServerMessage::SubscriptionConfirmed {
            subscribed_channels,
            rejected_channels,
        } => {
            assert_eq!(subscribed_channels, vec!["general_updates".to_string()]);
            assert_eq!(rejected_channels, vec!["security_monitoring".to_string()]);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // A security event must not reach the citizen.
    hub.notify_security_event(serde_json::json!({
        "type": "probe", "severity": "high"
    }))
    .await;
    assert!(client.event_kinds().is_empty());

    // The joined set stays inside the role's allowance.
    let joined = hub
        .registry()
        .with_record(&client.id, |r| r.channels.clone())
        .await
        .unwrap();
    for channel in &joined {
        assert!(allowed_channels(Role::Citizen).contains(channel));
    }

    hub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario B: critical escalation to admins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn critical_security_event_reaches_admin_twice_and_exactly_once_each() {
    let hub = started_hub().await;
    let session = hub.session();
    let mut admin = Client::connect(&session).await;
    authenticate_admin(&session, &mut admin).await;

    hub.notify_security_event(serde_json::json!({
        "type": "x", "severity": "critical"
    }))
    .await;

    let kinds = admin.event_kinds();
    assert_eq!(
        kinds.iter().filter(|k| *k == "security_event").count(),
        1,
        "expected exactly one security_event, got {kinds:?}"
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "critical_security_alert")
            .count(),
        1,
        "expected exactly one critical_security_alert, got {kinds:?}"
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn escalation_does_not_require_security_monitoring_subscribers() {
    let hub = started_hub().await;
    let session = hub.session();

    // Admin that left security_monitoring still gets the escalated alert
    // on admin_global.
    let mut admin = Client::connect(&session).await;
    authenticate_admin(&session, &mut admin).await;
    session
        .handle(
            &admin.id,
            ClientMessage::Unsubscribe {
                channels: vec!["security_monitoring".to_string()],
            },
        )
        .await;
    let _ = admin.next_reply();

    hub.notify_security_event(serde_json::json!({
        "type": "x", "severity": "critical"
    }))
    .await;

    assert_eq!(
        admin.event_kinds(),
        vec!["critical_security_alert".to_string()]
    );
    hub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario C: retry exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_publish_exhausts_budget_and_rests_in_failed_list() {
    let hub = started_hub().await;
    hub.dispatcher().set_fanout(Arc::new(RefusingFanout)).await;

    hub.notify_report_update(serde_json::json!({
        "reportId": "r-1", "status": "approved"
    }))
    .await;

    let dispatcher = hub.dispatcher();
    assert_eq!(dispatcher.failed_count().await, 1);

    for _ in 0..3 {
        dispatcher.retry_failed().await;
    }
    let snapshot = dispatcher.failed_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].retry_count, 3);

    // Further sweeps leave the exhausted entry untouched.
    dispatcher.retry_failed().await;
    dispatcher.retry_failed().await;
    assert_eq!(dispatcher.failed_snapshot().await[0].retry_count, 3);

    // Health reporting surfaces the loss.
    let report = hub.health_check().await;
    assert_eq!(report.failed_events, 1);
    hub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario D: burst detection feeding distribution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn report_burst_produces_one_coordinated_attack_event() {
    let bucket_start = Utc.timestamp_opt(1_756_000_800, 0).unwrap();
    let reports: Vec<ReportRecord> = (0..6)
        .map(|i| ReportRecord {
            id: format!("r-{i}"),
            status: ReportStatus::Pending,
            created_at: bucket_start + chrono::Duration::seconds(i * 30),
            location: serde_json::json!({"district": "Dhaka"}),
            device_fingerprint: None,
            cross_border: false,
        })
        .collect();
    let sweep = ThreatSweep::new(
        SweepPolicy::default(),
        Arc::new(TestStores {
            burst_reports: reports,
        }),
        Arc::new(TestStores::default()),
    );

    let findings = sweep.run_once().await;
    assert_eq!(findings.len(), 1);
    match &findings[0].1 {
        ThreatFinding::CoordinatedAttack {
            report_count,
            pattern,
            ..
        } => {
            assert_eq!(*report_count, 6);
            assert_eq!(pattern, "high_frequency");
        }
        other => panic!("unexpected finding: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenario E: emergency bypass
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emergency_broadcast_reaches_connection_with_zero_channels() {
    let hub = started_hub().await;
    let session = hub.session();

    // Connected but never authenticated, zero channels joined.
    let mut bare = Client::connect(&session).await;

    hub.emergency_alert(serde_json::json!({"message": "test"}))
        .await;

    assert_eq!(bare.event_kinds(), vec!["emergency_alert".to_string()]);
    hub.shutdown().await;
}

#[tokio::test]
async fn emergency_broadcast_duplicates_to_admins() {
    let hub = started_hub().await;
    let session = hub.session();
    let mut admin = Client::connect(&session).await;
    authenticate_admin(&session, &mut admin).await;

    hub.emergency_alert(serde_json::json!({"message": "evacuate"}))
        .await;

    let kinds = admin.event_kinds();
    assert!(kinds.contains(&"emergency_alert".to_string()));
    assert!(kinds.contains(&"emergency_admin_alert".to_string()));
    hub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Stale eviction and mirrored counts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_connection_is_evicted_and_channels_released() {
    let hub = started_hub().await;
    let session = hub.session();
    let registry = hub.registry();

    let mut client = Client::connect(&session).await;
    authenticate_citizen(&session, &mut client).await;
    session
        .handle(
            &client.id,
            ClientMessage::Subscribe {
                channels: vec!["general_updates".to_string()],
                options: serde_json::Value::Null,
            },
        )
        .await;
    let _ = client.next_reply();

    // Backdate the activity clock past the inactivity threshold.
    registry
        .update(&client.id, |r| {
            r.last_activity_at = Utc::now() - chrono::Duration::minutes(30);
        })
        .await;

    let evicted = registry.sweep_stale(Duration::from_secs(600)).await;
    assert_eq!(evicted, vec![client.id.clone()]);
    assert_eq!(registry.count_local().await, 0);

    // The dropped sender closes the client's stream.
    assert!(client.rx.recv().await.is_none());

    // Later general_updates broadcasts deliver to nobody.
    let delivered = registry
        .deliver_to_channel(
            Channel::GeneralUpdates,
            &EventEnvelope::new(
                safestreets_realtime::RealtimeEvent::ReportUpdate {
                    report_id: "r-x".to_string(),
                    status: "approved".to_string(),
                    details: None,
                },
                "it-hub",
            ),
        )
        .await;
    assert_eq!(delivered, 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn activity_messages_keep_a_connection_alive() {
    let hub = started_hub().await;
    let session = hub.session();
    let registry = hub.registry();

    let mut client = Client::connect(&session).await;
    registry
        .update(&client.id, |r| {
            r.last_activity_at = Utc::now() - chrono::Duration::minutes(30);
        })
        .await;

    // Activity refreshes the clock before the sweep runs.
    session
        .handle(
            &client.id,
            ClientMessage::Activity {
                data: serde_json::json!({"page": "map"}),
            },
        )
        .await;

    let evicted = registry.sweep_stale(Duration::from_secs(600)).await;
    assert!(evicted.is_empty());
    assert_eq!(registry.count_local().await, 1);
    let _ = client.rx.try_recv();
    hub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Single-process ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn same_channel_broadcasts_arrive_in_call_order() {
    let hub = started_hub().await;
    let session = hub.session();
    let mut admin = Client::connect(&session).await;
    authenticate_admin(&session, &mut admin).await;

    for i in 0..5 {
        hub.notify_report_update(serde_json::json!({
            "reportId": format!("r-{i}"), "status": "approved"
        }))
        .await;
    }

    let mut seen = Vec::new();
    while let Ok(msg) = admin.rx.try_recv() {
        if let ServerMessage::Event(env) = msg {
            if let safestreets_realtime::RealtimeEvent::ReportUpdate { report_id, .. } =
                env.payload
            {
                seen.push(report_id);
            }
        }
    }
    assert_eq!(seen, vec!["r-0", "r-1", "r-2", "r-3", "r-4"]);
    hub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Registry counting fallback without a registry double
// ---------------------------------------------------------------------------

#[tokio::test]
async fn global_count_falls_back_to_local_without_backplane() {
    let registry = ConnectionRegistry::new(
        safestreets_realtime::BackplaneStore::disabled(),
        "it-node",
    );
    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    registry
        .register(safestreets_realtime::ConnectionRecord::new(
            "a".to_string(),
            tx_a,
        ))
        .await;
    registry
        .register(safestreets_realtime::ConnectionRecord::new(
            "b".to_string(),
            tx_b,
        ))
        .await;
    assert_eq!(registry.count_global().await, 2);
}
