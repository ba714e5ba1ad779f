//! Event fanout: local-only or through the Redis backplane.
//!
//! Exactly one [`Fanout`] implementation is selected at hub startup and
//! used for the life of the process. With [`RedisFanout`] every publish
//! goes through Redis pub/sub, and local sockets are served by this
//! process's own pattern subscription; there is a single local-delivery
//! path in both modes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use safestreets_core::defaults::{BACKPLANE_ATTACH_TIMEOUT, BACKPLANE_CHANNEL_PREFIX};
use safestreets_core::{Channel, Error, EventEnvelope, Result};

use crate::registry::ConnectionRegistry;

/// Pseudo-channels carried over the backplane for targeting that is not
/// a subscription channel.
const ALL_TOPIC: &str = "__all__";
const ADMINS_TOPIC: &str = "__admins__";

/// Distributes envelopes to the connections that should receive them.
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Publish to members of a channel. Returns local deliveries for the
    /// in-process implementation and is 0 for backplane publishes (local
    /// delivery then happens via the listener).
    async fn publish(&self, channel: Channel, envelope: &EventEnvelope) -> Result<usize>;

    /// Publish to every connection regardless of channel membership.
    async fn publish_all(&self, envelope: &EventEnvelope) -> Result<usize>;

    /// Publish to admin connections regardless of channel membership.
    async fn publish_admins(&self, envelope: &EventEnvelope) -> Result<usize>;

    /// Whether this fanout crosses process boundaries.
    fn is_distributed(&self) -> bool;

    /// Stop any background listener. Idempotent.
    async fn detach(&self);
}

/// Single-process fanout: delivers straight to the local registry.
pub struct LocalFanout {
    registry: Arc<ConnectionRegistry>,
}

impl LocalFanout {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Fanout for LocalFanout {
    async fn publish(&self, channel: Channel, envelope: &EventEnvelope) -> Result<usize> {
        Ok(self.registry.deliver_to_channel(channel, envelope).await)
    }

    async fn publish_all(&self, envelope: &EventEnvelope) -> Result<usize> {
        Ok(self.registry.deliver_to_all(envelope).await)
    }

    async fn publish_admins(&self, envelope: &EventEnvelope) -> Result<usize> {
        Ok(self.registry.deliver_to_admins(envelope).await)
    }

    fn is_distributed(&self) -> bool {
        false
    }

    async fn detach(&self) {}
}

/// Backplane fanout over Redis pub/sub.
///
/// Publishes land on `ssrt:`-prefixed topics. A listener task pattern-
/// subscribes to the prefix and hands payloads to the local registry;
/// this process's own publishes come back through the same subscription,
/// so delivery order to a local socket matches the fleet-wide order.
pub struct RedisFanout {
    publisher: Mutex<ConnectionManager>,
    listener: Mutex<Option<JoinHandle<()>>>,
    detached: Arc<AtomicBool>,
}

impl RedisFanout {
    /// Connect the publisher and spawn the listener. Errors when Redis is
    /// unreachable; the hub then falls back to [`LocalFanout`].
    pub async fn attach(url: &str, registry: Arc<ConnectionRegistry>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Backplane(format!("invalid redis url: {e}")))?;
        let connect = ConnectionManager::new(client.clone());
        let publisher = tokio::time::timeout(BACKPLANE_ATTACH_TIMEOUT, connect)
            .await
            .map_err(|_| Error::Backplane("publisher connect timed out".to_string()))?
            .map_err(|e| Error::Backplane(format!("publisher connect: {e}")))?;

        let detached = Arc::new(AtomicBool::new(false));
        let listener = tokio::spawn(listen(client, registry, Arc::clone(&detached)));

        Ok(Self {
            publisher: Mutex::new(publisher),
            listener: Mutex::new(Some(listener)),
            detached,
        })
    }

    async fn publish_topic(&self, topic: &str, envelope: &EventEnvelope) -> Result<usize> {
        let payload = serde_json::to_string(envelope)?;
        let redis_channel = format!("{BACKPLANE_CHANNEL_PREFIX}{topic}");
        let mut publisher = self.publisher.lock().await;
        publisher
            .publish::<_, _, ()>(&redis_channel, payload)
            .await
            .map_err(|e| Error::Backplane(format!("publish {redis_channel}: {e}")))?;
        Ok(0)
    }
}

#[async_trait]
impl Fanout for RedisFanout {
    async fn publish(&self, channel: Channel, envelope: &EventEnvelope) -> Result<usize> {
        self.publish_topic(channel.as_str(), envelope).await
    }

    async fn publish_all(&self, envelope: &EventEnvelope) -> Result<usize> {
        self.publish_topic(ALL_TOPIC, envelope).await
    }

    async fn publish_admins(&self, envelope: &EventEnvelope) -> Result<usize> {
        self.publish_topic(ADMINS_TOPIC, envelope).await
    }

    fn is_distributed(&self) -> bool {
        true
    }

    async fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
            info!("Backplane listener detached");
        }
    }
}

/// Listener loop: pattern-subscribe, dispatch, reconnect on failure with
/// capped backoff.
async fn listen(client: redis::Client, registry: Arc<ConnectionRegistry>, detached: Arc<AtomicBool>) {
    let pattern = format!("{BACKPLANE_CHANNEL_PREFIX}*");
    let mut delay = Duration::from_millis(500);

    loop {
        if detached.load(Ordering::SeqCst) {
            return;
        }

        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    error!(error = %e, "Backplane psubscribe failed");
                } else {
                    info!(pattern = %pattern, "Backplane listener subscribed");
                    delay = Duration::from_millis(500);
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        if detached.load(Ordering::SeqCst) {
                            return;
                        }
                        dispatch(&registry, &msg).await;
                    }
                    warn!("Backplane subscription ended, reconnecting");
                }
            }
            Err(e) => {
                warn!(error = %e, "Backplane listener connect failed, retrying");
            }
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(10));
    }
}

async fn dispatch(registry: &ConnectionRegistry, msg: &redis::Msg) {
    let channel_name = msg.get_channel_name();
    let topic = match channel_name.strip_prefix(BACKPLANE_CHANNEL_PREFIX) {
        Some(t) => t,
        None => return,
    };

    let payload: String = match msg.get_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(topic, error = %e, "Unreadable backplane payload");
            return;
        }
    };
    let envelope: EventEnvelope = match serde_json::from_str(&payload) {
        Ok(env) => env,
        Err(e) => {
            warn!(topic, error = %e, "Malformed backplane envelope");
            return;
        }
    };

    let delivered = match topic {
        ALL_TOPIC => registry.deliver_to_all(&envelope).await,
        ADMINS_TOPIC => registry.deliver_to_admins(&envelope).await,
        other => match Channel::parse(other) {
            Some(channel) => registry.deliver_to_channel(channel, &envelope).await,
            None => {
                warn!(topic = other, "Backplane message for unknown channel");
                return;
            }
        },
    };
    debug!(
        topic,
        event_id = %envelope.id,
        delivered = delivered,
        "Backplane event dispatched"
    );
}
