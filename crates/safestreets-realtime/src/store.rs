//! Redis-backed key/value store for connection mirroring and event replay.
//!
//! Best-effort by contract: every operation degrades to a no-op (with a
//! log line) when Redis is unavailable, and the store can be constructed
//! in a permanently-disabled mode for single-process deployments and
//! tests. Nothing here ever propagates a Redis failure to a caller.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use safestreets_core::defaults;

/// Shared-state store backed by Redis.
#[derive(Clone)]
pub struct BackplaneStore {
    inner: Arc<BackplaneStoreInner>,
}

struct BackplaneStoreInner {
    /// Redis connection manager (None when degraded to local-only mode).
    connection: RwLock<Option<ConnectionManager>>,
}

impl BackplaneStore {
    /// Attach to Redis with bounded retry and capped exponential backoff.
    ///
    /// After [`defaults::BACKPLANE_ATTACH_ATTEMPTS`] failures the store
    /// fails open: it is returned in disabled mode and the hub continues
    /// in single-process operation.
    pub async fn connect(url: &str) -> Self {
        let store = Self::disabled();
        store.attach(url).await;
        store
    }

    /// Attach an already-constructed (possibly disabled) store to Redis.
    /// Returns whether a connection was established.
    pub async fn attach(&self, url: &str) -> bool {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Invalid Redis URL, backplane store disabled");
                return false;
            }
        };

        let mut delay = Duration::from_millis(250);
        for attempt in 1..=defaults::BACKPLANE_ATTACH_ATTEMPTS {
            // Each connect attempt is individually bounded; a blackholed
            // address must not hold startup for the OS connect timeout.
            let connect = ConnectionManager::new(client.clone());
            match tokio::time::timeout(defaults::BACKPLANE_ATTACH_TIMEOUT, connect).await {
                Ok(Ok(conn)) => {
                    debug!(attempt, "Backplane store attached");
                    *self.inner.connection.write().await = Some(conn);
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(
                        attempt,
                        error = %e,
                        "Backplane store attach failed, retrying"
                    );
                }
                Err(_) => {
                    warn!(attempt, "Backplane store attach timed out, retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(defaults::BACKPLANE_ATTACH_BACKOFF_CAP);
        }

        warn!("Backplane store unreachable, continuing in single-process mode");
        false
    }

    /// Drop the Redis connection, returning the store to disabled mode.
    pub async fn detach(&self) {
        *self.inner.connection.write().await = None;
    }

    /// Create a disabled store (single-process mode, or tests).
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(BackplaneStoreInner {
                connection: RwLock::new(None),
            }),
        }
    }

    /// Whether a Redis connection is held.
    pub async fn is_connected(&self) -> bool {
        self.inner.connection.read().await.is_some()
    }

    /// Store a value with a TTL. Returns false on any failure.
    pub async fn set_ex<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        let mut guard = self.inner.connection.write().await;
        let conn = match guard.as_mut() {
            Some(c) => c,
            None => return false,
        };

        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                error!(key, error = %e, "Mirror serialization error");
                return false;
            }
        };

        match conn.set_ex::<_, _, ()>(key, serialized, ttl_secs).await {
            Ok(_) => true,
            Err(e) => {
                error!(key, error = %e, "Redis SET error");
                false
            }
        }
    }

    /// Fetch and deserialize a value. None on miss or any failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut guard = self.inner.connection.write().await;
        let conn = guard.as_mut()?;

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(data)) => match serde_json::from_str(&data) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "Mirror deserialization error");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(key, error = %e, "Redis GET error");
                None
            }
        }
    }

    /// Delete a key. Returns false on any failure.
    pub async fn delete(&self, key: &str) -> bool {
        let mut guard = self.inner.connection.write().await;
        let conn = match guard.as_mut() {
            Some(c) => c,
            None => return false,
        };

        match conn.del::<_, ()>(key).await {
            Ok(_) => true,
            Err(e) => {
                error!(key, error = %e, "Redis DEL error");
                false
            }
        }
    }

    /// Count keys under a prefix via cursored SCAN. None when the store is
    /// disabled or the scan fails — callers fall back to local counts.
    pub async fn count_prefix(&self, prefix: &str) -> Option<usize> {
        let mut guard = self.inner.connection.write().await;
        let conn = guard.as_mut()?;

        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut count = 0usize;

        loop {
            let result: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await;

            match result {
                Ok((next, keys)) => {
                    count += keys.len();
                    if next == 0 {
                        return Some(count);
                    }
                    cursor = next;
                }
                Err(e) => {
                    error!(prefix, error = %e, "Redis SCAN error");
                    return None;
                }
            }
        }
    }
}
