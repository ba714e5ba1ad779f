//! Runtime configuration for the realtime hub.

use std::time::Duration;

use safestreets_core::defaults;

/// Configuration for [`crate::RealtimeHub`].
///
/// Intervals and lifecycle windows default to the constants in
/// [`safestreets_core::defaults`]; deployments override them here rather
/// than at the task call sites.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Identifier of this server process, stamped on every broadcast.
    pub server_id: String,
    /// Redis connection URL for the backplane and replay cache.
    pub redis_url: String,
    /// Whether to attach the backplane at all. When false the hub runs in
    /// single-process mode from the start.
    pub redis_enabled: bool,
    /// Inactivity window before a connection is evicted.
    pub inactivity_window: Duration,
    /// Interval between stale-connection sweeps.
    pub stale_sweep_interval: Duration,
    /// Interval between threat-detection sweeps.
    pub threat_sweep_interval: Duration,
    /// Interval between failed-event retry passes.
    pub retry_interval: Duration,
    /// Interval between websocket-metrics self-reports.
    pub metrics_interval: Duration,
    /// Cap on the failed-events list.
    pub failed_events_cap: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            server_id: format!("ss-{}", uuid::Uuid::new_v4()),
            redis_url: "redis://localhost:6379".to_string(),
            redis_enabled: true,
            inactivity_window: defaults::INACTIVITY_WINDOW,
            stale_sweep_interval: defaults::STALE_SWEEP_INTERVAL,
            threat_sweep_interval: defaults::THREAT_SWEEP_INTERVAL,
            retry_interval: defaults::RETRY_INTERVAL,
            metrics_interval: defaults::METRICS_INTERVAL,
            failed_events_cap: defaults::FAILED_EVENTS_CAP,
        }
    }
}

impl RealtimeConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SERVER_ID` | random | Process identifier stamped on broadcasts |
    /// | `REDIS_URL` | `redis://localhost:6379` | Backplane/cache URL |
    /// | `REDIS_ENABLED` | `true` | Disable to force single-process mode |
    /// | `RT_INACTIVITY_SECS` | `600` | Stale-connection threshold |
    /// | `RT_THREAT_SWEEP_SECS` | `120` | Threat sweep interval |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SERVER_ID") {
            if !v.is_empty() {
                config.server_id = v;
            }
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            config.redis_url = v;
        }
        config.redis_enabled = std::env::var("REDIS_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        if let Some(secs) = env_u64("RT_INACTIVITY_SECS") {
            config.inactivity_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RT_THREAT_SWEEP_SECS") {
            config.threat_sweep_interval = Duration::from_secs(secs);
        }

        config
    }

    /// Set the server id.
    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    /// Enable or disable the backplane.
    pub fn with_redis_enabled(mut self, enabled: bool) -> Self {
        self.redis_enabled = enabled;
        self
    }

    /// Set the backplane URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Override the inactivity window (tests use short windows).
    pub fn with_inactivity_window(mut self, window: Duration) -> Self {
        self.inactivity_window = window;
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_policy_constants() {
        let config = RealtimeConfig::default();
        assert_eq!(config.inactivity_window, defaults::INACTIVITY_WINDOW);
        assert_eq!(config.threat_sweep_interval, defaults::THREAT_SWEEP_INTERVAL);
        assert_eq!(config.retry_interval, defaults::RETRY_INTERVAL);
        assert!(config.redis_enabled);
        assert!(config.server_id.starts_with("ss-"));
    }

    #[test]
    fn builder_overrides() {
        let config = RealtimeConfig::default()
            .with_server_id("node-a")
            .with_redis_enabled(false)
            .with_inactivity_window(Duration::from_secs(5));
        assert_eq!(config.server_id, "node-a");
        assert!(!config.redis_enabled);
        assert_eq!(config.inactivity_window, Duration::from_secs(5));
    }
}
