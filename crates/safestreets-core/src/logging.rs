//! Structured logging field name constants for the realtime layer.
//!
//! Both crates use these constants for consistent structured logging so
//! log aggregation tools can query by standardized field names.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded delivery, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), connection counts |
//! | DEBUG | Decision points, subscription grants, cache hits |
//! | TRACE | Per-message fanout, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Transport-assigned connection identifier.
pub const CONNECTION_ID: &str = "connection_id";

/// Logical broadcast channel name.
pub const CHANNEL: &str = "channel";

/// Generated event id (`{type}_{millis}_{suffix}`).
pub const EVENT_ID: &str = "event_id";

/// Wire name of the event type.
pub const EVENT_TYPE: &str = "event_type";

/// Identifier of the process that originated a broadcast.
pub const SERVER_ID: &str = "server_id";

/// Connection role after authentication.
pub const ROLE: &str = "role";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Number of locally-registered connections.
pub const LOCAL_CONNECTIONS: &str = "local_connections";

/// Number of sockets a fanout delivered to.
pub const DELIVERED: &str = "delivered";

/// Number of entries in the failed-events list.
pub const FAILED_EVENTS: &str = "failed_events";

/// Redelivery attempt counter for a queued event.
pub const RETRY_COUNT: &str = "retry_count";

/// Findings produced by one threat-sweep detector.
pub const FINDING_COUNT: &str = "finding_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_are_unique_snake_case() {
        let fields = [
            CONNECTION_ID,
            CHANNEL,
            EVENT_ID,
            EVENT_TYPE,
            SERVER_ID,
            ROLE,
            LOCAL_CONNECTIONS,
            DELIVERED,
            FAILED_EVENTS,
            RETRY_COUNT,
            FINDING_COUNT,
            ERROR_MSG,
        ];
        let unique: std::collections::HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
        for field in fields {
            assert!(field
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
