//! Audit event recording
//!
//! Security-relevant events flow through the narrow [`AuditSink`] seam. The
//! routing layer records every authenticated request and every rejection
//! before the response is written. Event payloads carry anonymized
//! identities only: pseudonymous device labels and token-hash prefixes,
//! never raw tokens, codes or client names.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Length of the token-hash prefix included in events
const TOKEN_PREFIX_LEN: usize = 8;

/// A security-relevant event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum AuditEvent {
    /// A pairing session was opened
    PairingStarted {
        expires_at: DateTime<Utc>,
    },

    /// A pairing submission succeeded and a token was issued
    PairingSucceeded {
        device_id: String,
        anonymized_name: String,
    },

    /// A pairing submission was rejected
    PairingFailed {
        reason: String,
    },

    /// A request carried a missing or invalid bearer token
    AuthFailure {
        remote_addr: String,
    },

    /// A valid token exceeded its rate budget
    RateLimited {
        token_prefix: String,
    },

    /// An authenticated request was dispatched to a handler
    RequestServed {
        method: String,
        path: String,
        token_prefix: String,
        status: u16,
    },

    /// All paired devices were revoked
    TokensRevoked {
        count: usize,
    },
}

impl AuditEvent {
    /// Short event-type name
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::PairingStarted { .. } => "pairing_started",
            AuditEvent::PairingSucceeded { .. } => "pairing_succeeded",
            AuditEvent::PairingFailed { .. } => "pairing_failed",
            AuditEvent::AuthFailure { .. } => "auth_failure",
            AuditEvent::RateLimited { .. } => "rate_limited",
            AuditEvent::RequestServed { .. } => "request_served",
            AuditEvent::TokensRevoked { .. } => "tokens_revoked",
        }
    }
}

/// Truncate a token hash for inclusion in audit details
pub fn token_prefix(token_hash: &str) -> String {
    token_hash.chars().take(TOKEN_PREFIX_LEN).collect()
}

/// Narrow interface through which security events are recorded
pub trait AuditSink: Send + Sync {
    /// Record one event; implementations must not block the caller for long
    fn record(&self, event: AuditEvent);
}

/// Sink that emits structured `tracing` events on the `audit` target
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        let details = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "audit", kind = event.kind(), %details);
    }
}

/// Buffering sink for tests and embedders that inspect events directly
#[derive(Default)]
pub struct MemoryAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit buffer poisoned").clone()
    }

    /// How many events of the given kind were recorded
    pub fn count_of(&self, kind: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().expect("audit buffer poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        let event = AuditEvent::AuthFailure {
            remote_addr: "192.168.1.20:54021".into(),
        };
        assert_eq!(event.kind(), "auth_failure");

        let event = AuditEvent::TokensRevoked { count: 3 };
        assert_eq!(event.kind(), "tokens_revoked");
    }

    #[test]
    fn test_token_prefix_truncates() {
        let hash = "a1b2c3d4e5f6a7b8c9d0";
        assert_eq!(token_prefix(hash), "a1b2c3d4");
        assert_eq!(token_prefix("ab"), "ab");
    }

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::PairingFailed { reason: "invalid_code".into() });
        sink.record(AuditEvent::PairingFailed { reason: "expired_code".into() });
        sink.record(AuditEvent::TokensRevoked { count: 1 });

        assert_eq!(sink.count_of("pairing_failed"), 2);
        assert_eq!(sink.count_of("tokens_revoked"), 1);
        assert_eq!(sink.count_of("request_served"), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = AuditEvent::RequestServed {
            method: "GET".into(),
            path: "/api/v1/status".into(),
            token_prefix: "a1b2c3d4".into(),
            status: 200,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "request_served");
        assert_eq!(json["status"], 200);
    }
}
