//! Structured security events
//!
//! Every decision the core makes (accept, reject, bypass, revoke) is reported
//! to an [`EventSink`] as a [`SecurityEvent`]. Events never carry raw secrets:
//! the only link back to a code, state or token is `key_prefix`, a fixed-length
//! BLAKE3 fingerprint computed inside [`SecurityEvent::with_key`].
//!
//! ## Sinks
//!
//! - [`TracingEventSink`] - `tracing` records under target `security::oauth`
//! - [`MemoryEventSink`] - in-process capture for tests and the demo
//! - [`NoopEventSink`] - discards everything

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::fingerprint;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A state value was issued
    StateIssued,
    /// A state value was checked on callback
    StateValidated,
    /// An authorization code was issued
    CodeIssued,
    /// An authorization code redemption was attempted
    CodeRedeemed,
    /// A PKCE verifier was checked
    PkceVerified,
    /// A DPoP proof was validated
    DpopProofValidated,
    /// A DPoP key was compared with a token or code binding
    DpopBindingChecked,
    /// An mTLS certificate was compared with a token binding
    MtlsBindingChecked,
    /// Access (and possibly refresh and ID) tokens were issued
    TokensIssued,
    /// A refresh token was exchanged
    TokensRefreshed,
    /// A rotated-out refresh token was presented
    RefreshReplay,
    /// A refresh token family was revoked
    FamilyRevoked,
    /// A bound access token was presented at a resource
    ResourceAccess,
    /// An ID token was validated
    IdTokenValidated,
}

impl EventType {
    /// Stable name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateIssued => "state_issued",
            Self::StateValidated => "state_validated",
            Self::CodeIssued => "code_issued",
            Self::CodeRedeemed => "code_redeemed",
            Self::PkceVerified => "pkce_verified",
            Self::DpopProofValidated => "dpop_proof_validated",
            Self::DpopBindingChecked => "dpop_binding_checked",
            Self::MtlsBindingChecked => "mtls_binding_checked",
            Self::TokensIssued => "tokens_issued",
            Self::TokensRefreshed => "tokens_refreshed",
            Self::RefreshReplay => "refresh_replay",
            Self::FamilyRevoked => "family_revoked",
            Self::ResourceAccess => "resource_access",
            Self::IdTokenValidated => "id_token_validated",
        }
    }
}

/// How it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    /// Check passed
    Success,
    /// Check failed and the request was rejected
    Failure,
    /// Check failed but a vulnerability flag let the request through
    Bypassed,
    /// Credentials were revoked as a consequence
    Revoked,
}

/// A single security event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique, time-ordered identifier
    pub id: Uuid,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub event_type: EventType,
    /// How it ended
    pub outcome: EventOutcome,
    /// Fingerprint of the artifact involved
    pub key_prefix: Option<String>,
    /// Non-secret context (client id, failing check, policy flag, reason)
    pub metadata: BTreeMap<String, String>,
}

impl SecurityEvent {
    /// New event stamped with the current time
    pub fn new(event_type: EventType, outcome: EventOutcome) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            event_type,
            outcome,
            key_prefix: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach the fingerprint of `secret`; the secret itself is not kept
    #[must_use]
    pub fn with_key(mut self, secret: &str) -> Self {
        self.key_prefix = Some(fingerprint(secret));
        self
    }

    /// Attach a non-secret metadata entry
    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Override the timestamp (from an injected clock)
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Destination for security events
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Record one event
    async fn record(&self, event: SecurityEvent);
}

/// Emits events as structured `tracing` records
#[derive(Debug, Clone)]
pub struct TracingEventSink {
    service_name: String,
}

impl TracingEventSink {
    /// Create a sink tagging every record with `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl Default for TracingEventSink {
    fn default() -> Self {
        Self::new("oidclab")
    }
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: SecurityEvent) {
        let key_prefix = event.key_prefix.as_deref().unwrap_or("-");
        match event.outcome {
            EventOutcome::Success => {
                info!(
                    target: "security::oauth",
                    event_id = %event.id,
                    event_type = event.event_type.as_str(),
                    outcome = "success",
                    key_prefix = %key_prefix,
                    metadata = ?event.metadata,
                    service = %self.service_name,
                    "Security check passed"
                );
            }
            EventOutcome::Failure => {
                warn!(
                    target: "security::oauth",
                    event_id = %event.id,
                    event_type = event.event_type.as_str(),
                    outcome = "failure",
                    key_prefix = %key_prefix,
                    metadata = ?event.metadata,
                    service = %self.service_name,
                    "Security check failed"
                );
            }
            EventOutcome::Bypassed => {
                warn!(
                    target: "security::oauth",
                    event_id = %event.id,
                    event_type = event.event_type.as_str(),
                    outcome = "bypassed",
                    key_prefix = %key_prefix,
                    metadata = ?event.metadata,
                    service = %self.service_name,
                    "Security check bypassed by vulnerability policy"
                );
            }
            EventOutcome::Revoked => {
                warn!(
                    target: "security::oauth",
                    event_id = %event.id,
                    event_type = event.event_type.as_str(),
                    outcome = "revoked",
                    key_prefix = %key_prefix,
                    metadata = ?event.metadata,
                    service = %self.service_name,
                    "Credentials revoked"
                );
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Events of one type
    pub fn of_type(&self, event_type: EventType) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of events with the given type and outcome
    pub fn count(&self, event_type: EventType, outcome: EventOutcome) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type && event.outcome == outcome)
            .count()
    }

    /// Drop everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}

/// Discards events
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record(&self, _event: SecurityEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_never_holds_raw_key() {
        let secret = "SplxlOBeZQQYbYS6WxSbIA-raw-code";
        let event = SecurityEvent::new(EventType::CodeRedeemed, EventOutcome::Failure)
            .with_key(secret)
            .with_meta("reason", "client_mismatch");

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains(secret));
        assert_eq!(event.key_prefix.as_deref().map(str::len), Some(16));
    }

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemoryEventSink::new();
        tokio_test::block_on(async {
            sink.record(SecurityEvent::new(EventType::StateValidated, EventOutcome::Success))
                .await;
            sink.record(SecurityEvent::new(EventType::StateValidated, EventOutcome::Bypassed))
                .await;
        });

        assert_eq!(sink.count(EventType::StateValidated, EventOutcome::Bypassed), 1);
        assert_eq!(sink.of_type(EventType::StateValidated).len(), 2);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = SecurityEvent::new(EventType::CodeIssued, EventOutcome::Success);
        let b = SecurityEvent::new(EventType::CodeIssued, EventOutcome::Success);
        assert_ne!(a.id, b.id);
    }
}
