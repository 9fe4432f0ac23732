//! CSRF `state` binding
//!
//! One live state per (session, provider). Validation consumes the record, so
//! a state matches at most once. Missing, mismatched and expired states are
//! logged as distinct outcomes but return the same error to the caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, fingerprint};
use crate::error::{Check, CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent};
use crate::policy::{Verdict, VulnerabilityPolicy};
use crate::random::SecureRandom;
use crate::store::{Lookup, Namespace, RecordStore};

/// Stored state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// The issued value
    pub state_value: String,
    /// Browser session it belongs to
    pub session_id: String,
    /// Upstream provider, when one session runs several flows
    pub provider: Option<String>,
    /// Issue time (Unix seconds)
    pub created_at: i64,
    /// Expiry (Unix seconds)
    pub expires_at: i64,
}

/// Why a state check failed; only ever logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateFailure {
    Missing,
    Mismatch,
    Expired,
}

impl StateFailure {
    fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "state_missing",
            Self::Mismatch => "state_mismatch",
            Self::Expired => "state_expired",
        }
    }
}

/// Issues and validates `state` values
#[derive(Debug, Clone)]
pub struct StateBinder {
    records: RecordStore,
    events: Arc<dyn EventSink>,
    ttl: chrono::Duration,
}

/// Length-prefixed so no session id can collide with a session/provider pair
fn record_id(session_id: &str, provider: Option<&str>) -> String {
    match provider {
        Some(provider) => format!("{}:{session_id}@{provider}", session_id.len()),
        None => format!("{}:{session_id}", session_id.len()),
    }
}

impl StateBinder {
    /// Create a binder storing states for `ttl`
    pub fn new(records: RecordStore, events: Arc<dyn EventSink>, ttl: chrono::Duration) -> Self {
        Self {
            records,
            events,
            ttl,
        }
    }

    /// Issue a fresh state for `session_id`, replacing any earlier one
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedInput`] for an empty session and
    /// [`CoreError::Store`] if the store fails
    pub async fn issue(&self, session_id: &str, provider: Option<&str>) -> Result<String> {
        if session_id.is_empty() {
            return Err(CoreError::MalformedInput(
                "session_id must not be empty".to_string(),
            ));
        }

        let now = self.records.clock().unix_now();
        let state_value = SecureRandom::state();
        let record = StateRecord {
            state_value: state_value.clone(),
            session_id: session_id.to_string(),
            provider: provider.map(str::to_string),
            created_at: now,
            expires_at: now + self.ttl.num_seconds(),
        };

        self.records
            .put_until(
                Namespace::State,
                &record_id(session_id, provider),
                &record,
                record.expires_at,
            )
            .await?;

        self.events
            .record(
                SecurityEvent::new(EventType::StateIssued, EventOutcome::Success)
                    .at(self.records.clock().now())
                    .with_key(&state_value)
                    .with_meta("session", fingerprint(session_id)),
            )
            .await;

        Ok(state_value)
    }

    /// Validate the state returned on callback and consume it
    ///
    /// # Errors
    /// Returns the same [`CoreError::ValidationFailed`] for a missing, unknown,
    /// mismatched or expired state, and [`CoreError::Store`] if the store fails
    pub async fn validate_and_consume(
        &self,
        session_id: &str,
        provider: Option<&str>,
        state_value: &str,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        if state_value.is_empty() {
            if policy.missing_state_allowed {
                self.emit(state_value, session_id, EventOutcome::Bypassed, |event| {
                    event
                        .with_meta("reason", StateFailure::Missing.as_str())
                        .with_meta("flag", "missing_state_allowed")
                })
                .await;
                return Ok(Verdict::Bypassed(vec!["missing_state_allowed"]));
            }
            return self.reject(session_id, state_value, StateFailure::Missing).await;
        }

        let id = record_id(session_id, provider);
        let lookup: Lookup<StateRecord> = if policy.reusable_state {
            self.records.peek(Namespace::State, &id).await?
        } else {
            self.records.consume(Namespace::State, &id).await?
        };

        let failure = match lookup {
            Lookup::Live(record) if constant_time_eq(&record.state_value, state_value) => None,
            Lookup::Live(_) => Some(StateFailure::Mismatch),
            Lookup::Expired => Some(StateFailure::Expired),
            Lookup::Missing => Some(StateFailure::Missing),
        };

        match failure {
            None => {
                let mut flags = Vec::new();
                if policy.reusable_state {
                    flags.push("reusable_state");
                }
                let outcome = if flags.is_empty() {
                    EventOutcome::Success
                } else {
                    EventOutcome::Bypassed
                };
                self.emit(state_value, session_id, outcome, |event| event)
                    .await;
                Ok(Verdict::from_bypassed(flags))
            }
            Some(failure) if policy.skip_state_validation => {
                tracing::warn!(
                    reason = failure.as_str(),
                    "State check failed; accepted by skip_state_validation"
                );
                self.emit(state_value, session_id, EventOutcome::Bypassed, |event| {
                    event
                        .with_meta("reason", failure.as_str())
                        .with_meta("flag", "skip_state_validation")
                })
                .await;
                Ok(Verdict::Bypassed(vec!["skip_state_validation"]))
            }
            Some(failure) => self.reject(session_id, state_value, failure).await,
        }
    }

    async fn reject(
        &self,
        session_id: &str,
        state_value: &str,
        failure: StateFailure,
    ) -> Result<Verdict> {
        tracing::warn!(reason = failure.as_str(), "State validation failed");
        self.emit(state_value, session_id, EventOutcome::Failure, |event| {
            event.with_meta("reason", failure.as_str())
        })
        .await;
        Err(CoreError::validation(Check::State, "state validation failed"))
    }

    async fn emit(
        &self,
        state_value: &str,
        session_id: &str,
        outcome: EventOutcome,
        decorate: impl FnOnce(SecurityEvent) -> SecurityEvent,
    ) {
        let mut event = SecurityEvent::new(EventType::StateValidated, outcome)
            .at(self.records.clock().now())
            .with_meta("session", fingerprint(session_id));
        if !state_value.is_empty() {
            event = event.with_key(state_value);
        }
        self.events.record(decorate(event)).await;
    }
}
