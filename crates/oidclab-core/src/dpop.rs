//! DPoP proof validation against the shared store
//!
//! Wraps [`oidclab_dpop::DpopProofValidator`] with the core's replay cache,
//! clock, policy mapping and security events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;

use oidclab_dpop::{DpopError, DpopProofValidator, ReplayCache, ValidatedProof, verify_jkt_binding};

use crate::error::{Check, CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent};
use crate::policy::{Verdict, VulnerabilityPolicy};
use crate::store::{Namespace, RecordStore};

/// `jti` replay cache on the `dpop-jti:` namespace
#[derive(Debug, Clone)]
pub struct StoreReplayCache {
    records: RecordStore,
}

impl StoreReplayCache {
    /// Use `records` as the replay cache
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }
}

#[async_trait]
impl ReplayCache for StoreReplayCache {
    async fn insert_once(&self, jti: &str, ttl: Duration) -> oidclab_dpop::Result<bool> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| DpopError::StorageError {
            reason: format!("replay TTL out of range: {e}"),
        })?;
        self.records
            .put_if_absent(Namespace::DpopJti, jti, &(), ttl)
            .await
            .map_err(|e| DpopError::StorageError {
                reason: e.to_string(),
            })
    }
}

/// A DPoP proof and the request it arrived with
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct DpopProofRequest {
    /// Compact proof JWT from the `DPoP` header
    pub proof: String,
    /// HTTP method of the request
    pub method: String,
    /// Full request URI
    pub uri: String,
    /// Access token presented alongside, for `ath`
    pub access_token: Option<String>,
}

/// A proof that passed every enforced check
#[derive(Debug, Clone)]
pub struct CheckedProof {
    /// Validator output: key, thumbprint, `jti`
    pub proof: ValidatedProof,
    /// Policy flags that let a failing check through
    pub verdict: Verdict,
}

impl CheckedProof {
    /// RFC 7638 thumbprint of the proof key
    pub fn thumbprint(&self) -> &str {
        &self.proof.thumbprint
    }
}

/// Policy-aware DPoP validator
#[derive(Debug, Clone)]
pub struct DpopVerifier {
    validator: DpopProofValidator,
    records: RecordStore,
    events: Arc<dyn EventSink>,
}

impl DpopVerifier {
    /// Validator using `records` for replay detection and its clock for `iat`
    pub fn new(records: RecordStore, events: Arc<dyn EventSink>, iat_window_secs: i64) -> Self {
        let replay_cache: Arc<dyn ReplayCache> = Arc::new(StoreReplayCache::new(records.clone()));
        Self {
            validator: DpopProofValidator::new(replay_cache).with_iat_window(iat_window_secs),
            records,
            events,
        }
    }

    /// Validate a proof under `policy`
    ///
    /// # Errors
    /// - [`CoreError::MalformedInput`] for an unparseable proof or request URI
    /// - [`CoreError::ValidationFailed`] for a failed enforced check
    /// - [`CoreError::Expired`] for an `iat` outside the window
    /// - [`CoreError::ReplayDetected`] for a reused `jti`
    pub async fn validate_proof(
        &self,
        request: &DpopProofRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<CheckedProof> {
        let now = self.records.clock().unix_now();
        let result = self
            .validator
            .validate(
                &request.proof,
                &request.method,
                &request.uri,
                request.access_token.as_deref(),
                now,
                &policy.dpop_checks(),
            )
            .await;

        match result {
            Ok(proof) => {
                let flags = proof
                    .bypassed
                    .iter()
                    .map(|name| VulnerabilityPolicy::dpop_flag_for(name))
                    .collect();
                let verdict = Verdict::from_bypassed(flags);
                let outcome = if verdict.is_bypassed() {
                    EventOutcome::Bypassed
                } else {
                    EventOutcome::Success
                };
                let mut event = SecurityEvent::new(EventType::DpopProofValidated, outcome)
                    .at(self.records.clock().now())
                    .with_key(&proof.jti)
                    .with_meta("jkt", proof.thumbprint.as_str())
                    .with_meta("htm", request.method.as_str());
                if verdict.is_bypassed() {
                    event = event
                        .with_meta("checks", proof.bypassed.join(","))
                        .with_meta("flags", verdict.flags().join(","));
                }
                self.events.record(event).await;
                Ok(CheckedProof { proof, verdict })
            }
            Err(error) => {
                let error = CoreError::from_dpop(error);
                tracing::warn!(error = %error, "DPoP proof rejected");
                let reason = match &error {
                    CoreError::ReplayDetected { .. } => "jti_replay".to_string(),
                    CoreError::Expired { .. } => "iat_window".to_string(),
                    CoreError::MalformedInput(_) => "malformed".to_string(),
                    other => other.to_string(),
                };
                self.events
                    .record(
                        SecurityEvent::new(EventType::DpopProofValidated, EventOutcome::Failure)
                            .at(self.records.clock().now())
                            .with_meta("htm", request.method.as_str())
                            .with_meta("reason", reason),
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Compare a proof key thumbprint with a token's `cnf.jkt`
    ///
    /// # Errors
    /// Returns [`CoreError::ValidationFailed`] with [`Check::DpopBinding`] on mismatch
    pub async fn verify_binding(
        &self,
        thumbprint: &str,
        cnf_jkt: &str,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        match verify_jkt_binding(thumbprint, cnf_jkt) {
            Ok(()) => {
                self.binding_event(cnf_jkt, EventOutcome::Success).await;
                Ok(Verdict::Verified)
            }
            Err(_) if policy.skip_dpop_binding_check => {
                tracing::warn!("DPoP key mismatch accepted by skip_dpop_binding_check");
                self.binding_event(cnf_jkt, EventOutcome::Bypassed).await;
                Ok(Verdict::Bypassed(vec!["skip_dpop_binding_check"]))
            }
            Err(error) => {
                tracing::warn!("DPoP proof key does not match token binding");
                self.binding_event(cnf_jkt, EventOutcome::Failure).await;
                Err(CoreError::from_dpop(error))
            }
        }
    }

    async fn binding_event(&self, cnf_jkt: &str, outcome: EventOutcome) {
        let mut event = SecurityEvent::new(EventType::DpopBindingChecked, outcome)
            .at(self.records.clock().now())
            .with_meta("jkt", cnf_jkt);
        if outcome == EventOutcome::Bypassed {
            event = event.with_meta("flag", "skip_dpop_binding_check");
        }
        self.events.record(event).await;
    }
}

/// Require a DPoP proof where a token is key-bound
///
/// Missing proofs are treated as a binding failure.
pub(crate) fn missing_proof(policy: &VulnerabilityPolicy) -> Result<Verdict> {
    if policy.skip_dpop_binding_check {
        Ok(Verdict::Bypassed(vec!["skip_dpop_binding_check"]))
    } else {
        Err(CoreError::validation(
            Check::DpopBinding,
            "token is DPoP-bound but no proof was presented",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::events::MemoryEventSink;
    use crate::store::MemoryStore;
    use oidclab_dpop::test_utils::{sign_with_header, tamper_payload};
    use oidclab_dpop::{DpopKeyPair, DpopProofGenerator};
    use serde_json::json;

    const URI: &str = "https://rs.example.com/resource";

    fn verifier() -> (DpopVerifier, ManualClock, Arc<MemoryEventSink>) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let records = RecordStore::new(
            Arc::new(MemoryStore::new(shared.clone())),
            shared,
            Duration::from_millis(250),
            chrono::Duration::seconds(60),
        );
        let sink = Arc::new(MemoryEventSink::new());
        (DpopVerifier::new(records, sink.clone(), 60), clock, sink)
    }

    fn proof(generator: &DpopProofGenerator, iat: i64, jti: &str) -> DpopProofRequest {
        let proof = generator
            .generate_at("GET", URI, None, None, iat, jti)
            .unwrap();
        DpopProofRequest::builder()
            .proof(proof.as_jwt())
            .method("GET")
            .uri(URI)
            .build()
    }

    #[tokio::test]
    async fn test_replay_rejected_through_store() {
        let (verifier, clock, sink) = verifier();
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let request = proof(&generator, clock.unix_now(), "jti-1");
        let strict = VulnerabilityPolicy::strict();

        let checked = verifier.validate_proof(&request, &strict).await.unwrap();
        assert_eq!(checked.thumbprint(), generator.key_pair().thumbprint);

        let replay = verifier.validate_proof(&request, &strict).await.unwrap_err();
        assert!(matches!(
            replay,
            CoreError::ReplayDetected {
                check: Check::DpopProof
            }
        ));
        assert_eq!(
            sink.count(EventType::DpopProofValidated, EventOutcome::Failure),
            1
        );
    }

    #[tokio::test]
    async fn test_replay_window_uses_injected_clock() {
        let (verifier, clock, _) = verifier();
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let strict = VulnerabilityPolicy::strict();
        let request = proof(&generator, clock.unix_now(), "jti-window");

        verifier.validate_proof(&request, &strict).await.unwrap();

        clock.advance_secs(30);
        assert!(verifier.validate_proof(&request, &strict).await.is_err());

        clock.advance_secs(31);
        let stale = verifier.validate_proof(&request, &strict).await.unwrap_err();
        assert!(matches!(stale, CoreError::Expired { .. }));
    }

    #[tokio::test]
    async fn test_skip_jti_replay_check_is_reported() {
        let (verifier, clock, sink) = verifier();
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let policy = VulnerabilityPolicy {
            skip_jti_replay_check: true,
            ..VulnerabilityPolicy::strict()
        };
        let request = proof(&generator, clock.unix_now(), "jti-2");

        verifier.validate_proof(&request, &policy).await.unwrap();
        let replayed = verifier.validate_proof(&request, &policy).await.unwrap();
        assert_eq!(replayed.verdict.flags(), ["skip_jti_replay_check"]);
        assert_eq!(
            sink.count(EventType::DpopProofValidated, EventOutcome::Bypassed),
            1
        );
    }

    #[tokio::test]
    async fn test_binding_check() {
        let (verifier, _, _) = verifier();
        let strict = VulnerabilityPolicy::strict();
        assert_eq!(
            verifier.verify_binding("jkt-a", "jkt-a", &strict).await.unwrap(),
            Verdict::Verified
        );

        let error = verifier
            .verify_binding("jkt-a", "jkt-b", &strict)
            .await
            .unwrap_err();
        assert_eq!(error.check(), Some(Check::DpopBinding));

        let lax = VulnerabilityPolicy {
            skip_dpop_binding_check: true,
            ..VulnerabilityPolicy::strict()
        };
        assert!(
            verifier
                .verify_binding("jkt-a", "jkt-b", &lax)
                .await
                .unwrap()
                .is_bypassed()
        );
    }

    fn relaxed(flag: &str) -> VulnerabilityPolicy {
        VulnerabilityPolicy::from_flags([(flag, true)]).unwrap()
    }

    fn request(proof: String, method: &str, access_token: Option<&str>) -> DpopProofRequest {
        DpopProofRequest {
            proof,
            method: method.to_string(),
            uri: URI.to_string(),
            access_token: access_token.map(str::to_string),
        }
    }

    /// Strict rejects `make(jti)`; `flag` alone accepts it and is reported
    async fn assert_single_flag_bypass(
        flag: &'static str,
        make: impl Fn(&str) -> DpopProofRequest,
        expect_strict: impl FnOnce(&CoreError) -> bool,
    ) {
        let (verifier, _, sink) = verifier();

        let error = verifier
            .validate_proof(&make("strict"), &VulnerabilityPolicy::strict())
            .await
            .unwrap_err();
        assert!(expect_strict(&error), "{flag}: unexpected strict error {error:?}");

        let checked = verifier
            .validate_proof(&make("relaxed"), &relaxed(flag))
            .await
            .unwrap();
        assert_eq!(checked.verdict.flags(), [flag]);
        assert_eq!(
            sink.count(EventType::DpopProofValidated, EventOutcome::Bypassed),
            1
        );
    }

    fn proof_failure(error: &CoreError) -> bool {
        error.check() == Some(Check::DpopProof) && matches!(error, CoreError::ValidationFailed { .. })
    }

    #[tokio::test]
    async fn test_skip_dpop_typ_check() {
        let key = DpopKeyPair::generate_p256().unwrap();
        let iat = ManualClock::default().unix_now();
        assert_single_flag_bypass(
            "skip_dpop_typ_check",
            |jti| {
                let jwt = sign_with_header(&key, "GET", URI, iat, jti, |header| {
                    header["typ"] = json!("JWT");
                })
                .unwrap();
                request(jwt, "GET", None)
            },
            proof_failure,
        )
        .await;
    }

    #[tokio::test]
    async fn test_skip_dpop_signature_check() {
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let iat = ManualClock::default().unix_now();
        assert_single_flag_bypass(
            "skip_dpop_signature_check",
            |jti| {
                let signed = generator.generate_at("GET", URI, None, None, iat, "signed").unwrap();
                let jwt = tamper_payload(signed.as_jwt(), |claims| {
                    claims["jti"] = json!(jti);
                })
                .unwrap();
                request(jwt, "GET", None)
            },
            proof_failure,
        )
        .await;
    }

    #[tokio::test]
    async fn test_skip_dpop_htm_check() {
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let iat = ManualClock::default().unix_now();
        assert_single_flag_bypass(
            "skip_dpop_htm_check",
            |jti| {
                let proof = generator.generate_at("POST", URI, None, None, iat, jti).unwrap();
                request(proof.as_jwt().to_string(), "GET", None)
            },
            proof_failure,
        )
        .await;
    }

    #[tokio::test]
    async fn test_skip_dpop_iat_check() {
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let stale = ManualClock::default().unix_now() - 600;
        assert_single_flag_bypass(
            "skip_dpop_iat_check",
            |jti| {
                let proof = generator.generate_at("GET", URI, None, None, stale, jti).unwrap();
                request(proof.as_jwt().to_string(), "GET", None)
            },
            |error| matches!(error, CoreError::Expired { .. }),
        )
        .await;
    }

    #[tokio::test]
    async fn test_skip_dpop_ath_check() {
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let iat = ManualClock::default().unix_now();
        assert_single_flag_bypass(
            "skip_dpop_ath_check",
            |jti| {
                let proof = generator
                    .generate_at("GET", URI, Some("some-other-token"), None, iat, jti)
                    .unwrap();
                request(proof.as_jwt().to_string(), "GET", Some("access-token"))
            },
            proof_failure,
        )
        .await;
    }

    /// Skipping the signature does not relax the claims it would have protected
    #[tokio::test]
    async fn test_unsigned_claims_still_checked() {
        let (verifier, clock, _) = verifier();
        let generator = DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap());
        let policy = relaxed("skip_dpop_signature_check");
        let signed = generator
            .generate_at("GET", URI, None, None, clock.unix_now(), "original")
            .unwrap();

        let retargeted = tamper_payload(signed.as_jwt(), |claims| {
            claims["htu"] = json!("https://evil.example.com/resource");
            claims["jti"] = json!("retargeted");
        })
        .unwrap();
        let error = verifier
            .validate_proof(&request(retargeted, "GET", None), &policy)
            .await
            .unwrap_err();
        assert!(proof_failure(&error));

        let backdated = tamper_payload(signed.as_jwt(), |claims| {
            claims["iat"] = json!(clock.unix_now() - 3600);
            claims["jti"] = json!("backdated");
        })
        .unwrap();
        let error = verifier
            .validate_proof(&request(backdated, "GET", None), &policy)
            .await
            .unwrap_err();
        assert!(matches!(error, CoreError::Expired { .. }));
    }
}
