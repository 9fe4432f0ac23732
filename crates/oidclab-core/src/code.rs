//! Authorization codes
//!
//! A code is stored once and consumed atomically on redemption. Every check
//! after the consume runs against a code that is already gone, so a failed
//! exchange never reopens a replay window. Unknown and already-used codes are
//! indistinguishable to the caller.

use std::sync::Arc;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, fingerprint};
use crate::error::{Check, CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent};
use crate::pkce::{self, ChallengeMethod};
use crate::policy::{Verdict, VulnerabilityPolicy};
use crate::random::SecureRandom;
use crate::store::{Lookup, Namespace, RecordStore};

/// Upper bound on code lifetime
pub const MAX_CODE_TTL_SECS: i64 = 60;

/// Authorization request as approved by the (external) consent step
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct AuthorizationRequest {
    /// Requesting client
    pub client_id: String,
    /// Redirect URI the code will be delivered to
    pub redirect_uri: String,
    /// PKCE `code_challenge`
    pub code_challenge: Option<String>,
    /// PKCE `code_challenge_method`; S256 when a challenge is given without one
    pub code_challenge_method: Option<ChallengeMethod>,
    /// Granted scope, space separated
    pub scope: String,
    /// Authenticated end user
    pub subject_id: String,
    /// RFC 9449 `dpop_jkt` authorization request parameter
    pub dpop_jkt: Option<String>,
    /// OIDC `nonce`, echoed into the ID token
    pub nonce: Option<String>,
}

/// Stored authorization code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// Fingerprint of the code value; the value itself is the store key
    pub code_id: String,
    /// Client the code was issued to
    pub client_id: String,
    /// Redirect URI bound at issuance
    pub redirect_uri: String,
    /// PKCE challenge, absent only under `disable_pkce`
    pub code_challenge: Option<String>,
    /// PKCE method
    pub code_challenge_method: Option<ChallengeMethod>,
    /// Granted scope
    pub scope: String,
    /// End user
    pub subject_id: String,
    /// Required DPoP key thumbprint at redemption
    pub dpop_jkt: Option<String>,
    /// OIDC nonce
    pub nonce: Option<String>,
    /// Issue time (Unix seconds)
    pub issued_at: i64,
    /// Expiry (Unix seconds)
    pub expires_at: i64,
    /// Set on the copy returned by a successful redemption
    #[serde(default)]
    pub consumed: bool,
}

/// Token request parameters relevant to the code
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct CodeRedemption {
    /// The code presented
    pub code: String,
    /// Authenticated client
    pub client_id: String,
    /// `redirect_uri` parameter of the token request
    pub redirect_uri: String,
    /// PKCE `code_verifier`
    pub code_verifier: Option<String>,
    /// Thumbprint of the validated DPoP proof key, if a proof was sent
    pub dpop_thumbprint: Option<String>,
}

/// A successfully redeemed code
#[derive(Debug, Clone)]
pub struct RedeemedCode {
    /// The consumed record
    pub code: AuthorizationCode,
    /// Checks relaxed along the way
    pub verdict: Verdict,
}

/// Issues and redeems authorization codes
#[derive(Debug, Clone)]
pub struct AuthorizationCodeIssuer {
    records: RecordStore,
    events: Arc<dyn EventSink>,
    ttl: chrono::Duration,
}

impl AuthorizationCodeIssuer {
    /// Create an issuer; `ttl` is capped at [`MAX_CODE_TTL_SECS`]
    pub fn new(records: RecordStore, events: Arc<dyn EventSink>, ttl: chrono::Duration) -> Self {
        Self {
            records,
            events,
            ttl: ttl.min(chrono::Duration::seconds(MAX_CODE_TTL_SECS)),
        }
    }

    /// Issue a code for an approved authorization request
    ///
    /// # Errors
    /// - [`CoreError::MalformedInput`] for missing fields or a malformed challenge
    /// - [`CoreError::ValidationFailed`] for a missing challenge or `plain`
    ///   method the policy does not allow
    /// - [`CoreError::Store`] if the code cannot be stored
    pub async fn issue(
        &self,
        request: &AuthorizationRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<(String, Verdict)> {
        if request.client_id.is_empty() || request.subject_id.is_empty() {
            return Err(CoreError::MalformedInput(
                "client_id and subject_id are required".to_string(),
            ));
        }
        url::Url::parse(&request.redirect_uri)
            .map_err(|_| CoreError::MalformedInput("redirect_uri is not a valid URI".to_string()))?;

        let mut bypassed = Vec::new();
        let method = match request.code_challenge.as_deref() {
            Some(challenge) => {
                let method = request.code_challenge_method.unwrap_or(ChallengeMethod::S256);
                pkce::validate_challenge_format(challenge, method)?;
                if method == ChallengeMethod::Plain && !policy.allow_plain_pkce {
                    return Err(self
                        .reject_issue(request, "plain_pkce", CoreError::validation(
                            Check::Pkce,
                            "plain code_challenge_method is not permitted",
                        ))
                        .await);
                }
                if method == ChallengeMethod::Plain {
                    bypassed.push("allow_plain_pkce");
                }
                Some(method)
            }
            None if policy.disable_pkce => {
                bypassed.push("disable_pkce");
                None
            }
            None => {
                return Err(self
                    .reject_issue(request, "pkce_missing", CoreError::validation(
                        Check::Pkce,
                        "code_challenge is required",
                    ))
                    .await);
            }
        };

        let code = SecureRandom::code();
        let now = self.records.clock().unix_now();
        let record = AuthorizationCode {
            code_id: fingerprint(&code),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: method,
            scope: request.scope.clone(),
            subject_id: request.subject_id.clone(),
            dpop_jkt: request.dpop_jkt.clone(),
            nonce: request.nonce.clone(),
            issued_at: now,
            expires_at: now + self.ttl.num_seconds(),
            consumed: false,
        };

        self.records
            .put_until(Namespace::Code, &code, &record, record.expires_at)
            .await?;

        let verdict = Verdict::from_bypassed(bypassed);
        let outcome = if verdict.is_bypassed() {
            EventOutcome::Bypassed
        } else {
            EventOutcome::Success
        };
        let mut event = SecurityEvent::new(EventType::CodeIssued, outcome)
            .at(self.records.clock().now())
            .with_key(&code)
            .with_meta("client_id", request.client_id.as_str());
        if verdict.is_bypassed() {
            event = event.with_meta("flags", verdict.flags().join(","));
        }
        self.events.record(event).await;

        tracing::debug!(code = %record.code_id, client_id = %record.client_id, "Issued authorization code");
        Ok((code, verdict))
    }

    /// Redeem a code at the token endpoint
    ///
    /// # Errors
    /// - [`CoreError::NotFound`] if the code is unknown, used or expired
    /// - [`CoreError::ValidationFailed`] for a client, redirect URI, PKCE or
    ///   DPoP key mismatch; the code stays consumed
    /// - [`CoreError::MalformedInput`] for a malformed verifier
    /// - [`CoreError::Store`] on store failure
    pub async fn redeem(
        &self,
        redemption: &CodeRedemption,
        policy: &VulnerabilityPolicy,
    ) -> Result<RedeemedCode> {
        if redemption.code.is_empty() {
            return Err(CoreError::MalformedInput("code is required".to_string()));
        }

        let lookup: Lookup<AuthorizationCode> = if policy.allow_code_reuse {
            self.records.peek(Namespace::Code, &redemption.code).await?
        } else {
            self.records.consume(Namespace::Code, &redemption.code).await?
        };

        let mut record = match lookup {
            Lookup::Live(record) => record,
            Lookup::Expired => {
                self.redeem_event(redemption, EventOutcome::Failure, "code_expired")
                    .await;
                return Err(CoreError::NotFound);
            }
            Lookup::Missing => {
                self.redeem_event(redemption, EventOutcome::Failure, "code_missing")
                    .await;
                return Err(CoreError::NotFound);
            }
        };

        let mut bypassed = Vec::new();
        if policy.allow_code_reuse {
            bypassed.push("allow_code_reuse");
        }

        if !constant_time_eq(&record.client_id, &redemption.client_id) {
            self.redeem_event(redemption, EventOutcome::Failure, "client_mismatch")
                .await;
            return Err(CoreError::validation(
                Check::Client,
                "client_id does not match the code",
            ));
        }

        if redemption.redirect_uri != record.redirect_uri {
            if policy.lax_redirect_uri_match
                && redemption.redirect_uri.starts_with(&record.redirect_uri)
            {
                bypassed.push("lax_redirect_uri_match");
            } else {
                self.redeem_event(redemption, EventOutcome::Failure, "redirect_uri_mismatch")
                    .await;
                return Err(CoreError::validation(
                    Check::RedirectUri,
                    "redirect_uri does not match the code",
                ));
            }
        }

        match (&record.code_challenge, &record.code_challenge_method) {
            (Some(challenge), method) => {
                let method = method.unwrap_or(ChallengeMethod::S256);
                let result = match redemption.code_verifier.as_deref() {
                    Some(verifier) => pkce::verify(verifier, challenge, method, policy),
                    None => Err(CoreError::validation(Check::Pkce, "code_verifier is required")),
                };
                if let Err(error) = result {
                    self.pkce_event(redemption, EventOutcome::Failure).await;
                    if policy.retry_code_on_pkce_failure && !policy.allow_code_reuse {
                        self.records
                            .put_until(Namespace::Code, &redemption.code, &record, record.expires_at)
                            .await?;
                        tracing::warn!(
                            code = %record.code_id,
                            "Code restored after failed PKCE check by retry_code_on_pkce_failure"
                        );
                    }
                    self.redeem_event(redemption, EventOutcome::Failure, "pkce_failed")
                        .await;
                    return Err(error);
                }
                if method == ChallengeMethod::Plain {
                    bypassed.push("allow_plain_pkce");
                }
                self.pkce_event(redemption, EventOutcome::Success).await;
            }
            (None, _) if policy.disable_pkce => bypassed.push("disable_pkce"),
            (None, _) => {
                self.redeem_event(redemption, EventOutcome::Failure, "pkce_missing")
                    .await;
                return Err(CoreError::validation(
                    Check::Pkce,
                    "code was issued without a challenge",
                ));
            }
        }

        if let Some(expected_jkt) = record.dpop_jkt.as_deref() {
            let bound = redemption
                .dpop_thumbprint
                .as_deref()
                .is_some_and(|thumbprint| constant_time_eq(thumbprint, expected_jkt));
            if !bound {
                if policy.skip_dpop_binding_check {
                    bypassed.push("skip_dpop_binding_check");
                } else {
                    self.redeem_event(redemption, EventOutcome::Failure, "dpop_jkt_mismatch")
                        .await;
                    return Err(CoreError::validation(
                        Check::DpopBinding,
                        "DPoP key does not match dpop_jkt",
                    ));
                }
            }
        }

        let verdict = Verdict::from_bypassed(bypassed);
        let outcome = if verdict.is_bypassed() {
            EventOutcome::Bypassed
        } else {
            EventOutcome::Success
        };
        self.redeem_event(redemption, outcome, "redeemed").await;

        record.consumed = !policy.allow_code_reuse;
        Ok(RedeemedCode {
            code: record,
            verdict,
        })
    }

    async fn reject_issue(
        &self,
        request: &AuthorizationRequest,
        reason: &str,
        error: CoreError,
    ) -> CoreError {
        tracing::warn!(client_id = %request.client_id, reason, "Authorization code not issued");
        self.events
            .record(
                SecurityEvent::new(EventType::CodeIssued, EventOutcome::Failure)
                    .at(self.records.clock().now())
                    .with_meta("client_id", request.client_id.as_str())
                    .with_meta("reason", reason),
            )
            .await;
        error
    }

    async fn redeem_event(&self, redemption: &CodeRedemption, outcome: EventOutcome, reason: &str) {
        if outcome == EventOutcome::Failure {
            tracing::warn!(
                code = %fingerprint(&redemption.code),
                client_id = %redemption.client_id,
                reason,
                "Authorization code redemption failed"
            );
        }
        self.events
            .record(
                SecurityEvent::new(EventType::CodeRedeemed, outcome)
                    .at(self.records.clock().now())
                    .with_key(&redemption.code)
                    .with_meta("client_id", redemption.client_id.as_str())
                    .with_meta("reason", reason),
            )
            .await;
    }

    async fn pkce_event(&self, redemption: &CodeRedemption, outcome: EventOutcome) {
        self.events
            .record(
                SecurityEvent::new(EventType::PkceVerified, outcome)
                    .at(self.records.clock().now())
                    .with_key(&redemption.code),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::events::MemoryEventSink;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
    const REDIRECT: &str = "https://client.example.com/cb";

    fn issuer() -> (AuthorizationCodeIssuer, ManualClock, Arc<MemoryEventSink>) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let records = RecordStore::new(
            Arc::new(MemoryStore::new(shared.clone())),
            shared,
            Duration::from_millis(250),
            chrono::Duration::seconds(60),
        );
        let sink = Arc::new(MemoryEventSink::new());
        let issuer =
            AuthorizationCodeIssuer::new(records, sink.clone(), chrono::Duration::seconds(30));
        (issuer, clock, sink)
    }

    fn request() -> AuthorizationRequest {
        AuthorizationRequest::builder()
            .client_id("client-1")
            .redirect_uri(REDIRECT)
            .code_challenge(CHALLENGE.to_string())
            .scope("openid profile")
            .subject_id("alice")
            .build()
    }

    fn redemption(code: &str, verifier: &str) -> CodeRedemption {
        CodeRedemption::builder()
            .code(code)
            .client_id("client-1")
            .redirect_uri(REDIRECT)
            .code_verifier(verifier.to_string())
            .build()
    }

    #[tokio::test]
    async fn test_issue_and_redeem() {
        let (issuer, _, _) = issuer();
        let strict = VulnerabilityPolicy::strict();
        let (code, verdict) = issuer.issue(&request(), &strict).await.unwrap();
        assert_eq!(verdict, Verdict::Verified);

        let redeemed = issuer.redeem(&redemption(&code, VERIFIER), &strict).await.unwrap();
        assert_eq!(redeemed.code.subject_id, "alice");
        assert!(redeemed.code.consumed);

        let second = issuer.redeem(&redemption(&code, VERIFIER), &strict).await;
        assert!(matches!(second, Err(CoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_failed_pkce_burns_code() {
        let (issuer, _, _) = issuer();
        let strict = VulnerabilityPolicy::strict();
        let (code, _) = issuer.issue(&request(), &strict).await.unwrap();

        let wrong = "w".repeat(43);
        let first = issuer.redeem(&redemption(&code, &wrong), &strict).await;
        assert!(matches!(
            first,
            Err(CoreError::ValidationFailed { check: Check::Pkce, .. })
        ));

        let retry = issuer.redeem(&redemption(&code, VERIFIER), &strict).await;
        assert!(matches!(retry, Err(CoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_retry_on_pkce_failure_flag() {
        let (issuer, _, sink) = issuer();
        let policy = VulnerabilityPolicy {
            retry_code_on_pkce_failure: true,
            ..VulnerabilityPolicy::strict()
        };
        let (code, _) = issuer.issue(&request(), &policy).await.unwrap();

        assert!(issuer.redeem(&redemption(&code, &"w".repeat(43)), &policy).await.is_err());
        assert!(issuer.redeem(&redemption(&code, VERIFIER), &policy).await.is_ok());
        assert_eq!(sink.count(EventType::PkceVerified, EventOutcome::Failure), 1);
    }

    #[tokio::test]
    async fn test_missing_challenge_requires_flag() {
        let (issuer, _, _) = issuer();
        let mut request = request();
        request.code_challenge = None;

        let strict = issuer.issue(&request, &VulnerabilityPolicy::strict()).await;
        assert!(matches!(
            strict,
            Err(CoreError::ValidationFailed { check: Check::Pkce, .. })
        ));

        let lax = VulnerabilityPolicy {
            disable_pkce: true,
            ..VulnerabilityPolicy::strict()
        };
        let (code, verdict) = issuer.issue(&request, &lax).await.unwrap();
        assert_eq!(verdict.flags(), ["disable_pkce"]);

        let redeemed = issuer
            .redeem(
                &CodeRedemption::builder()
                    .code(code)
                    .client_id("client-1")
                    .redirect_uri(REDIRECT)
                    .build(),
                &lax,
            )
            .await
            .unwrap();
        assert_eq!(redeemed.verdict.flags(), ["disable_pkce"]);
    }

    #[tokio::test]
    async fn test_redirect_uri_prefix_match_only_when_lax() {
        let (issuer, _, _) = issuer();
        let strict = VulnerabilityPolicy::strict();
        let attacker = format!("{REDIRECT}/../../attacker");

        let (code, _) = issuer.issue(&request(), &strict).await.unwrap();
        let mut bad = redemption(&code, VERIFIER);
        bad.redirect_uri = attacker.clone();
        assert!(matches!(
            issuer.redeem(&bad, &strict).await,
            Err(CoreError::ValidationFailed { check: Check::RedirectUri, .. })
        ));

        let lax = VulnerabilityPolicy {
            lax_redirect_uri_match: true,
            ..VulnerabilityPolicy::strict()
        };
        let (code, _) = issuer.issue(&request(), &lax).await.unwrap();
        let mut bad = redemption(&code, VERIFIER);
        bad.redirect_uri = attacker;
        let redeemed = issuer.redeem(&bad, &lax).await.unwrap();
        assert_eq!(redeemed.verdict.flags(), ["lax_redirect_uri_match"]);
    }

    #[tokio::test]
    async fn test_client_id_always_exact() {
        let (issuer, _, _) = issuer();
        let lax = VulnerabilityPolicy::from_flags(
            VulnerabilityPolicy::FLAGS.iter().map(|name| (*name, true)),
        )
        .unwrap();
        let (code, _) = issuer.issue(&request(), &lax).await.unwrap();

        let mut other = redemption(&code, VERIFIER);
        other.client_id = "client-1-evil".to_string();
        assert!(matches!(
            issuer.redeem(&other, &lax).await,
            Err(CoreError::ValidationFailed { check: Check::Client, .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_code_is_not_found() {
        let (issuer, clock, sink) = issuer();
        let strict = VulnerabilityPolicy::strict();
        let (code, _) = issuer.issue(&request(), &strict).await.unwrap();

        clock.advance_secs(31);
        assert!(matches!(
            issuer.redeem(&redemption(&code, VERIFIER), &strict).await,
            Err(CoreError::NotFound)
        ));
        let reasons: Vec<_> = sink
            .of_type(EventType::CodeRedeemed)
            .into_iter()
            .filter_map(|event| event.metadata.get("reason").cloned())
            .collect();
        assert_eq!(reasons, vec!["code_expired"]);
    }

    #[tokio::test]
    async fn test_ttl_is_capped() {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let records = RecordStore::new(
            Arc::new(MemoryStore::new(shared.clone())),
            shared,
            Duration::from_millis(250),
            chrono::Duration::seconds(60),
        );
        let issuer = AuthorizationCodeIssuer::new(
            records,
            Arc::new(MemoryEventSink::new()),
            chrono::Duration::seconds(3600),
        );
        let strict = VulnerabilityPolicy::strict();
        let (code, _) = issuer.issue(&request(), &strict).await.unwrap();

        clock.advance_secs(61);
        assert!(issuer.redeem(&redemption(&code, VERIFIER), &strict).await.is_err());
    }

    #[tokio::test]
    async fn test_dpop_jkt_binding() {
        let (issuer, _, _) = issuer();
        let strict = VulnerabilityPolicy::strict();
        let mut bound = request();
        bound.dpop_jkt = Some("expected-thumbprint".to_string());

        let (code, _) = issuer.issue(&bound, &strict).await.unwrap();
        let mut wrong_key = redemption(&code, VERIFIER);
        wrong_key.dpop_thumbprint = Some("other-thumbprint".to_string());
        assert!(matches!(
            issuer.redeem(&wrong_key, &strict).await,
            Err(CoreError::ValidationFailed { check: Check::DpopBinding, .. })
        ));

        let (code, _) = issuer.issue(&bound, &strict).await.unwrap();
        let mut right_key = redemption(&code, VERIFIER);
        right_key.dpop_thumbprint = Some("expected-thumbprint".to_string());
        assert!(issuer.redeem(&right_key, &strict).await.is_ok());
    }

    #[tokio::test]
    async fn test_events_hold_fingerprints_only() {
        let (issuer, _, sink) = issuer();
        let strict = VulnerabilityPolicy::strict();
        let (code, _) = issuer.issue(&request(), &strict).await.unwrap();
        issuer.redeem(&redemption(&code, VERIFIER), &strict).await.unwrap();

        let serialized = serde_json::to_string(&sink.events()).unwrap();
        assert!(!serialized.contains(&code));
        assert!(!serialized.contains(VERIFIER));
    }
}
