//! Refresh token families
//!
//! Each family has exactly one current refresh token. Rotation replaces it;
//! presenting any other token of the family is treated as theft and revokes
//! the family together with every access token issued from it. A revoked
//! family stays revoked until it expires.
//!
//! Families are checked out of the store with an atomic consume and written
//! back when the operation finishes, so concurrent refreshes of one family
//! are serialized by the store rather than by a lock.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{constant_time_eq, sha256_hex};
use crate::error::{Check, CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent};
use crate::policy::{Verdict, VulnerabilityPolicy};
use crate::random::SecureRandom;
use crate::store::{Lookup, Namespace, RecordStore};
use crate::tokens::{
    ClientType, Confirmation, Grant, IssuedTokens, TokenIssueRequest, TokenIssuer, scope_is_subset,
};

/// Attempts to check out a family held by a concurrent request
const CHECKOUT_ATTEMPTS: u32 = 20;

/// Pause between checkout attempts
const CHECKOUT_BACKOFF: Duration = Duration::from_millis(5);

/// Stored family state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenFamily {
    /// Family identifier
    pub family_id: String,
    /// SHA-256 (hex) of the current refresh token
    pub current_token_hash: String,
    /// End user
    pub subject_id: String,
    /// Client
    pub client_id: String,
    /// Client type
    pub client_type: ClientType,
    /// Scope of the original grant
    pub scope: String,
    /// Rotations so far
    pub generation_counter: u64,
    /// Sender constraint carried to every rotated token
    pub cnf: Option<Confirmation>,
    /// Terminal state
    pub revoked: bool,
    /// Access tokens issued from the family and not yet expired
    pub access_tokens: Vec<FamilyAccessToken>,
    /// Absolute family expiry (Unix seconds)
    pub expires_at: i64,
}

/// An access token issued from a family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyAccessToken {
    /// `jti`
    pub token_id: String,
    /// `exp`
    pub expires_at: i64,
}

impl RefreshTokenFamily {
    fn access_token_ids(&self) -> Vec<String> {
        self.access_tokens
            .iter()
            .map(|token| token.token_id.clone())
            .collect()
    }

    fn grant(&self, scope: &str) -> Grant {
        Grant {
            subject_id: self.subject_id.clone(),
            client_id: self.client_id.clone(),
            client_type: self.client_type,
            scope: scope.to_string(),
        }
    }
}

/// Index entry from a refresh token hash to its family
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshIndex {
    family_id: String,
    generation: u64,
}

/// Refresh token grant request
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct RefreshRequest {
    /// Presented refresh token
    pub refresh_token: String,
    /// Authenticated client
    pub client_id: String,
    /// Requested scope; defaults to the original grant
    pub scope: Option<String>,
    /// Thumbprint of the validated DPoP proof key
    pub dpop_thumbprint: Option<String>,
    /// Thumbprint of the client certificate on this connection
    pub mtls_thumbprint: Option<String>,
}

/// Rotates refresh tokens and revokes families on replay
#[derive(Debug, Clone)]
pub struct RefreshRotationManager {
    records: RecordStore,
    tokens: TokenIssuer,
    events: Arc<dyn EventSink>,
}

impl RefreshRotationManager {
    /// Create a manager issuing access tokens through `tokens`
    pub fn new(records: RecordStore, tokens: TokenIssuer, events: Arc<dyn EventSink>) -> Self {
        Self {
            records,
            tokens,
            events,
        }
    }

    /// Issue access, refresh and (for `openid`) ID tokens, starting a family
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedInput`] for a conflicting binding and
    /// [`CoreError::Store`] on store failure
    pub async fn issue_tokens(&self, request: &TokenIssueRequest) -> Result<IssuedTokens> {
        if !request.issue_refresh_token {
            return self.tokens.issue(request).await;
        }

        let grant = request.grant();
        let cnf = request.confirmation()?;
        let family_id = Uuid::new_v4().to_string();
        let access = self
            .tokens
            .issue_access_token(&grant, cnf.as_ref(), Some(&family_id))
            .await?;

        let refresh_token = SecureRandom::refresh_token();
        let now = self.records.clock().unix_now();
        let family = RefreshTokenFamily {
            family_id: family_id.clone(),
            current_token_hash: sha256_hex(&refresh_token),
            subject_id: grant.subject_id.clone(),
            client_id: grant.client_id.clone(),
            client_type: grant.client_type,
            scope: grant.scope.clone(),
            generation_counter: 0,
            cnf: cnf.clone(),
            revoked: false,
            access_tokens: vec![FamilyAccessToken {
                token_id: access.claims.jti.clone(),
                expires_at: access.claims.exp,
            }],
            expires_at: now + self.tokens.lifetimes().refresh.num_seconds(),
        };
        self.index(&family, &refresh_token).await?;
        self.put_back(&family).await?;

        tracing::debug!(family_id = %family_id, client_id = %grant.client_id, "Started refresh family");
        self.tokens
            .finish(
                &grant,
                cnf.as_ref(),
                request.nonce.as_deref(),
                access,
                Some(refresh_token),
                Some(family_id),
                Verdict::Verified,
            )
            .await
    }

    /// Exchange a refresh token
    ///
    /// # Errors
    /// - [`CoreError::NotFound`] for an unknown or expired token
    /// - [`CoreError::ReplayDetected`] for a rotated-out token; the family is
    ///   revoked
    /// - [`CoreError::ValidationFailed`] for a revoked family, client mismatch,
    ///   broader scope or a failed sender-constraint check
    pub async fn refresh(
        &self,
        request: &RefreshRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<IssuedTokens> {
        let presented_hash = sha256_hex(&request.refresh_token);
        let mut family = self.checkout(&presented_hash).await?;

        // Changes are committed only once the new tokens exist; any failure
        // puts the family back as it was checked out.
        let mut rotated = family.clone();
        let outcome = self.rotate(&mut rotated, &presented_hash, request, policy).await;
        if outcome.is_ok() {
            family = rotated;
        }
        self.put_back(&family).await?;

        match outcome {
            Ok(Rotation::Issued(tokens)) => Ok(tokens),
            Ok(Rotation::Revoked) => {
                let revoked = self.tokens.revoke_access_tokens(&family.access_token_ids()).await?;
                tracing::warn!(
                    family_id = %family.family_id,
                    access_tokens_revoked = revoked,
                    "Refresh token replay; family revoked"
                );
                self.events
                    .record(
                        SecurityEvent::new(EventType::FamilyRevoked, EventOutcome::Revoked)
                            .at(self.records.clock().now())
                            .with_meta("family_id", family.family_id.as_str())
                            .with_meta("reason", "refresh_replay")
                            .with_meta("access_tokens", revoked.to_string()),
                    )
                    .await;
                Err(CoreError::ReplayDetected {
                    check: Check::RefreshToken,
                })
            }
            Err(error) => {
                self.refresh_event(&request.refresh_token, &family, EventOutcome::Failure, Some(&error))
                    .await;
                Err(error)
            }
        }
    }

    async fn rotate(
        &self,
        family: &mut RefreshTokenFamily,
        presented_hash: &str,
        request: &RefreshRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<Rotation> {
        if family.revoked {
            return Err(CoreError::validation(
                Check::RefreshToken,
                "refresh token family is revoked",
            ));
        }
        if !constant_time_eq(&family.client_id, &request.client_id) {
            return Err(CoreError::validation(
                Check::Client,
                "client_id does not match the refresh token",
            ));
        }

        let mut bypassed = Vec::new();
        if !constant_time_eq(&family.current_token_hash, presented_hash) {
            self.events
                .record(
                    SecurityEvent::new(EventType::RefreshReplay, EventOutcome::Failure)
                        .at(self.records.clock().now())
                        .with_key(&request.refresh_token)
                        .with_meta("family_id", family.family_id.as_str()),
                )
                .await;
            if !policy.skip_refresh_replay_detection {
                family.revoked = true;
                return Ok(Rotation::Revoked);
            }
            tracing::warn!(
                family_id = %family.family_id,
                "Rotated-out refresh token accepted by skip_refresh_replay_detection"
            );
            bypassed.push("skip_refresh_replay_detection");
        }

        let scope = match request.scope.as_deref() {
            Some(requested) if !scope_is_subset(requested, &family.scope) => {
                return Err(CoreError::validation(
                    Check::Scope,
                    "requested scope exceeds the original grant",
                ));
            }
            Some(requested) if !requested.trim().is_empty() => requested.to_string(),
            _ => family.scope.clone(),
        };

        match &family.cnf {
            Some(Confirmation::Jkt(expected)) => {
                let bound = request
                    .dpop_thumbprint
                    .as_deref()
                    .is_some_and(|thumbprint| constant_time_eq(thumbprint, expected));
                if !bound {
                    if !policy.skip_dpop_binding_check {
                        return Err(CoreError::validation(
                            Check::DpopBinding,
                            "refresh token is bound to a different DPoP key",
                        ));
                    }
                    bypassed.push("skip_dpop_binding_check");
                }
            }
            Some(Confirmation::X5tS256(expected)) => {
                let bound = request
                    .mtls_thumbprint
                    .as_deref()
                    .is_some_and(|thumbprint| constant_time_eq(thumbprint, expected));
                if !bound {
                    if !policy.skip_mtls_binding_check {
                        return Err(CoreError::validation(
                            Check::Mtls,
                            "refresh token is bound to a different certificate",
                        ));
                    }
                    bypassed.push("skip_mtls_binding_check");
                }
            }
            None => {}
        }

        let grant = family.grant(&scope);
        let access = self
            .tokens
            .issue_access_token(&grant, family.cnf.as_ref(), Some(&family.family_id))
            .await?;

        let refresh_token = if policy.disable_refresh_rotation {
            bypassed.push("disable_refresh_rotation");
            request.refresh_token.clone()
        } else {
            let next = SecureRandom::refresh_token();
            family.generation_counter += 1;
            family.current_token_hash = sha256_hex(&next);
            self.index(family, &next).await?;
            next
        };

        Self::prune_access_tokens(family, self.records.clock().unix_now());
        family.access_tokens.push(FamilyAccessToken {
            token_id: access.claims.jti.clone(),
            expires_at: access.claims.exp,
        });

        let verdict = Verdict::from_bypassed(bypassed);
        let outcome = if verdict.is_bypassed() {
            EventOutcome::Bypassed
        } else {
            EventOutcome::Success
        };

        let tokens = self
            .tokens
            .finish(
                &grant,
                family.cnf.as_ref(),
                None,
                access,
                Some(refresh_token),
                Some(family.family_id.clone()),
                verdict,
            )
            .await?;
        self.refresh_event(&request.refresh_token, family, outcome, None)
            .await;
        Ok(Rotation::Issued(tokens))
    }

    /// Revoke the family a refresh token belongs to (RFC 7009)
    ///
    /// Returns `false` for an unknown token.
    ///
    /// # Errors
    /// Returns [`CoreError::ValidationFailed`] if the token belongs to another
    /// client and [`CoreError::Store`] on store failure
    pub async fn revoke_refresh_token(&self, refresh_token: &str, client_id: &str) -> Result<bool> {
        let hash = sha256_hex(refresh_token);
        let mut family = match self.checkout(&hash).await {
            Ok(family) => family,
            Err(CoreError::NotFound) => return Ok(false),
            Err(error) => return Err(error),
        };

        if !constant_time_eq(&family.client_id, client_id) {
            self.put_back(&family).await?;
            return Err(CoreError::validation(
                Check::Client,
                "refresh token belongs to another client",
            ));
        }

        self.revoke_checked_out(&mut family, "client_revocation").await?;
        Ok(true)
    }

    /// Revoke a family by identifier; returns `false` if it does not exist
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] on store failure
    pub async fn revoke_family(&self, family_id: &str) -> Result<bool> {
        let mut family = match self.checkout_family(family_id).await {
            Ok(family) => family,
            Err(CoreError::NotFound) => return Ok(false),
            Err(error) => return Err(error),
        };
        self.revoke_checked_out(&mut family, "administrative").await?;
        Ok(true)
    }

    /// Current state of a family
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] on store failure
    pub async fn family(&self, family_id: &str) -> Result<Option<RefreshTokenFamily>> {
        let lookup: Lookup<RefreshTokenFamily> =
            self.records.peek(Namespace::RefreshFamily, family_id).await?;
        Ok(lookup.live())
    }

    async fn revoke_checked_out(&self, family: &mut RefreshTokenFamily, reason: &str) -> Result<()> {
        family.revoked = true;
        let put = self.put_back(family).await;
        let revoked = self.tokens.revoke_access_tokens(&family.access_token_ids()).await?;
        put?;

        tracing::info!(family_id = %family.family_id, reason, "Refresh family revoked");
        self.events
            .record(
                SecurityEvent::new(EventType::FamilyRevoked, EventOutcome::Revoked)
                    .at(self.records.clock().now())
                    .with_meta("family_id", family.family_id.as_str())
                    .with_meta("reason", reason)
                    .with_meta("access_tokens", revoked.to_string()),
            )
            .await;
        Ok(())
    }

    async fn checkout(&self, token_hash: &str) -> Result<RefreshTokenFamily> {
        let index: Lookup<RefreshIndex> = self.records.peek(Namespace::RefreshToken, token_hash).await?;
        let Some(index) = index.live() else {
            tracing::warn!("Unknown or expired refresh token");
            return Err(CoreError::NotFound);
        };
        tracing::debug!(family_id = %index.family_id, generation = index.generation, "Refresh token resolved");
        self.checkout_family(&index.family_id).await
    }

    async fn checkout_family(&self, family_id: &str) -> Result<RefreshTokenFamily> {
        for _ in 0..CHECKOUT_ATTEMPTS {
            let lookup: Lookup<RefreshTokenFamily> =
                self.records.consume(Namespace::RefreshFamily, family_id).await?;
            match lookup {
                Lookup::Live(family) => return Ok(family),
                Lookup::Expired => return Err(CoreError::NotFound),
                Lookup::Missing => tokio::time::sleep(CHECKOUT_BACKOFF).await,
            }
        }
        tracing::warn!(family_id, "Refresh family unavailable");
        Err(CoreError::NotFound)
    }

    async fn put_back(&self, family: &RefreshTokenFamily) -> Result<()> {
        self.records
            .put_until(Namespace::RefreshFamily, &family.family_id, family, family.expires_at)
            .await?;
        Ok(())
    }

    async fn index(&self, family: &RefreshTokenFamily, refresh_token: &str) -> Result<()> {
        let index = RefreshIndex {
            family_id: family.family_id.clone(),
            generation: family.generation_counter,
        };
        self.records
            .put_until(
                Namespace::RefreshToken,
                &sha256_hex(refresh_token),
                &index,
                family.expires_at,
            )
            .await?;
        Ok(())
    }

    fn prune_access_tokens(family: &mut RefreshTokenFamily, now: i64) {
        family.access_tokens.retain(|token| token.expires_at > now);
    }

    async fn refresh_event(
        &self,
        refresh_token: &str,
        family: &RefreshTokenFamily,
        outcome: EventOutcome,
        error: Option<&CoreError>,
    ) {
        let mut event = SecurityEvent::new(EventType::TokensRefreshed, outcome)
            .at(self.records.clock().now())
            .with_key(refresh_token)
            .with_meta("family_id", family.family_id.as_str())
            .with_meta("generation", family.generation_counter.to_string());
        if let Some(error) = error {
            event = event.with_meta(
                "check",
                error.check().map_or("none", |check| check.as_str()),
            );
        }
        self.events.record(event).await;
    }
}

enum Rotation {
    Issued(IssuedTokens),
    Revoked,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::events::MemoryEventSink;
    use crate::store::MemoryStore;
    use crate::tokens::{TokenLifetimes, TokenSigner};

    fn manager() -> (RefreshRotationManager, ManualClock, Arc<MemoryEventSink>) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let records = RecordStore::new(
            Arc::new(MemoryStore::new(shared.clone())),
            shared,
            Duration::from_millis(250),
            chrono::Duration::seconds(60),
        );
        let sink = Arc::new(MemoryEventSink::new());
        let tokens = TokenIssuer::new(
            Arc::new(TokenSigner::es256().unwrap()),
            records.clone(),
            sink.clone(),
            "https://as.example.com",
            TokenLifetimes::default(),
        );
        (
            RefreshRotationManager::new(records, tokens, sink.clone()),
            clock,
            sink,
        )
    }

    fn issue_request() -> TokenIssueRequest {
        TokenIssueRequest::builder()
            .subject_id("alice")
            .client_id("client-1")
            .client_type(ClientType::Public)
            .scope("read write")
            .build()
    }

    fn refresh_request(token: &str) -> RefreshRequest {
        RefreshRequest::builder()
            .refresh_token(token)
            .client_id("client-1")
            .build()
    }

    #[tokio::test]
    async fn test_rotation_issues_new_token() {
        let (manager, _, _) = manager();
        let strict = VulnerabilityPolicy::strict();
        let first = manager.issue_tokens(&issue_request()).await.unwrap();
        let rt1 = first.refresh_token.clone().unwrap();

        let second = manager.refresh(&refresh_request(&rt1), &strict).await.unwrap();
        let rt2 = second.refresh_token.clone().unwrap();
        assert_ne!(rt1, rt2);
        assert_eq!(second.family_id, first.family_id);
        assert_eq!(second.verdict, Verdict::Verified);

        let family = manager
            .family(first.family_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family.generation_counter, 1);
        assert_eq!(family.current_token_hash, sha256_hex(&rt2));
        assert!(!family.revoked);
    }

    #[tokio::test]
    async fn test_replay_revokes_family_and_access_tokens() {
        let (manager, _, sink) = manager();
        let strict = VulnerabilityPolicy::strict();
        let first = manager.issue_tokens(&issue_request()).await.unwrap();
        let rt1 = first.refresh_token.clone().unwrap();
        let second = manager.refresh(&refresh_request(&rt1), &strict).await.unwrap();
        let rt2 = second.refresh_token.clone().unwrap();

        let replay = manager.refresh(&refresh_request(&rt1), &strict).await.unwrap_err();
        assert!(matches!(
            replay,
            CoreError::ReplayDetected {
                check: Check::RefreshToken
            }
        ));

        let after = manager.refresh(&refresh_request(&rt2), &strict).await.unwrap_err();
        assert_eq!(after.check(), Some(Check::RefreshToken));

        assert!(manager.tokens.introspect(&first.access_token).await.is_err());
        assert!(manager.tokens.introspect(&second.access_token).await.is_err());
        assert_eq!(sink.count(EventType::RefreshReplay, EventOutcome::Failure), 1);
        assert_eq!(sink.count(EventType::FamilyRevoked, EventOutcome::Revoked), 1);
    }

    #[tokio::test]
    async fn test_scope_cannot_grow() {
        let (manager, _, _) = manager();
        let strict = VulnerabilityPolicy::strict();
        let issued = manager.issue_tokens(&issue_request()).await.unwrap();
        let rt = issued.refresh_token.unwrap();

        let broader = RefreshRequest::builder()
            .refresh_token(rt.clone())
            .client_id("client-1")
            .scope("read write admin".to_string())
            .build();
        let error = manager.refresh(&broader, &strict).await.unwrap_err();
        assert_eq!(error.check(), Some(Check::Scope));

        // A rejected request leaves the family usable
        let narrower = RefreshRequest::builder()
            .refresh_token(rt)
            .client_id("client-1")
            .scope("read".to_string())
            .build();
        let tokens = manager.refresh(&narrower, &strict).await.unwrap();
        assert_eq!(tokens.scope, "read");
    }

    #[tokio::test]
    async fn test_client_mismatch_rejected() {
        let (manager, _, _) = manager();
        let issued = manager.issue_tokens(&issue_request()).await.unwrap();
        let request = RefreshRequest::builder()
            .refresh_token(issued.refresh_token.unwrap())
            .client_id("client-2")
            .build();
        let error = manager
            .refresh(&request, &VulnerabilityPolicy::strict())
            .await
            .unwrap_err();
        assert_eq!(error.check(), Some(Check::Client));
    }

    #[tokio::test]
    async fn test_disable_refresh_rotation_keeps_token() {
        let (manager, _, _) = manager();
        let policy = VulnerabilityPolicy {
            disable_refresh_rotation: true,
            ..VulnerabilityPolicy::strict()
        };
        let issued = manager.issue_tokens(&issue_request()).await.unwrap();
        let rt = issued.refresh_token.unwrap();

        for _ in 0..3 {
            let tokens = manager.refresh(&refresh_request(&rt), &policy).await.unwrap();
            assert_eq!(tokens.refresh_token.as_deref(), Some(rt.as_str()));
            assert_eq!(tokens.verdict.flags(), ["disable_refresh_rotation"]);
        }
    }

    #[tokio::test]
    async fn test_skip_replay_detection_accepts_old_token() {
        let (manager, _, sink) = manager();
        let policy = VulnerabilityPolicy {
            skip_refresh_replay_detection: true,
            ..VulnerabilityPolicy::strict()
        };
        let issued = manager.issue_tokens(&issue_request()).await.unwrap();
        let rt1 = issued.refresh_token.unwrap();
        manager.refresh(&refresh_request(&rt1), &policy).await.unwrap();

        let replayed = manager.refresh(&refresh_request(&rt1), &policy).await.unwrap();
        assert_eq!(replayed.verdict.flags(), ["skip_refresh_replay_detection"]);
        assert_eq!(sink.count(EventType::TokensRefreshed, EventOutcome::Bypassed), 1);
        assert_eq!(sink.count(EventType::FamilyRevoked, EventOutcome::Revoked), 0);
    }

    #[tokio::test]
    async fn test_dpop_bound_family_requires_key() {
        let (manager, _, _) = manager();
        let strict = VulnerabilityPolicy::strict();
        let request = TokenIssueRequest::builder()
            .subject_id("alice")
            .client_id("client-1")
            .client_type(ClientType::Public)
            .scope("read")
            .dpop_jkt("jkt-a".to_string())
            .build();
        let issued = manager.issue_tokens(&request).await.unwrap();
        let rt = issued.refresh_token.unwrap();

        let unbound = manager.refresh(&refresh_request(&rt), &strict).await.unwrap_err();
        assert_eq!(unbound.check(), Some(Check::DpopBinding));

        let bound = RefreshRequest::builder()
            .refresh_token(rt)
            .client_id("client-1")
            .dpop_thumbprint("jkt-a".to_string())
            .build();
        let tokens = manager.refresh(&bound, &strict).await.unwrap();
        let introspected = manager.tokens.introspect(&tokens.access_token).await.unwrap();
        assert_eq!(introspected.cnf, Some(Confirmation::Jkt("jkt-a".to_string())));
    }

    #[tokio::test]
    async fn test_expired_access_tokens_pruned() {
        let (manager, clock, _) = manager();
        let strict = VulnerabilityPolicy::strict();
        let issued = manager.issue_tokens(&issue_request()).await.unwrap();
        let family_id = issued.family_id.clone().unwrap();

        clock.advance_secs(700);
        manager
            .refresh(&refresh_request(issued.refresh_token.as_deref().unwrap()), &strict)
            .await
            .unwrap();

        let family = manager.family(&family_id).await.unwrap().unwrap();
        assert_eq!(family.access_tokens.len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_refresh_token() {
        let (manager, _, _) = manager();
        let issued = manager.issue_tokens(&issue_request()).await.unwrap();
        let rt = issued.refresh_token.unwrap();

        assert!(manager.revoke_refresh_token(&rt, "client-2").await.is_err());
        assert!(!manager.revoke_refresh_token("unknown", "client-1").await.unwrap());
        assert!(manager.revoke_refresh_token(&rt, "client-1").await.unwrap());

        assert!(manager.tokens.introspect(&issued.access_token).await.is_err());
        let family = manager
            .family(issued.family_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(family.revoked);
        assert!(!manager.revoke_family("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_without_refresh_token() {
        let (manager, _, _) = manager();
        let request = TokenIssueRequest::builder()
            .subject_id("alice")
            .client_id("client-1")
            .client_type(ClientType::Confidential)
            .scope("read")
            .issue_refresh_token(false)
            .build();
        let tokens = manager.issue_tokens(&request).await.unwrap();
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.family_id.is_none());
        assert_eq!(tokens.expires_in, 3600);
    }
}
