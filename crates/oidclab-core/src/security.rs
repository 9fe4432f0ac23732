//! The security core facade
//!
//! [`SecurityCore`] wires the components to one store, clock and event sink
//! and exposes the operations an HTTP layer needs. Every operation that can be
//! relaxed takes a policy snapshot; take it once per request with
//! [`SecurityCore::policy_snapshot`] and pass the same snapshot to every call
//! made for that request.

use std::sync::Arc;

use bon::Builder;

use crate::clock::{SharedClock, SystemClock};
use crate::code::{AuthorizationCodeIssuer, AuthorizationRequest, CodeRedemption, RedeemedCode};
use crate::config::CoreConfig;
use crate::dpop::{self, CheckedProof, DpopProofRequest, DpopVerifier};
use crate::error::{CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent, TracingEventSink};
use crate::mtls::{self, CertificateBinding, MtlsBinder};
use crate::policy::{PolicyHandle, Verdict, VulnerabilityPolicy};
use crate::refresh::{RefreshRequest, RefreshRotationManager, RefreshTokenFamily};
use crate::state::StateBinder;
use crate::store::{ExpiringKeyStore, MemoryStore, RecordStore};
use crate::tokens::{
    BoundToken, ClientType, Confirmation, IssuedTokens, TokenIssueRequest, TokenIssuer,
    TokenLifetimes, TokenSigner, ValidatedIdToken,
};

/// HTTP method of token endpoint requests
const TOKEN_ENDPOINT_METHOD: &str = "POST";

/// Authorization code grant at the token endpoint
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct TokenExchangeRequest {
    /// The code
    pub code: String,
    /// Authenticated client
    pub client_id: String,
    /// Client type, for access token lifetime
    pub client_type: ClientType,
    /// `redirect_uri` parameter
    pub redirect_uri: String,
    /// PKCE `code_verifier`
    pub code_verifier: Option<String>,
    /// Token endpoint URI as requested, for DPoP `htu`
    pub token_endpoint: String,
    /// `DPoP` header
    pub dpop_proof: Option<String>,
    /// Peer certificate (DER) on this connection
    pub client_cert_der: Option<Vec<u8>>,
}

/// A request to a protected resource
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct ResourceRequest {
    /// Access token from the `Authorization` header
    pub access_token: String,
    /// HTTP method
    pub method: String,
    /// Full request URI
    pub uri: String,
    /// `DPoP` header
    pub dpop_proof: Option<String>,
    /// Peer certificate (DER) on this connection
    pub client_cert_der: Option<Vec<u8>>,
}

/// Outcome of an authorized resource request
#[derive(Debug, Clone)]
pub struct ResourceAccess {
    /// The token and its binding
    pub token: BoundToken,
    /// Checks relaxed
    pub verdict: Verdict,
}

/// Protocol security-validation core
#[derive(Debug)]
pub struct SecurityCore {
    config: CoreConfig,
    policy: PolicyHandle,
    records: RecordStore,
    events: Arc<dyn EventSink>,
    state: StateBinder,
    codes: AuthorizationCodeIssuer,
    dpop: DpopVerifier,
    mtls: MtlsBinder,
    tokens: TokenIssuer,
    refresh: RefreshRotationManager,
}

/// Builder for [`SecurityCore`]
#[derive(Debug, Default)]
pub struct SecurityCoreBuilder {
    config: CoreConfig,
    store: Option<Arc<dyn ExpiringKeyStore>>,
    clock: Option<SharedClock>,
    events: Option<Arc<dyn EventSink>>,
    signer: Option<TokenSigner>,
}

impl SecurityCoreBuilder {
    /// Configuration (defaults otherwise)
    #[must_use]
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Store backend (in-memory otherwise)
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ExpiringKeyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock (system clock otherwise)
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Event sink (tracing otherwise)
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token signer (from configuration otherwise)
    #[must_use]
    pub fn signer(mut self, signer: TokenSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Validate the configuration and assemble the core
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] for an invalid configuration or a
    /// signing key that cannot be created
    pub fn build(self) -> Result<SecurityCore> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;

        let clock: SharedClock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store: Arc<dyn ExpiringKeyStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new(clock.clone())),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(TracingEventSink::default()),
        };
        let signer = match self.signer {
            Some(signer) => signer,
            None => match &config.hs256_secret {
                Some(secret) => TokenSigner::hs256(secret),
                None => TokenSigner::es256()?,
            },
        };

        let records = RecordStore::new(store, clock, config.store_timeout(), config.grace());
        // Bounded by `validate`
        let secs = |value: u64| chrono::Duration::seconds(value as i64);
        let lifetimes = TokenLifetimes {
            public_access: secs(config.public_access_token_secs),
            confidential_access: secs(config.confidential_access_token_secs),
            id_token: secs(config.id_token_secs),
            refresh: secs(config.refresh_token_secs),
        };

        tracing::info!(
            issuer = %config.issuer,
            signing_alg = ?signer.algorithm(),
            "Security core initialized"
        );
        let tokens = TokenIssuer::new(
            Arc::new(signer),
            records.clone(),
            events.clone(),
            config.issuer.clone(),
            lifetimes,
        );

        let policy = PolicyHandle::new(config.policy);
        if !config.policy.is_strict() {
            tracing::warn!(flags = ?config.policy.enabled_flags(), "Starting with relaxed checks");
        }

        Ok(SecurityCore {
            state: StateBinder::new(records.clone(), events.clone(), secs(config.state_ttl_secs)),
            codes: AuthorizationCodeIssuer::new(
                records.clone(),
                events.clone(),
                secs(config.code_ttl_secs),
            ),
            dpop: DpopVerifier::new(records.clone(), events.clone(), config.dpop_iat_window_secs),
            mtls: MtlsBinder::new(records.clock().clone(), events.clone()),
            refresh: RefreshRotationManager::new(records.clone(), tokens.clone(), events.clone()),
            tokens,
            policy,
            records,
            events,
            config,
        })
    }
}

impl SecurityCore {
    /// Start building a core
    pub fn builder() -> SecurityCoreBuilder {
        SecurityCoreBuilder::default()
    }

    /// In-memory core with the system clock and tracing events
    ///
    /// # Errors
    /// Same as [`SecurityCoreBuilder::build`]
    pub fn in_memory(config: CoreConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Active configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Live policy; writers go through this handle
    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    /// Policy for one request
    pub fn policy_snapshot(&self) -> Arc<VulnerabilityPolicy> {
        self.policy.snapshot()
    }

    /// Issue a state for `session_id`
    ///
    /// # Errors
    /// See [`StateBinder::issue`]
    pub async fn issue_state(&self, session_id: &str) -> Result<String> {
        self.state.issue(session_id, None).await
    }

    /// Issue a state for one of several concurrent flows in a session
    ///
    /// # Errors
    /// See [`StateBinder::issue`]
    pub async fn issue_state_for(&self, session_id: &str, provider: &str) -> Result<String> {
        self.state.issue(session_id, Some(provider)).await
    }

    /// Validate and consume the state returned on callback
    ///
    /// # Errors
    /// See [`StateBinder::validate_and_consume`]
    pub async fn validate_state(
        &self,
        session_id: &str,
        state: &str,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        self.state
            .validate_and_consume(session_id, None, state, policy)
            .await
    }

    /// [`validate_state`](Self::validate_state) for a provider-scoped state
    ///
    /// # Errors
    /// See [`StateBinder::validate_and_consume`]
    pub async fn validate_state_for(
        &self,
        session_id: &str,
        provider: &str,
        state: &str,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        self.state
            .validate_and_consume(session_id, Some(provider), state, policy)
            .await
    }

    /// Issue an authorization code
    ///
    /// # Errors
    /// See [`AuthorizationCodeIssuer::issue`]
    pub async fn issue_authorization_code(
        &self,
        request: &AuthorizationRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<(String, Verdict)> {
        self.codes.issue(request, policy).await
    }

    /// Redeem an authorization code
    ///
    /// # Errors
    /// See [`AuthorizationCodeIssuer::redeem`]
    pub async fn redeem_authorization_code(
        &self,
        redemption: &CodeRedemption,
        policy: &VulnerabilityPolicy,
    ) -> Result<RedeemedCode> {
        self.codes.redeem(redemption, policy).await
    }

    /// Validate a DPoP proof
    ///
    /// # Errors
    /// See [`DpopVerifier::validate_proof`]
    pub async fn validate_dpop_proof(
        &self,
        request: &DpopProofRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<CheckedProof> {
        self.dpop.validate_proof(request, policy).await
    }

    /// Compare a proof key thumbprint with `cnf.jkt`
    ///
    /// # Errors
    /// See [`DpopVerifier::verify_binding`]
    pub async fn verify_dpop_binding(
        &self,
        thumbprint: &str,
        cnf_jkt: &str,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        self.dpop.verify_binding(thumbprint, cnf_jkt, policy).await
    }

    /// Compare the live peer certificate with a token's `cnf`
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedInput`] for an empty certificate, otherwise
    /// see [`MtlsBinder::validate_binding`]
    pub async fn validate_mtls_binding(
        &self,
        cert_der: &[u8],
        cnf: &Confirmation,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        let binding = CertificateBinding::from_der(cert_der)?;
        self.mtls
            .validate_binding(&binding.cert_thumbprint, cnf, policy)
            .await
    }

    /// Issue tokens for an already authorized grant
    ///
    /// # Errors
    /// See [`RefreshRotationManager::issue_tokens`]
    pub async fn issue_tokens(&self, request: &TokenIssueRequest) -> Result<IssuedTokens> {
        self.refresh.issue_tokens(request).await
    }

    /// Exchange a refresh token
    ///
    /// # Errors
    /// See [`RefreshRotationManager::refresh`]
    pub async fn refresh_tokens(
        &self,
        request: &RefreshRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<IssuedTokens> {
        self.refresh.refresh(request, policy).await
    }

    /// Authorization code grant: DPoP proof, code redemption with PKCE, then
    /// token issuance bound to the proof key or client certificate
    ///
    /// The proof is checked before the code is consumed, so a bad proof does
    /// not burn the code.
    ///
    /// # Errors
    /// Any error of the steps above
    pub async fn exchange_authorization_code(
        &self,
        request: &TokenExchangeRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<IssuedTokens> {
        let proof = match &request.dpop_proof {
            Some(proof) => {
                let proof_request = DpopProofRequest {
                    proof: proof.clone(),
                    method: TOKEN_ENDPOINT_METHOD.to_string(),
                    uri: request.token_endpoint.clone(),
                    access_token: None,
                };
                Some(self.dpop.validate_proof(&proof_request, policy).await?)
            }
            None => None,
        };

        let redemption = CodeRedemption {
            code: request.code.clone(),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            code_verifier: request.code_verifier.clone(),
            dpop_thumbprint: proof.as_ref().map(|proof| proof.thumbprint().to_string()),
        };
        let redeemed = self.codes.redeem(&redemption, policy).await?;

        let mtls_thumbprint = match (&proof, &request.client_cert_der) {
            (None, Some(der)) => Some(CertificateBinding::from_der(der)?.cert_thumbprint),
            _ => None,
        };

        let code = &redeemed.code;
        let issue = TokenIssueRequest {
            subject_id: code.subject_id.clone(),
            client_id: code.client_id.clone(),
            client_type: request.client_type,
            scope: code.scope.clone(),
            dpop_jkt: proof.as_ref().map(|proof| proof.thumbprint().to_string()),
            mtls_thumbprint,
            nonce: code.nonce.clone(),
            issue_refresh_token: true,
        };
        let mut tokens = self.refresh.issue_tokens(&issue).await?;

        let proof_verdict = proof.map_or(Verdict::Verified, |proof| proof.verdict);
        tokens.verdict = proof_verdict
            .merge(redeemed.verdict)
            .merge(tokens.verdict);
        Ok(tokens)
    }

    /// Authorize a request to a protected resource
    ///
    /// A sender-constrained token is only accepted together with a matching
    /// live DPoP proof or client certificate.
    ///
    /// # Errors
    /// Token, proof or binding failures
    pub async fn authorize_resource_request(
        &self,
        request: &ResourceRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<ResourceAccess> {
        let result = self.check_resource_request(request, policy).await;
        let outcome = match &result {
            Ok(access) if access.verdict.is_bypassed() => EventOutcome::Bypassed,
            Ok(_) => EventOutcome::Success,
            Err(_) => EventOutcome::Failure,
        };
        let mut event = SecurityEvent::new(EventType::ResourceAccess, outcome)
            .at(self.records.clock().now())
            .with_key(&request.access_token)
            .with_meta("method", request.method.as_str());
        match &result {
            Ok(access) if access.verdict.is_bypassed() => {
                event = event.with_meta("flags", access.verdict.flags().join(","));
            }
            Err(error) => {
                event = event.with_meta(
                    "check",
                    error.check().map_or("none", |check| check.as_str()),
                );
            }
            Ok(_) => {}
        }
        self.events.record(event).await;
        result
    }

    async fn check_resource_request(
        &self,
        request: &ResourceRequest,
        policy: &VulnerabilityPolicy,
    ) -> Result<ResourceAccess> {
        let token = self.tokens.introspect(&request.access_token).await?;

        let verdict = match &token.cnf {
            Some(Confirmation::Jkt(jkt)) => match &request.dpop_proof {
                Some(proof) => {
                    let proof_request = DpopProofRequest {
                        proof: proof.clone(),
                        method: request.method.clone(),
                        uri: request.uri.clone(),
                        access_token: Some(request.access_token.clone()),
                    };
                    let checked = self.dpop.validate_proof(&proof_request, policy).await?;
                    let binding = self
                        .dpop
                        .verify_binding(checked.thumbprint(), jkt, policy)
                        .await?;
                    checked.verdict.merge(binding)
                }
                None => dpop::missing_proof(policy)?,
            },
            Some(cnf @ Confirmation::X5tS256(_)) => match &request.client_cert_der {
                Some(der) => self.validate_mtls_binding(der, cnf, policy).await?,
                None => mtls::missing_certificate(policy)?,
            },
            None => Verdict::Verified,
        };

        Ok(ResourceAccess { token, verdict })
    }

    /// Verify an access token and report its binding
    ///
    /// # Errors
    /// See [`TokenIssuer::introspect`]
    pub async fn introspect_access_token(&self, token: &str) -> Result<BoundToken> {
        self.tokens.introspect(token).await
    }

    /// Validate an ID token
    ///
    /// # Errors
    /// See [`TokenIssuer::validate_id_token`]
    pub async fn validate_id_token(
        &self,
        id_token: &str,
        client_id: &str,
        expected_nonce: Option<&str>,
        access_token: Option<&str>,
        policy: &VulnerabilityPolicy,
    ) -> Result<ValidatedIdToken> {
        self.tokens
            .validate_id_token(id_token, client_id, expected_nonce, access_token, policy)
            .await
    }

    /// Revoke the family of a refresh token
    ///
    /// # Errors
    /// See [`RefreshRotationManager::revoke_refresh_token`]
    pub async fn revoke_refresh_token(&self, refresh_token: &str, client_id: &str) -> Result<bool> {
        self.refresh
            .revoke_refresh_token(refresh_token, client_id)
            .await
    }

    /// Revoke a refresh family by identifier
    ///
    /// # Errors
    /// See [`RefreshRotationManager::revoke_family`]
    pub async fn revoke_family(&self, family_id: &str) -> Result<bool> {
        self.refresh.revoke_family(family_id).await
    }

    /// Current state of a refresh family
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] on store failure
    pub async fn refresh_family(&self, family_id: &str) -> Result<Option<RefreshTokenFamily>> {
        self.refresh.family(family_id).await
    }

    /// Physically drop expired store entries
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] on store failure
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = self.records.backend().purge_expired().await?;
        tracing::debug!(removed, "Purged expired records");
        Ok(removed)
    }
}
