//! Access and ID tokens
//!
//! Access tokens are RFC 9068 JWTs (`typ: at+jwt`). Every issued access token
//! is also registered under `access-token:{jti}` so that revoking a refresh
//! family revokes the access tokens derived from it. A token whose registry
//! entry is gone is rejected even while its signature and `exp` are valid.
//!
//! Expiry is checked against the injected clock, not by `jsonwebtoken`.

use std::fmt;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bon::Builder;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use oidclab_dpop::DpopKeyPair;
use oidclab_dpop::helpers::{jwk_to_decoding_key, private_key_to_encoding_key};

use crate::crypto::{constant_time_eq, fingerprint};
use crate::error::{Check, CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent};
use crate::policy::{Verdict, VulnerabilityPolicy};
use crate::store::{Lookup, Namespace, RecordStore};

/// `typ` header of access tokens
pub const ACCESS_TOKEN_TYPE: &str = "at+jwt";

/// `typ` header of ID tokens
pub const ID_TOKEN_TYPE: &str = "JWT";

/// `cnf` claim (RFC 7800)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    /// DPoP key thumbprint (RFC 9449)
    #[serde(rename = "jkt")]
    Jkt(String),
    /// Certificate thumbprint (RFC 8705)
    #[serde(rename = "x5t#S256")]
    X5tS256(String),
}

/// Client type, which determines access token lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Cannot keep a secret (SPA, native app)
    Public,
    /// Authenticates to the token endpoint
    Confidential,
}

/// `token_type` of a token response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    /// Unbound or certificate-bound token
    Bearer,
    /// DPoP-bound token
    DPoP,
}

impl TokenType {
    /// Wire value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "Bearer",
            Self::DPoP => "DPoP",
        }
    }
}

/// Who a token is for and what it allows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// End user
    pub subject_id: String,
    /// Client
    pub client_id: String,
    /// Client type
    pub client_type: ClientType,
    /// Space-separated scope
    pub scope: String,
}

/// Access token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scope
    pub scope: String,
    /// Issued at
    pub iat: i64,
    /// Expiry
    pub exp: i64,
    /// Token identifier and registry key
    pub jti: String,
    /// Sender constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

/// ID token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Client
    pub aud: String,
    /// Issued at
    pub iat: i64,
    /// Expiry
    pub exp: i64,
    /// Nonce from the authorization request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Left half of SHA-256 of the access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
}

/// A live access token as seen by a resource server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundToken {
    /// `jti`
    pub token_id: String,
    /// End user
    pub subject_id: String,
    /// Client
    pub client_id: String,
    /// Scope
    pub scope: String,
    /// Issued at
    pub issued_at: i64,
    /// Expiry
    pub expires_at: i64,
    /// Sender constraint; when present the token alone is never sufficient
    pub cnf: Option<Confirmation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenRecord {
    subject_id: String,
    client_id: String,
    family_id: Option<String>,
}

/// Request to issue tokens directly (outside the code exchange)
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct TokenIssueRequest {
    /// End user
    pub subject_id: String,
    /// Client
    pub client_id: String,
    /// Client type
    pub client_type: ClientType,
    /// Granted scope
    pub scope: String,
    /// Bind to this DPoP key thumbprint
    pub dpop_jkt: Option<String>,
    /// Bind to this certificate thumbprint
    pub mtls_thumbprint: Option<String>,
    /// OIDC nonce for the ID token
    pub nonce: Option<String>,
    /// Start a refresh token family
    #[builder(default = true)]
    pub issue_refresh_token: bool,
}

impl TokenIssueRequest {
    /// The grant this request describes
    pub fn grant(&self) -> Grant {
        Grant {
            subject_id: self.subject_id.clone(),
            client_id: self.client_id.clone(),
            client_type: self.client_type,
            scope: self.scope.clone(),
        }
    }

    /// `cnf` for the requested binding
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedInput`] if both bindings are requested
    pub fn confirmation(&self) -> Result<Option<Confirmation>> {
        match (&self.dpop_jkt, &self.mtls_thumbprint) {
            (Some(_), Some(_)) => Err(CoreError::MalformedInput(
                "a token is bound to either a DPoP key or a certificate, not both".to_string(),
            )),
            (Some(jkt), None) => Ok(Some(Confirmation::Jkt(jkt.clone()))),
            (None, Some(x5t)) => Ok(Some(Confirmation::X5tS256(x5t.clone()))),
            (None, None) => Ok(None),
        }
    }
}

/// Token endpoint response
#[derive(Clone)]
pub struct IssuedTokens {
    /// Access token JWT
    pub access_token: String,
    /// `Bearer` or `DPoP`
    pub token_type: TokenType,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    /// Granted scope
    pub scope: String,
    /// Refresh token, when a family was started or rotated
    pub refresh_token: Option<String>,
    /// ID token, when `openid` was granted
    pub id_token: Option<String>,
    /// Refresh family the tokens belong to
    pub family_id: Option<String>,
    /// Checks relaxed while producing these tokens
    pub verdict: Verdict,
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("access_token", &fingerprint(&self.access_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("refresh_token", &self.refresh_token.as_deref().map(fingerprint))
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field("family_id", &self.family_id)
            .field("verdict", &self.verdict)
            .finish()
    }
}

/// Result of ID token validation
#[derive(Debug, Clone)]
pub struct ValidatedIdToken {
    /// Verified claims
    pub claims: IdTokenClaims,
    /// Checks relaxed
    pub verdict: Verdict,
}

/// Whether `scope` contains `value` as a whole token
pub fn scope_contains(scope: &str, value: &str) -> bool {
    scope.split_whitespace().any(|item| item == value)
}

/// Whether every scope token in `requested` is in `granted`
pub fn scope_is_subset(requested: &str, granted: &str) -> bool {
    requested
        .split_whitespace()
        .all(|item| scope_contains(granted, item))
}

/// OIDC `at_hash`: base64url of the left half of SHA-256(access token)
pub fn at_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// Signing key for issued tokens
#[derive(Clone)]
pub struct TokenSigner {
    algorithm: Algorithm,
    key_id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Fresh ES256 key
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] if key generation fails
    pub fn es256() -> Result<Self> {
        let key_pair = DpopKeyPair::generate_p256()
            .map_err(|e| CoreError::Configuration(format!("signing key generation failed: {e}")))?;
        let encoding = private_key_to_encoding_key(&key_pair.private_key)
            .map_err(|e| CoreError::Configuration(e.to_string()))?;
        let decoding = jwk_to_decoding_key(&key_pair.public_jwk())
            .map_err(|e| CoreError::Configuration(e.to_string()))?;
        Ok(Self {
            algorithm: Algorithm::ES256,
            key_id: key_pair.thumbprint,
            encoding,
            decoding,
        })
    }

    /// HS256 with a shared secret
    pub fn hs256(secret: &SecretString) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            algorithm: Algorithm::HS256,
            key_id: "hs256".to_string(),
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
        }
    }

    /// Signing algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// `kid` header value
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign<T: Serialize>(&self, typ: &str, claims: &T) -> Result<String> {
        let mut header = Header::new(self.algorithm);
        header.typ = Some(typ.to_string());
        header.kid = Some(self.key_id.clone());
        encode(&header, claims, &self.encoding)
            .map_err(|e| CoreError::Configuration(format!("token signing failed: {e}")))
    }

    fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        typ: &str,
        check: Check,
        configure: impl FnOnce(&mut Validation),
    ) -> Result<T> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        configure(&mut validation);

        let data = decode::<T>(token, &self.decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                CoreError::MalformedInput(format!("{check} is not a well-formed JWT"))
            }
            _ => CoreError::validation(check, e.to_string()),
        })?;

        if data.header.typ.as_deref() != Some(typ) {
            return Err(CoreError::validation(check, "unexpected token type"));
        }
        Ok(data.claims)
    }
}

/// Token lifetimes
#[derive(Debug, Clone, Copy)]
pub struct TokenLifetimes {
    /// Access tokens for public clients
    pub public_access: chrono::Duration,
    /// Access tokens for confidential clients
    pub confidential_access: chrono::Duration,
    /// ID tokens
    pub id_token: chrono::Duration,
    /// Refresh families
    pub refresh: chrono::Duration,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            public_access: chrono::Duration::minutes(10),
            confidential_access: chrono::Duration::hours(1),
            id_token: chrono::Duration::minutes(10),
            refresh: chrono::Duration::days(14),
        }
    }
}

/// An access token and its claims
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    /// Compact JWT
    pub token: String,
    /// Claims inside it
    pub claims: AccessTokenClaims,
}

/// Issues, introspects and revokes access tokens; issues and checks ID tokens
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    signer: Arc<TokenSigner>,
    records: RecordStore,
    events: Arc<dyn EventSink>,
    issuer: String,
    lifetimes: TokenLifetimes,
}

impl TokenIssuer {
    /// Create an issuer
    pub fn new(
        signer: Arc<TokenSigner>,
        records: RecordStore,
        events: Arc<dyn EventSink>,
        issuer: impl Into<String>,
        lifetimes: TokenLifetimes,
    ) -> Self {
        Self {
            signer,
            records,
            events,
            issuer: issuer.into(),
            lifetimes,
        }
    }

    /// Configured lifetimes
    pub fn lifetimes(&self) -> &TokenLifetimes {
        &self.lifetimes
    }

    /// Access token lifetime for a client type
    pub fn access_token_ttl(&self, client_type: ClientType) -> chrono::Duration {
        match client_type {
            ClientType::Public => self.lifetimes.public_access,
            ClientType::Confidential => self.lifetimes.confidential_access,
        }
    }

    /// Sign and register an access token
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] if signing fails and
    /// [`CoreError::Store`] if registration fails
    pub async fn issue_access_token(
        &self,
        grant: &Grant,
        cnf: Option<&Confirmation>,
        family_id: Option<&str>,
    ) -> Result<IssuedAccessToken> {
        let now = self.records.clock().unix_now();
        let ttl = self.access_token_ttl(grant.client_type);
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: grant.subject_id.clone(),
            client_id: grant.client_id.clone(),
            scope: grant.scope.clone(),
            iat: now,
            exp: now + ttl.num_seconds(),
            jti: Uuid::new_v4().to_string(),
            cnf: cnf.cloned(),
        };
        let token = self.signer.sign(ACCESS_TOKEN_TYPE, &claims)?;

        let record = AccessTokenRecord {
            subject_id: grant.subject_id.clone(),
            client_id: grant.client_id.clone(),
            family_id: family_id.map(str::to_string),
        };
        self.records
            .put_until(Namespace::AccessToken, &claims.jti, &record, claims.exp)
            .await?;

        Ok(IssuedAccessToken { token, claims })
    }

    /// Sign an ID token
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] if signing fails
    pub fn issue_id_token(
        &self,
        grant: &Grant,
        nonce: Option<&str>,
        access_token: &str,
    ) -> Result<String> {
        let now = self.records.clock().unix_now();
        let claims = IdTokenClaims {
            iss: self.issuer.clone(),
            sub: grant.subject_id.clone(),
            aud: grant.client_id.clone(),
            iat: now,
            exp: now + self.lifetimes.id_token.num_seconds(),
            nonce: nonce.map(str::to_string),
            at_hash: Some(at_hash(access_token)),
        };
        self.signer.sign(ID_TOKEN_TYPE, &claims)
    }

    /// Issue an access token (and an ID token for `openid`) without a refresh family
    ///
    /// # Errors
    /// Same as [`issue_access_token`](Self::issue_access_token), plus
    /// [`CoreError::MalformedInput`] for a conflicting binding
    pub async fn issue(&self, request: &TokenIssueRequest) -> Result<IssuedTokens> {
        let grant = request.grant();
        let cnf = request.confirmation()?;
        let access = self.issue_access_token(&grant, cnf.as_ref(), None).await?;
        self.finish(&grant, cnf.as_ref(), request.nonce.as_deref(), access, None, None, Verdict::Verified)
            .await
    }

    /// Assemble a token response and report it
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn finish(
        &self,
        grant: &Grant,
        cnf: Option<&Confirmation>,
        nonce: Option<&str>,
        access: IssuedAccessToken,
        refresh_token: Option<String>,
        family_id: Option<String>,
        verdict: Verdict,
    ) -> Result<IssuedTokens> {
        let id_token = if scope_contains(&grant.scope, "openid") {
            Some(self.issue_id_token(grant, nonce, &access.token)?)
        } else {
            None
        };
        let token_type = match cnf {
            Some(Confirmation::Jkt(_)) => TokenType::DPoP,
            _ => TokenType::Bearer,
        };

        let mut event = SecurityEvent::new(EventType::TokensIssued, EventOutcome::Success)
            .at(self.records.clock().now())
            .with_key(&access.claims.jti)
            .with_meta("client_id", grant.client_id.as_str())
            .with_meta("token_type", token_type.as_str());
        if let Some(family_id) = &family_id {
            event = event.with_meta("family_id", family_id.as_str());
        }
        self.events.record(event).await;

        Ok(IssuedTokens {
            expires_in: access.claims.exp - access.claims.iat,
            access_token: access.token,
            token_type,
            scope: grant.scope.clone(),
            refresh_token,
            id_token,
            family_id,
            verdict,
        })
    }

    /// Verify an access token and confirm it is still registered
    ///
    /// # Errors
    /// - [`CoreError::MalformedInput`] for a non-JWT
    /// - [`CoreError::ValidationFailed`] for a bad signature, wrong issuer or
    ///   a revoked token
    /// - [`CoreError::Expired`] past `exp`
    pub async fn introspect(&self, token: &str) -> Result<BoundToken> {
        let issuer = self.issuer.clone();
        let claims: AccessTokenClaims =
            self.signer
                .verify(token, ACCESS_TOKEN_TYPE, Check::AccessToken, |validation| {
                    validation.set_issuer(&[issuer]);
                })?;

        if self.records.clock().unix_now() >= claims.exp {
            return Err(CoreError::expired(Check::AccessToken, "access token expired"));
        }

        let lookup: Lookup<AccessTokenRecord> =
            self.records.peek(Namespace::AccessToken, &claims.jti).await?;
        if lookup.live().is_none() {
            return Err(CoreError::validation(
                Check::AccessToken,
                "access token revoked",
            ));
        }

        Ok(BoundToken {
            token_id: claims.jti,
            subject_id: claims.sub,
            client_id: claims.client_id,
            scope: claims.scope,
            issued_at: claims.iat,
            expires_at: claims.exp,
            cnf: claims.cnf,
        })
    }

    /// Remove access tokens from the registry; returns how many were live
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] on store failure
    pub async fn revoke_access_tokens(&self, token_ids: &[String]) -> Result<usize> {
        let mut revoked = 0;
        for token_id in token_ids {
            if self.records.remove(Namespace::AccessToken, token_id).await? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    /// Validate an ID token for `client_id`
    ///
    /// # Errors
    /// - [`CoreError::ValidationFailed`] with [`Check::IdToken`] for a bad
    ///   signature, issuer, audience or `at_hash`
    /// - [`CoreError::ValidationFailed`] with [`Check::Nonce`] for a nonce
    ///   mismatch not bypassed by `skip_nonce_validation`
    /// - [`CoreError::Expired`] past `exp`
    pub async fn validate_id_token(
        &self,
        id_token: &str,
        client_id: &str,
        expected_nonce: Option<&str>,
        access_token: Option<&str>,
        policy: &VulnerabilityPolicy,
    ) -> Result<ValidatedIdToken> {
        let issuer = self.issuer.clone();
        let audience = client_id.to_string();
        let result = self
            .signer
            .verify::<IdTokenClaims>(id_token, ID_TOKEN_TYPE, Check::IdToken, |validation| {
                validation.set_issuer(&[issuer]);
                validation.validate_aud = true;
                validation.set_audience(&[audience]);
            })
            .and_then(|claims| {
                if self.records.clock().unix_now() >= claims.exp {
                    Err(CoreError::expired(Check::IdToken, "ID token expired"))
                } else {
                    Ok(claims)
                }
            })
            .and_then(|claims| match access_token {
                Some(token) => {
                    let expected = at_hash(token);
                    let matches = claims
                        .at_hash
                        .as_deref()
                        .is_some_and(|value| constant_time_eq(value, &expected));
                    if matches {
                        Ok(claims)
                    } else {
                        Err(CoreError::validation(Check::IdToken, "at_hash mismatch"))
                    }
                }
                None => Ok(claims),
            });

        let claims = match result {
            Ok(claims) => claims,
            Err(error) => {
                self.id_token_event(client_id, EventOutcome::Failure, Some("claims"))
                    .await;
                return Err(error);
            }
        };

        let mut bypassed = Vec::new();
        if let Some(expected) = expected_nonce {
            let matches = claims
                .nonce
                .as_deref()
                .is_some_and(|nonce| constant_time_eq(nonce, expected));
            if !matches {
                if policy.skip_nonce_validation {
                    tracing::warn!("ID token nonce mismatch accepted by skip_nonce_validation");
                    bypassed.push("skip_nonce_validation");
                } else {
                    self.id_token_event(client_id, EventOutcome::Failure, Some("nonce_mismatch"))
                        .await;
                    return Err(CoreError::validation(Check::Nonce, "nonce mismatch"));
                }
            }
        }

        let verdict = Verdict::from_bypassed(bypassed);
        let outcome = if verdict.is_bypassed() {
            EventOutcome::Bypassed
        } else {
            EventOutcome::Success
        };
        self.id_token_event(client_id, outcome, None).await;
        Ok(ValidatedIdToken { claims, verdict })
    }

    async fn id_token_event(&self, client_id: &str, outcome: EventOutcome, reason: Option<&str>) {
        let mut event = SecurityEvent::new(EventType::IdTokenValidated, outcome)
            .at(self.records.clock().now())
            .with_meta("client_id", client_id);
        if let Some(reason) = reason {
            event = event.with_meta("reason", reason);
        }
        self.events.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::events::MemoryEventSink;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn issuer_with(signer: TokenSigner) -> (TokenIssuer, ManualClock) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let records = RecordStore::new(
            Arc::new(MemoryStore::new(shared.clone())),
            shared,
            Duration::from_millis(250),
            chrono::Duration::seconds(60),
        );
        let issuer = TokenIssuer::new(
            Arc::new(signer),
            records,
            Arc::new(MemoryEventSink::new()),
            "https://as.example.com",
            TokenLifetimes::default(),
        );
        (issuer, clock)
    }

    fn grant(client_type: ClientType) -> Grant {
        Grant {
            subject_id: "alice".to_string(),
            client_id: "client-1".to_string(),
            client_type,
            scope: "openid read".to_string(),
        }
    }

    #[tokio::test]
    async fn test_access_token_round_trip_with_cnf() {
        let (issuer, _) = issuer_with(TokenSigner::es256().unwrap());
        let cnf = Confirmation::Jkt("thumb".to_string());
        let access = issuer
            .issue_access_token(&grant(ClientType::Public), Some(&cnf), None)
            .await
            .unwrap();

        let bound = issuer.introspect(&access.token).await.unwrap();
        assert_eq!(bound.cnf, Some(cnf));
        assert_eq!(bound.subject_id, "alice");
        assert_eq!(bound.expires_at - bound.issued_at, 600);
    }

    #[tokio::test]
    async fn test_lifetime_by_client_type() {
        let (issuer, clock) = issuer_with(TokenSigner::es256().unwrap());
        let access = issuer
            .issue_access_token(&grant(ClientType::Confidential), None, None)
            .await
            .unwrap();
        assert_eq!(access.claims.exp - access.claims.iat, 3600);

        clock.advance_secs(3600);
        let expired = issuer.introspect(&access.token).await.unwrap_err();
        assert!(matches!(expired, CoreError::Expired { .. }));
    }

    #[tokio::test]
    async fn test_revoked_token_rejected() {
        let (issuer, _) = issuer_with(TokenSigner::es256().unwrap());
        let access = issuer
            .issue_access_token(&grant(ClientType::Public), None, None)
            .await
            .unwrap();

        assert_eq!(
            issuer
                .revoke_access_tokens(&[access.claims.jti.clone()])
                .await
                .unwrap(),
            1
        );
        assert!(issuer.introspect(&access.token).await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_signature_rejected() {
        let (issuer, _) = issuer_with(TokenSigner::es256().unwrap());
        let (other, _) = issuer_with(TokenSigner::es256().unwrap());
        let access = other
            .issue_access_token(&grant(ClientType::Public), None, None)
            .await
            .unwrap();

        let error = issuer.introspect(&access.token).await.unwrap_err();
        assert_eq!(error.check(), Some(Check::AccessToken));
        assert!(matches!(
            issuer.introspect("not-a-jwt").await,
            Err(CoreError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_id_token_is_not_an_access_token() {
        let secret = SecretString::new("0123456789abcdef0123456789abcdef".to_string());
        let (issuer, _) = issuer_with(TokenSigner::hs256(&secret));
        let id_token = issuer
            .issue_id_token(&grant(ClientType::Public), None, "at")
            .unwrap();
        assert!(issuer.introspect(&id_token).await.is_err());
    }

    #[tokio::test]
    async fn test_id_token_nonce_and_at_hash() {
        let (issuer, _) = issuer_with(TokenSigner::es256().unwrap());
        let strict = VulnerabilityPolicy::strict();
        let id_token = issuer
            .issue_id_token(&grant(ClientType::Public), Some("n-0S6_WzA2Mj"), "access-token")
            .unwrap();

        let validated = issuer
            .validate_id_token(&id_token, "client-1", Some("n-0S6_WzA2Mj"), Some("access-token"), &strict)
            .await
            .unwrap();
        assert_eq!(validated.verdict, Verdict::Verified);

        let wrong_nonce = issuer
            .validate_id_token(&id_token, "client-1", Some("other"), None, &strict)
            .await
            .unwrap_err();
        assert_eq!(wrong_nonce.check(), Some(Check::Nonce));

        let wrong_at = issuer
            .validate_id_token(&id_token, "client-1", None, Some("other-token"), &strict)
            .await
            .unwrap_err();
        assert_eq!(wrong_at.check(), Some(Check::IdToken));

        let wrong_aud = issuer
            .validate_id_token(&id_token, "client-2", None, None, &strict)
            .await
            .unwrap_err();
        assert_eq!(wrong_aud.check(), Some(Check::IdToken));

        let lax = VulnerabilityPolicy {
            skip_nonce_validation: true,
            ..VulnerabilityPolicy::strict()
        };
        let bypassed = issuer
            .validate_id_token(&id_token, "client-1", Some("other"), None, &lax)
            .await
            .unwrap();
        assert_eq!(bypassed.verdict.flags(), ["skip_nonce_validation"]);
    }

    #[test]
    fn test_scope_subset() {
        assert!(scope_is_subset("read", "openid read write"));
        assert!(scope_is_subset("", "read"));
        assert!(!scope_is_subset("read admin", "openid read write"));
        assert!(!scope_is_subset("rea", "read"));
    }

    #[test]
    fn test_cnf_serialization() {
        let claims = serde_json::to_value(Confirmation::Jkt("abc".to_string())).unwrap();
        assert_eq!(claims, serde_json::json!({ "jkt": "abc" }));
    }

    #[test]
    fn test_issued_tokens_debug_redacts() {
        let tokens = IssuedTokens {
            access_token: "eyJ.secret.access".to_string(),
            token_type: TokenType::Bearer,
            expires_in: 600,
            scope: "read".to_string(),
            refresh_token: Some("refresh-secret".to_string()),
            id_token: None,
            family_id: None,
            verdict: Verdict::Verified,
        };
        let debug = format!("{tokens:?}");
        assert!(!debug.contains("eyJ.secret.access"));
        assert!(!debug.contains("refresh-secret"));
    }
}
