//! DPoP proof generation and validation
//!
//! Generation is the client side: sign a fresh proof for a method/URI pair.
//! Validation is the server side and runs every RFC 9449 check in a fixed
//! order. Each check can be relaxed through [`DpopChecks`]; a relaxed check
//! still runs, and a failure it would have caused is recorded in
//! [`ValidatedProof::bypassed`] instead of rejecting the proof.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Header, Validation, decode, encode};
use tokio::sync::RwLock;

use crate::errors::DpopError;
use crate::helpers::{
    algorithm_to_jwt, clean_http_uri, constant_time_compare, jwk_to_decoding_key,
    private_key_to_encoding_key, public_key_to_jwk,
};
use crate::types::{
    DpopAlgorithm, DpopJwk, DpopKeyPair, DpopPayload, DpopProof, compute_access_token_hash,
    compute_jwk_thumbprint,
};
use crate::{DEFAULT_IAT_WINDOW_SECONDS, DPOP_JWT_TYPE, Result};

/// Current Unix time in seconds
pub(crate) fn unix_now() -> Result<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .map_err(|_| DpopError::InternalError {
            reason: "System clock before Unix epoch".to_string(),
        })
}

/// DPoP proof generator bound to one client key pair
#[derive(Debug, Clone)]
pub struct DpopProofGenerator {
    key_pair: DpopKeyPair,
}

impl DpopProofGenerator {
    /// Create a generator signing with `key_pair`
    #[must_use]
    pub fn new(key_pair: DpopKeyPair) -> Self {
        Self { key_pair }
    }

    /// Key pair used for signing
    #[must_use]
    pub fn key_pair(&self) -> &DpopKeyPair {
        &self.key_pair
    }

    /// Generate a proof for `method` and `uri` at the current time
    ///
    /// # Errors
    /// Returns error if the URI is invalid or signing fails
    pub fn generate(
        &self,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
    ) -> Result<DpopProof> {
        let jti = uuid::Uuid::new_v4().to_string();
        self.generate_at(method, uri, access_token, None, unix_now()?, &jti)
    }

    /// Generate a proof with explicit `iat` and `jti`
    ///
    /// # Errors
    /// Returns error if the URI is invalid or signing fails
    pub fn generate_at(
        &self,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        nonce: Option<&str>,
        iat: i64,
        jti: &str,
    ) -> Result<DpopProof> {
        let payload = DpopPayload {
            jti: jti.to_string(),
            htm: method.to_uppercase(),
            htu: clean_http_uri(uri)?,
            iat,
            ath: access_token.map(compute_access_token_hash),
            nonce: nonce.map(str::to_string),
        };

        let algorithm = algorithm_to_jwt(self.key_pair.algorithm).ok_or_else(|| {
            DpopError::CryptographicError {
                reason: format!("{} signing is not supported", self.key_pair.algorithm),
            }
        })?;

        let mut header = Header::new(algorithm);
        header.typ = Some(DPOP_JWT_TYPE.to_string());
        header.jwk = Some(public_key_to_jwk(
            &self.key_pair.public_key,
            self.key_pair.algorithm,
        )?);

        let encoding_key = private_key_to_encoding_key(&self.key_pair.private_key)?;
        let jwt = encode(&header, &payload, &encoding_key).map_err(|e| {
            DpopError::CryptographicError {
                reason: format!("JWT signing failed: {e}"),
            }
        })?;

        tracing::debug!(
            key_id = %self.key_pair.id,
            method = %payload.htm,
            uri = %payload.htu,
            "Generated DPoP proof"
        );

        DpopProof::parse(&jwt)
    }
}

/// Which DPoP checks are enforced
///
/// Every check is enforced by default. `allow_alg_none` is separate from the
/// others: relaxing the signature check never admits unsigned proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpopChecks {
    /// `typ` must be `dpop+jwt`
    pub typ: bool,
    /// Signature must verify against the embedded JWK
    pub signature: bool,
    /// `htm` must equal the request method
    pub htm: bool,
    /// `htu` must equal the normalised request URI
    pub htu: bool,
    /// `iat` must be inside the window
    pub iat: bool,
    /// `jti` must not have been seen before
    pub jti_replay: bool,
    /// `ath` must match the presented access token
    pub ath: bool,
    /// Accept `alg: none` proofs without a signature
    pub allow_alg_none: bool,
}

impl Default for DpopChecks {
    fn default() -> Self {
        Self::strict()
    }
}

impl DpopChecks {
    /// All checks enforced, unsigned proofs rejected
    #[must_use]
    pub fn strict() -> Self {
        Self {
            typ: true,
            signature: true,
            htm: true,
            htu: true,
            iat: true,
            jti_replay: true,
            ath: true,
            allow_alg_none: false,
        }
    }
}

/// Names used in [`ValidatedProof::bypassed`]
pub mod check {
    /// `typ` header
    pub const TYP: &str = "typ";
    /// Unsigned proof accepted
    pub const ALG_NONE: &str = "alg_none";
    /// Signature verification
    pub const SIGNATURE: &str = "signature";
    /// HTTP method binding
    pub const HTM: &str = "htm";
    /// HTTP URI binding
    pub const HTU: &str = "htu";
    /// Issued-at window
    pub const IAT: &str = "iat";
    /// Access token hash
    pub const ATH: &str = "ath";
    /// Replay cache
    pub const JTI_REPLAY: &str = "jti_replay";
}

/// A proof that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedProof {
    /// Public key embedded in the proof
    pub jwk: DpopJwk,
    /// RFC 7638 thumbprint of `jwk`
    pub thumbprint: String,
    /// Proof identifier
    pub jti: String,
    /// Issued-at (Unix seconds)
    pub iat: i64,
    /// Algorithm; `None` for an accepted unsigned proof
    pub algorithm: Option<DpopAlgorithm>,
    /// Relaxed checks that would have rejected this proof
    pub bypassed: Vec<&'static str>,
}

/// Replay cache for proof `jti` values
#[async_trait]
pub trait ReplayCache: Send + Sync + std::fmt::Debug {
    /// Record `jti` for `ttl`; returns `false` if it was already present
    async fn insert_once(&self, jti: &str, ttl: Duration) -> Result<bool>;
}

/// In-memory replay cache
#[derive(Debug, Default)]
pub struct MemoryReplayCache {
    seen: RwLock<HashMap<String, Instant>>,
}

impl MemoryReplayCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut seen = self.seen.write().await;
        let now = Instant::now();
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        before - seen.len()
    }
}

#[async_trait]
impl ReplayCache for MemoryReplayCache {
    async fn insert_once(&self, jti: &str, ttl: Duration) -> Result<bool> {
        let mut seen = self.seen.write().await;
        let now = Instant::now();
        if let Some(expires_at) = seen.get(jti)
            && *expires_at > now
        {
            return Ok(false);
        }
        seen.insert(jti.to_string(), now + ttl);
        Ok(true)
    }
}

/// Server-side DPoP proof validator
#[derive(Debug, Clone)]
pub struct DpopProofValidator {
    replay_cache: Arc<dyn ReplayCache>,
    iat_window_secs: i64,
}

impl DpopProofValidator {
    /// Create a validator with the default ±60s `iat` window
    #[must_use]
    pub fn new(replay_cache: Arc<dyn ReplayCache>) -> Self {
        Self {
            replay_cache,
            iat_window_secs: DEFAULT_IAT_WINDOW_SECONDS,
        }
    }

    /// Override the `iat` window
    #[must_use]
    pub fn with_iat_window(mut self, seconds: i64) -> Self {
        self.iat_window_secs = seconds;
        self
    }

    /// Accepted `iat` skew in seconds
    #[must_use]
    pub fn iat_window_secs(&self) -> i64 {
        self.iat_window_secs
    }

    /// Validate a compact DPoP proof against the request it arrived with
    ///
    /// `now` is the server time in Unix seconds. `access_token` is the token
    /// the proof must be bound to via `ath`, if any.
    ///
    /// # Errors
    /// Returns the first enforced check that failed
    pub async fn validate(
        &self,
        proof_jwt: &str,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
        now: i64,
        checks: &DpopChecks,
    ) -> Result<ValidatedProof> {
        let proof = DpopProof::parse(proof_jwt)?;
        let mut bypassed = Vec::new();

        gate(
            &mut bypassed,
            checks.typ,
            check::TYP,
            check_typ(&proof),
        )?;

        let algorithm = if proof.header.is_unsigned() {
            if !checks.allow_alg_none {
                return Err(DpopError::UnsupportedAlgorithm {
                    alg: proof.header.alg.clone(),
                });
            }
            bypassed.push(check::ALG_NONE);
            None
        } else {
            Some(
                proof
                    .header
                    .algorithm()
                    .ok_or_else(|| DpopError::UnsupportedAlgorithm {
                        alg: proof.header.alg.clone(),
                    })?,
            )
        };

        let jwk = proof
            .header
            .jwk
            .clone()
            .ok_or_else(|| DpopError::InvalidProofStructure {
                reason: "DPoP proof missing JWK in header".to_string(),
            })?;

        if let Some(algorithm) = algorithm {
            gate(
                &mut bypassed,
                checks.signature,
                check::SIGNATURE,
                verify_signature(proof_jwt, &jwk, algorithm),
            )?;
        }

        gate(
            &mut bypassed,
            checks.htm,
            check::HTM,
            check_htm(&proof.payload, method),
        )?;

        let expected_htu = clean_http_uri(uri)?;
        gate(
            &mut bypassed,
            checks.htu,
            check::HTU,
            check_htu(&proof.payload, &expected_htu),
        )?;

        gate(
            &mut bypassed,
            checks.iat,
            check::IAT,
            check_iat(&proof.payload, now, self.iat_window_secs),
        )?;

        gate(
            &mut bypassed,
            checks.ath,
            check::ATH,
            check_ath(&proof.payload, access_token),
        )?;

        let replay_ttl = Duration::from_secs((self.iat_window_secs.max(1) * 2) as u64);
        let first_use = self
            .replay_cache
            .insert_once(&proof.payload.jti, replay_ttl)
            .await?;
        let replay = if first_use {
            Ok(())
        } else {
            Err(DpopError::ReplayAttackDetected)
        };
        gate(&mut bypassed, checks.jti_replay, check::JTI_REPLAY, replay)?;

        let thumbprint = compute_jwk_thumbprint(&jwk)?;

        if !bypassed.is_empty() {
            tracing::warn!(
                checks = ?bypassed,
                "DPoP proof accepted with relaxed checks"
            );
        }

        Ok(ValidatedProof {
            jwk,
            thumbprint,
            jti: proof.payload.jti,
            iat: proof.payload.iat,
            algorithm,
            bypassed,
        })
    }
}

/// Compare a proof key thumbprint with a token's `cnf.jkt`
///
/// # Errors
/// Returns [`DpopError::ThumbprintMismatch`] if they differ
pub fn verify_jkt_binding(thumbprint: &str, expected_jkt: &str) -> Result<()> {
    if constant_time_compare(thumbprint, expected_jkt) {
        Ok(())
    } else {
        Err(DpopError::ThumbprintMismatch)
    }
}

/// Apply one check: an enforced failure propagates, a relaxed one is recorded
fn gate(
    bypassed: &mut Vec<&'static str>,
    enforce: bool,
    name: &'static str,
    outcome: Result<()>,
) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(error) if enforce => {
            tracing::debug!(check = name, error = %error, "DPoP check failed");
            Err(error)
        }
        Err(_) => {
            bypassed.push(name);
            Ok(())
        }
    }
}

fn check_typ(proof: &DpopProof) -> Result<()> {
    match proof.header.typ.as_deref() {
        Some(DPOP_JWT_TYPE) => Ok(()),
        _ => Err(DpopError::InvalidType),
    }
}

fn verify_signature(jwt: &str, jwk: &DpopJwk, algorithm: DpopAlgorithm) -> Result<()> {
    if !jwk.supports(algorithm) {
        return Err(DpopError::SignatureInvalid {
            reason: format!("JWK key type does not match {algorithm}"),
        });
    }

    let jwt_algorithm = algorithm_to_jwt(algorithm).ok_or_else(|| DpopError::SignatureInvalid {
        reason: format!("no verifier available for {algorithm}"),
    })?;

    let decoding_key = jwk_to_decoding_key(jwk)?;

    let mut validation = Validation::new(jwt_algorithm);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<serde_json::Value>(jwt, &decoding_key, &validation).map_err(|e| {
        DpopError::SignatureInvalid {
            reason: e.to_string(),
        }
    })?;

    Ok(())
}

fn check_htm(payload: &DpopPayload, method: &str) -> Result<()> {
    if payload.htm == method {
        Ok(())
    } else {
        Err(DpopError::HttpBindingFailed {
            reason: "htm does not match request method".to_string(),
        })
    }
}

fn check_htu(payload: &DpopPayload, expected_htu: &str) -> Result<()> {
    if payload.htu == expected_htu {
        Ok(())
    } else {
        Err(DpopError::HttpBindingFailed {
            reason: "htu does not match request URI".to_string(),
        })
    }
}

fn check_iat(payload: &DpopPayload, now: i64, window: i64) -> Result<()> {
    let skew = now - payload.iat;
    if skew.abs() > window {
        return Err(DpopError::ClockSkewTooLarge {
            skew_seconds: skew,
            max_skew_seconds: window,
        });
    }
    Ok(())
}

fn check_ath(payload: &DpopPayload, access_token: Option<&str>) -> Result<()> {
    match (access_token, payload.ath.as_deref()) {
        (None, None) => Ok(()),
        (Some(token), Some(ath)) => {
            if constant_time_compare(&compute_access_token_hash(token), ath) {
                Ok(())
            } else {
                Err(DpopError::AccessTokenHashFailed {
                    reason: "ath does not match access token".to_string(),
                })
            }
        }
        (Some(_), None) => Err(DpopError::AccessTokenHashFailed {
            reason: "ath claim required when presenting an access token".to_string(),
        }),
        (None, Some(_)) => Err(DpopError::AccessTokenHashFailed {
            reason: "ath claim present without an access token".to_string(),
        }),
    }
}
