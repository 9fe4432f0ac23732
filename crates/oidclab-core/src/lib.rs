//! # oidclab core - OAuth 2.0 / OIDC security validation
//!
//! The checks an authorization server and its resource servers run on every
//! request, each of which can be relaxed one at a time through a
//! [`VulnerabilityPolicy`] to demonstrate the attack it prevents:
//!
//! - single-use CSRF `state` bound to a session ([`StateBinder`])
//! - single-use, short-lived authorization codes with PKCE
//!   ([`AuthorizationCodeIssuer`], [`pkce`])
//! - DPoP proofs with `jti` replay detection and key binding ([`DpopVerifier`])
//! - mTLS certificate-bound tokens ([`MtlsBinder`])
//! - refresh token rotation with family revocation on reuse
//!   ([`RefreshRotationManager`])
//!
//! Relaxed checks never pass silently: every operation returns a [`Verdict`]
//! naming the flags that let it through, and records a [`SecurityEvent`] with
//! outcome [`EventOutcome::Bypassed`].
//!
//! ## Architecture
//!
//! - `store` - expiring key/value store with atomic consume; in-memory backend
//! - `redis_store` - Redis backend (feature: `redis-store`)
//! - `policy` - vulnerability flags, verdicts, live policy handle
//! - `events` - security event model and sinks
//! - `state`, `code`, `pkce`, `dpop`, `mtls`, `tokens`, `refresh` - the checks
//! - `security` - [`SecurityCore`], one facade over all of the above
//!
//! ## Example
//!
//! ```ignore
//! let core = SecurityCore::in_memory(CoreConfig::from_env()?)?;
//! let policy = core.policy_snapshot();
//!
//! let state = core.issue_state(&session_id).await?;
//! // ... redirect, callback ...
//! core.validate_state(&session_id, &returned_state, &policy).await?;
//! ```

pub mod clock;
pub mod code;
pub mod config;
pub mod crypto;
pub mod dpop;
pub mod error;
pub mod events;
pub mod mtls;
pub mod pkce;
pub mod policy;
pub mod random;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod refresh;
pub mod security;
pub mod state;
pub mod store;
pub mod tokens;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use code::{
    AuthorizationCode, AuthorizationCodeIssuer, AuthorizationRequest, CodeRedemption,
    MAX_CODE_TTL_SECS, RedeemedCode,
};
pub use config::{ConfigError, CoreConfig};
pub use dpop::{CheckedProof, DpopProofRequest, DpopVerifier, StoreReplayCache};
pub use error::{Check, CoreError, OAuthError, OAuthErrorCode, Result, StoreError};
pub use events::{
    EventOutcome, EventSink, EventType, MemoryEventSink, NoopEventSink, SecurityEvent,
    TracingEventSink,
};
pub use mtls::{CertificateBinding, MtlsBinder};
pub use pkce::{ChallengeMethod, PkceChallenge};
pub use policy::{PolicyHandle, Verdict, VulnerabilityPolicy};
pub use random::SecureRandom;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use refresh::{FamilyAccessToken, RefreshRequest, RefreshRotationManager, RefreshTokenFamily};
pub use security::{
    ResourceAccess, ResourceRequest, SecurityCore, SecurityCoreBuilder, TokenExchangeRequest,
};
pub use state::{StateBinder, StateRecord};
pub use store::{ExpiringKeyStore, Lookup, MemoryStore, Namespace, RecordStore};
pub use tokens::{
    AccessTokenClaims, BoundToken, ClientType, Confirmation, Grant, IdTokenClaims, IssuedTokens,
    TokenIssueRequest, TokenIssuer, TokenLifetimes, TokenSigner, TokenType, ValidatedIdToken,
};
