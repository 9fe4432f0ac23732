//! Error taxonomy for the security core
//!
//! [`CoreError`] is the internal, log-facing error. Its `Display` output may
//! name the failing check and a reason but never carries raw secrets. What a
//! client sees is [`OAuthError`], a fixed code and description derived from it.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use oidclab_dpop::{DpopError, DpopErrorKind};

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// The verification step a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    /// CSRF `state` parameter
    State,
    /// PKCE verifier against stored challenge
    Pkce,
    /// `client_id` bound to a code or refresh token
    Client,
    /// `redirect_uri` bound to a code
    RedirectUri,
    /// DPoP proof validation
    DpopProof,
    /// DPoP key thumbprint against `cnf.jkt` or `dpop_jkt`
    DpopBinding,
    /// mTLS certificate thumbprint against `cnf.x5t#S256`
    Mtls,
    /// Requested scope against the original grant
    Scope,
    /// Access token signature, expiry or registration
    AccessToken,
    /// Refresh token lookup and family state
    RefreshToken,
    /// ID token signature and claims
    IdToken,
    /// OIDC nonce
    Nonce,
}

impl Check {
    /// Stable name used in logs and events
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Pkce => "pkce",
            Self::Client => "client",
            Self::RedirectUri => "redirect_uri",
            Self::DpopProof => "dpop_proof",
            Self::DpopBinding => "dpop_binding",
            Self::Mtls => "mtls",
            Self::Scope => "scope",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::IdToken => "id_token",
            Self::Nonce => "nonce",
        }
    }

    fn client_code(self) -> OAuthErrorCode {
        match self {
            Self::DpopProof => OAuthErrorCode::InvalidDpopProof,
            Self::Scope => OAuthErrorCode::InvalidScope,
            Self::AccessToken | Self::DpopBinding | Self::Mtls => OAuthErrorCode::InvalidToken,
            Self::State => OAuthErrorCode::InvalidRequest,
            Self::Pkce
            | Self::Client
            | Self::RedirectUri
            | Self::RefreshToken
            | Self::IdToken
            | Self::Nonce => OAuthErrorCode::InvalidGrant,
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the expiring key store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The operation did not complete within the configured bound
    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded
    #[error("store record serialization error: {0}")]
    Serialization(String),
}

/// Core error taxonomy
#[derive(Debug, Error)]
pub enum CoreError {
    /// Structurally invalid input; never bypassable by policy
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A check ran and failed
    #[error("{check} validation failed: {reason}")]
    ValidationFailed {
        /// Which check failed
        check: Check,
        /// Internal detail
        reason: String,
    },

    /// Never issued, already consumed, or expired past the grace period
    #[error("artifact not found or already consumed")]
    NotFound,

    /// Outside a time window
    #[error("{check} expired: {reason}")]
    Expired {
        /// Which check observed the expiry
        check: Check,
        /// Internal detail
        reason: String,
    },

    /// A single-use artifact was presented again
    #[error("{check} replay detected")]
    ReplayDetected {
        /// Which artifact was replayed
        check: Check,
    },

    /// Store failure or timeout; requests fail closed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration or missing dependency
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::ValidationFailed`]
    pub fn validation(check: Check, reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            check,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CoreError::Expired`]
    pub fn expired(check: Check, reason: impl Into<String>) -> Self {
        Self::Expired {
            check,
            reason: reason.into(),
        }
    }

    /// The check this error belongs to, if any
    pub fn check(&self) -> Option<Check> {
        match self {
            Self::ValidationFailed { check, .. }
            | Self::Expired { check, .. }
            | Self::ReplayDetected { check } => Some(*check),
            _ => None,
        }
    }

    /// Map a DPoP proof failure into the core taxonomy
    pub fn from_dpop(error: DpopError) -> Self {
        match error.kind() {
            DpopErrorKind::Malformed => Self::MalformedInput(error.to_string()),
            DpopErrorKind::ValidationFailed => match error {
                DpopError::ThumbprintMismatch => {
                    Self::validation(Check::DpopBinding, error.to_string())
                }
                other => Self::validation(Check::DpopProof, other.to_string()),
            },
            DpopErrorKind::Expired => Self::expired(Check::DpopProof, error.to_string()),
            DpopErrorKind::Replay => Self::ReplayDetected {
                check: Check::DpopProof,
            },
            DpopErrorKind::Internal => match error {
                DpopError::StorageError { reason } => Self::Store(StoreError::Backend(reason)),
                other => Self::Configuration(other.to_string()),
            },
        }
    }

    /// Client-facing error; never contains internal detail
    pub fn oauth_error(&self) -> OAuthError {
        let code = match self {
            Self::MalformedInput(_) => OAuthErrorCode::InvalidRequest,
            Self::ValidationFailed { check, .. }
            | Self::Expired { check, .. }
            | Self::ReplayDetected { check } => check.client_code(),
            Self::NotFound => OAuthErrorCode::InvalidGrant,
            Self::Store(_) | Self::Configuration(_) => OAuthErrorCode::ServerError,
        };
        OAuthError::from(code)
    }
}

/// OAuth 2.0 / RFC 9449 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    /// `invalid_request`
    InvalidRequest,
    /// `invalid_grant`
    InvalidGrant,
    /// `invalid_token`
    InvalidToken,
    /// `invalid_dpop_proof`
    InvalidDpopProof,
    /// `invalid_scope`
    InvalidScope,
    /// `server_error`
    ServerError,
}

impl OAuthErrorCode {
    /// Wire value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidToken => "invalid_token",
            Self::InvalidDpopProof => "invalid_dpop_proof",
            Self::InvalidScope => "invalid_scope",
            Self::ServerError => "server_error",
        }
    }

    /// Suggested HTTP status
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidToken => 401,
            Self::ServerError => 500,
            _ => 400,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::InvalidRequest => "The request is missing a parameter or is otherwise malformed",
            Self::InvalidGrant => "The provided authorization grant is invalid",
            Self::InvalidToken => "The access token is invalid",
            Self::InvalidDpopProof => "The DPoP proof is invalid",
            Self::InvalidScope => "The requested scope is invalid",
            Self::ServerError => "The server encountered an unexpected condition",
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OAuthError {
    /// Error code
    pub error: OAuthErrorCode,
    /// Fixed human-readable description
    pub error_description: &'static str,
    /// HTTP status hint
    #[serde(skip)]
    pub status: u16,
}

impl From<OAuthErrorCode> for OAuthError {
    fn from(code: OAuthErrorCode) -> Self {
        Self {
            error: code,
            error_description: code.description(),
            status: code.http_status(),
        }
    }
}
