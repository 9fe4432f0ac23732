//! DPoP error types
//!
//! Error messages never carry proof material (jti, keys, token values). Callers
//! that need to correlate failures with a specific proof should fingerprint the
//! proof themselves before logging.

use thiserror::Error;

/// Coarse classification of a DPoP failure.
///
/// The security core maps these onto its own error taxonomy: malformed input
/// is never policy-bypassable, validation failures are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpopErrorKind {
    /// The proof could not be parsed or is structurally invalid
    Malformed,
    /// A check ran and failed (signature, htm, htu, ath, binding)
    ValidationFailed,
    /// The proof is outside the accepted `iat` window
    Expired,
    /// The proof's `jti` has been seen before
    Replay,
    /// Key handling, signing or storage failure on our side
    Internal,
}

/// Errors produced while generating or validating DPoP proofs
#[derive(Debug, Error)]
pub enum DpopError {
    /// The JWT is not a structurally valid DPoP proof
    #[error("Invalid DPoP proof structure: {reason}")]
    InvalidProofStructure {
        /// What was wrong with the structure
        reason: String,
    },

    /// The `alg` header names an algorithm outside the allowlist
    #[error("Unsupported DPoP algorithm: {alg}")]
    UnsupportedAlgorithm {
        /// The algorithm name from the header
        alg: String,
    },

    /// The request method or URI supplied by the caller is unusable
    #[error("Invalid DPoP request binding input: {reason}")]
    InvalidRequest {
        /// What was wrong with the input
        reason: String,
    },

    /// The `typ` header is not `dpop+jwt`
    #[error("Invalid DPoP typ header")]
    InvalidType,

    /// Signature verification against the embedded JWK failed
    #[error("DPoP signature verification failed: {reason}")]
    SignatureInvalid {
        /// Verification failure detail
        reason: String,
    },

    /// `htm` or `htu` does not match the request
    #[error("DPoP HTTP binding failed: {reason}")]
    HttpBindingFailed {
        /// Which claim did not match
        reason: String,
    },

    /// `iat` is outside the accepted window around server time
    #[error("DPoP proof iat outside window: skew {skew_seconds}s exceeds {max_skew_seconds}s")]
    ClockSkewTooLarge {
        /// Observed difference between server time and `iat`
        skew_seconds: i64,
        /// Accepted window
        max_skew_seconds: i64,
    },

    /// The proof's `jti` was already recorded in the replay cache
    #[error("DPoP proof replay detected")]
    ReplayAttackDetected,

    /// `ath` is missing or does not match the presented access token
    #[error("DPoP access token hash check failed: {reason}")]
    AccessTokenHashFailed {
        /// Failure detail
        reason: String,
    },

    /// The proof key's thumbprint does not match the token's `cnf.jkt`
    #[error("DPoP key thumbprint does not match token binding")]
    ThumbprintMismatch,

    /// Key generation, conversion or signing failure
    #[error("DPoP cryptographic error: {reason}")]
    CryptographicError {
        /// Failure detail
        reason: String,
    },

    /// Replay cache backend failure
    #[error("DPoP replay cache error: {reason}")]
    StorageError {
        /// Failure detail
        reason: String,
    },

    /// Unexpected internal failure
    #[error("DPoP internal error: {reason}")]
    InternalError {
        /// Failure detail
        reason: String,
    },
}

impl DpopError {
    /// Classify this error for the caller's error taxonomy
    #[must_use]
    pub fn kind(&self) -> DpopErrorKind {
        match self {
            Self::InvalidProofStructure { .. }
            | Self::UnsupportedAlgorithm { .. }
            | Self::InvalidRequest { .. } => DpopErrorKind::Malformed,
            Self::InvalidType
            | Self::SignatureInvalid { .. }
            | Self::HttpBindingFailed { .. }
            | Self::AccessTokenHashFailed { .. }
            | Self::ThumbprintMismatch => DpopErrorKind::ValidationFailed,
            Self::ClockSkewTooLarge { .. } => DpopErrorKind::Expired,
            Self::ReplayAttackDetected => DpopErrorKind::Replay,
            Self::CryptographicError { .. }
            | Self::StorageError { .. }
            | Self::InternalError { .. } => DpopErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let malformed = DpopError::InvalidProofStructure {
            reason: "bad".to_string(),
        };
        assert_eq!(malformed.kind(), DpopErrorKind::Malformed);
        assert_eq!(
            DpopError::UnsupportedAlgorithm {
                alg: "none".to_string()
            }
            .kind(),
            DpopErrorKind::Malformed
        );
        assert_eq!(
            DpopError::ReplayAttackDetected.kind(),
            DpopErrorKind::Replay
        );
        assert_eq!(
            DpopError::ClockSkewTooLarge {
                skew_seconds: 90,
                max_skew_seconds: 60
            }
            .kind(),
            DpopErrorKind::Expired
        );
        assert_eq!(
            DpopError::ThumbprintMismatch.kind(),
            DpopErrorKind::ValidationFailed
        );
    }

    #[test]
    fn test_replay_message_does_not_echo_jti() {
        let message = DpopError::ReplayAttackDetected.to_string();
        assert_eq!(message, "DPoP proof replay detected");
    }
}
