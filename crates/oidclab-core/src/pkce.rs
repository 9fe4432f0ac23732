//! PKCE (RFC 7636) challenge generation and verification
//!
//! Verifier format is checked on every path regardless of policy. The only
//! policy input here is `allow_plain_pkce`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, sha256_b64url};
use crate::error::{Check, CoreError, Result};
use crate::policy::VulnerabilityPolicy;

/// Minimum verifier length
pub const MIN_VERIFIER_LEN: usize = 43;

/// Maximum verifier length
pub const MAX_VERIFIER_LEN: usize = 128;

/// Length of an S256 challenge (base64url of 32 bytes)
pub const S256_CHALLENGE_LEN: usize = 43;

/// `code_challenge_method`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeMethod {
    /// base64url(SHA-256(verifier))
    #[serde(rename = "S256")]
    S256,
    /// challenge == verifier
    #[serde(rename = "plain")]
    Plain,
}

impl ChallengeMethod {
    /// Wire value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "S256" => Ok(Self::S256),
            "plain" => Ok(Self::Plain),
            _ => Err(CoreError::MalformedInput(
                "unsupported code_challenge_method".to_string(),
            )),
        }
    }
}

/// A challenge and the method that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// `code_challenge`
    pub challenge: String,
    /// `code_challenge_method`
    pub method: ChallengeMethod,
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// 43..=128 characters from the unreserved URI set
pub fn is_valid_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier.bytes().all(is_unreserved)
}

fn require_valid_verifier(verifier: &str) -> Result<()> {
    if is_valid_verifier(verifier) {
        Ok(())
    } else {
        Err(CoreError::MalformedInput(
            "code_verifier must be 43-128 unreserved characters".to_string(),
        ))
    }
}

/// Check the shape of a challenge presented at the authorization endpoint
///
/// # Errors
/// Returns [`CoreError::MalformedInput`] if it cannot be a valid challenge
pub fn validate_challenge_format(challenge: &str, method: ChallengeMethod) -> Result<()> {
    let well_formed = match method {
        ChallengeMethod::S256 => {
            challenge.len() == S256_CHALLENGE_LEN && challenge.bytes().all(is_unreserved)
        }
        ChallengeMethod::Plain => is_valid_verifier(challenge),
    };
    if well_formed {
        Ok(())
    } else {
        Err(CoreError::MalformedInput(format!(
            "code_challenge is not a valid {method} challenge"
        )))
    }
}

/// S256 challenge for `verifier`
///
/// # Errors
/// Returns [`CoreError::MalformedInput`] for a malformed verifier
pub fn generate_challenge(verifier: &str) -> Result<PkceChallenge> {
    require_valid_verifier(verifier)?;
    Ok(PkceChallenge {
        challenge: sha256_b64url(verifier.as_bytes()),
        method: ChallengeMethod::S256,
    })
}

/// `plain` challenge for `verifier`; only under `allow_plain_pkce`
///
/// # Errors
/// Returns [`CoreError::MalformedInput`] for a malformed verifier and
/// [`CoreError::ValidationFailed`] when the policy does not allow `plain`
pub fn generate_plain_challenge(
    verifier: &str,
    policy: &VulnerabilityPolicy,
) -> Result<PkceChallenge> {
    require_valid_verifier(verifier)?;
    if !policy.allow_plain_pkce {
        return Err(CoreError::validation(
            Check::Pkce,
            "plain code_challenge_method is not permitted",
        ));
    }
    Ok(PkceChallenge {
        challenge: verifier.to_string(),
        method: ChallengeMethod::Plain,
    })
}

/// Verify `verifier` against a stored challenge
///
/// # Errors
/// Returns [`CoreError::MalformedInput`] for a malformed verifier and
/// [`CoreError::ValidationFailed`] for a mismatch or a disallowed method
pub fn verify(
    verifier: &str,
    challenge: &str,
    method: ChallengeMethod,
    policy: &VulnerabilityPolicy,
) -> Result<()> {
    require_valid_verifier(verifier)?;

    let matches = match method {
        ChallengeMethod::S256 => constant_time_eq(&sha256_b64url(verifier.as_bytes()), challenge),
        ChallengeMethod::Plain => {
            if !policy.allow_plain_pkce {
                return Err(CoreError::validation(
                    Check::Pkce,
                    "plain code_challenge_method is not permitted",
                ));
            }
            constant_time_eq(verifier, challenge)
        }
    };

    if matches {
        Ok(())
    } else {
        Err(CoreError::validation(
            Check::Pkce,
            "code_verifier does not match code_challenge",
        ))
    }
}
