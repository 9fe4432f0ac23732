//! Secure random identifiers
//!
//! All opaque values handed to clients (codes, states, tokens) come from the
//! OS CSPRNG and are base64url-encoded without padding.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;

/// Entropy of authorization codes, in bytes
pub const CODE_BYTES: usize = 32;

/// Entropy of state values, in bytes (256 bits)
pub const STATE_BYTES: usize = 32;

/// Entropy of access and refresh tokens, in bytes
pub const TOKEN_BYTES: usize = 32;

/// Minimum entropy accepted for any opaque identifier, in bytes (128 bits)
pub const MIN_BYTES: usize = 16;

/// CSPRNG-backed generator for opaque identifiers
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureRandom;

impl SecureRandom {
    /// `len` random bytes (never fewer than [`MIN_BYTES`])
    pub fn bytes(len: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; len.max(MIN_BYTES)];
        OsRng.fill_bytes(&mut buffer);
        buffer
    }

    /// base64url encoding of `len` random bytes
    pub fn token(len: usize) -> String {
        URL_SAFE_NO_PAD.encode(Self::bytes(len))
    }

    /// Authorization code value
    pub fn code() -> String {
        Self::token(CODE_BYTES)
    }

    /// CSRF state value
    pub fn state() -> String {
        Self::token(STATE_BYTES)
    }

    /// Opaque refresh token
    pub fn refresh_token() -> String {
        Self::token(TOKEN_BYTES)
    }

    /// PKCE code verifier: 32 random bytes, 43 unreserved characters
    pub fn code_verifier() -> String {
        Self::token(32)
    }

    /// OIDC nonce
    pub fn nonce() -> String {
        Self::token(MIN_BYTES)
    }
}
