//! Constant-time comparison and hashing helpers

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of [`fingerprint`] output in hex characters
pub const FINGERPRINT_LEN: usize = 16;

/// Constant-time string equality
///
/// Length differences return early; lengths of the compared values are not
/// secret for any caller in this crate.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// base64url(SHA-256(input)) without padding
pub fn sha256_b64url(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input))
}

/// Lowercase hex SHA-256, used for store index keys derived from tokens
pub fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Fixed-length fingerprint for logs and security events
///
/// BLAKE3, truncated to [`FINGERPRINT_LEN`] hex characters. Safe to emit for
/// any secret: it reveals neither the value nor its length.
pub fn fingerprint(value: &str) -> String {
    let hash = blake3::hash(value.as_bytes());
    hash.to_hex()[..FINGERPRINT_LEN].to_string()
}
