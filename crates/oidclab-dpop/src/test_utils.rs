//! Proof-forging helpers for attack-scenario tests
//!
//! Available with the `test-utils` feature. Nothing here should be reachable
//! from production code paths.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Value, json};

use crate::errors::DpopError;
use crate::helpers::{algorithm_to_jwt, clean_http_uri, private_key_to_encoding_key};
use crate::types::DpopKeyPair;
use crate::{DPOP_JWT_TYPE, Result};

fn encode_segment(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| DpopError::InternalError {
        reason: format!("Failed to serialize test segment: {e}"),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn decode_segment(segment: &str) -> Result<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| DpopError::InternalError {
            reason: format!("Test segment is not base64url: {e}"),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| DpopError::InternalError {
        reason: format!("Test segment is not JSON: {e}"),
    })
}

fn split(jwt: &str) -> Result<(&str, &str, &str)> {
    let mut parts = jwt.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) => Ok((h, p, s)),
        _ => Err(DpopError::InternalError {
            reason: "Test JWT does not have three segments".to_string(),
        }),
    }
}

/// Build an unsigned (`alg: none`) proof carrying `key_pair`'s public JWK
///
/// # Errors
/// Returns error if the URI is invalid
pub fn forge_unsigned_proof(
    key_pair: &DpopKeyPair,
    method: &str,
    uri: &str,
    iat: i64,
    jti: &str,
) -> Result<String> {
    let jwk = serde_json::to_value(key_pair.public_jwk()).map_err(|e| DpopError::InternalError {
        reason: format!("Failed to serialize JWK: {e}"),
    })?;
    let header = json!({
        "typ": DPOP_JWT_TYPE,
        "alg": "none",
        "jwk": jwk,
    });
    let payload = json!({
        "jti": jti,
        "htm": method,
        "htu": clean_http_uri(uri)?,
        "iat": iat,
    });
    Ok(format!(
        "{}.{}.",
        encode_segment(&header)?,
        encode_segment(&payload)?
    ))
}

/// Sign a proof whose header has been edited, so only the edited field is wrong
///
/// # Errors
/// Returns error if the URI is invalid or signing fails
pub fn sign_with_header(
    key_pair: &DpopKeyPair,
    method: &str,
    uri: &str,
    iat: i64,
    jti: &str,
    edit: impl FnOnce(&mut Value),
) -> Result<String> {
    let algorithm =
        algorithm_to_jwt(key_pair.algorithm).ok_or_else(|| DpopError::CryptographicError {
            reason: format!("{} signing is not supported", key_pair.algorithm),
        })?;
    let jwk = serde_json::to_value(key_pair.public_jwk()).map_err(|e| DpopError::InternalError {
        reason: format!("Failed to serialize JWK: {e}"),
    })?;
    let mut header = json!({
        "typ": DPOP_JWT_TYPE,
        "alg": key_pair.algorithm.as_str(),
        "jwk": jwk,
    });
    edit(&mut header);
    let payload = json!({
        "jti": jti,
        "htm": method,
        "htu": clean_http_uri(uri)?,
        "iat": iat,
    });

    let message = format!("{}.{}", encode_segment(&header)?, encode_segment(&payload)?);
    let key = private_key_to_encoding_key(&key_pair.private_key)?;
    let signature = jsonwebtoken::crypto::sign(message.as_bytes(), &key, algorithm).map_err(|e| {
        DpopError::CryptographicError {
            reason: format!("JWT signing failed: {e}"),
        }
    })?;
    Ok(format!("{message}.{signature}"))
}

/// Rewrite the payload of a signed proof, keeping the original signature
///
/// # Errors
/// Returns error if `jwt` is not a three-segment JSON JWT
pub fn tamper_payload(jwt: &str, edit: impl FnOnce(&mut Value)) -> Result<String> {
    let (header, payload, signature) = split(jwt)?;
    let mut claims = decode_segment(payload)?;
    edit(&mut claims);
    Ok(format!("{header}.{}.{signature}", encode_segment(&claims)?))
}

/// Rewrite the header of a signed proof, keeping the original signature
///
/// # Errors
/// Returns error if `jwt` is not a three-segment JSON JWT
pub fn tamper_header(jwt: &str, edit: impl FnOnce(&mut Value)) -> Result<String> {
    let (header, payload, signature) = split(jwt)?;
    let mut fields = decode_segment(header)?;
    edit(&mut fields);
    Ok(format!("{}.{payload}.{signature}", encode_segment(&fields)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DpopProof;

    #[test]
    fn test_forged_proof_parses_as_unsigned() {
        let key = DpopKeyPair::generate_p256().unwrap();
        let jwt = forge_unsigned_proof(&key, "POST", "https://as.example.com/token", 0, "x")
            .unwrap();
        let proof = DpopProof::parse(&jwt).unwrap();
        assert!(proof.header.is_unsigned());
        assert_eq!(proof.thumbprint().unwrap(), key.thumbprint);
    }
}
