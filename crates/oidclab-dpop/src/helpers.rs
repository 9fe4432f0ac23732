//! Helper functions for jsonwebtoken integration
//!
//! Conversions between the DPoP types and jsonwebtoken types, request URI
//! normalisation for `htu`, and the proof builder.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bon::Builder;
use jsonwebtoken::jwk::{AlgorithmParameters, CommonParameters, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::jwk::{EllipticCurve, EllipticCurveKeyParameters, EllipticCurveKeyType};
use jsonwebtoken::jwk::{RSAKeyParameters, RSAKeyType};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p256::SecretKey;
use p256::pkcs8::EncodePrivateKey;

use crate::Result;
use crate::errors::DpopError;
use crate::types::{DpopAlgorithm, DpopJwk, DpopKeyPair, DpopPrivateKey, DpopProof, DpopPublicKey};

/// Convert DpopAlgorithm to jsonwebtoken Algorithm
///
/// ES512 has no jsonwebtoken backend; callers treat `None` as a verification
/// failure.
pub fn algorithm_to_jwt(algorithm: DpopAlgorithm) -> Option<Algorithm> {
    match algorithm {
        DpopAlgorithm::ES256 => Some(Algorithm::ES256),
        DpopAlgorithm::ES384 => Some(Algorithm::ES384),
        DpopAlgorithm::ES512 => None,
        DpopAlgorithm::RS256 => Some(Algorithm::RS256),
        DpopAlgorithm::RS384 => Some(Algorithm::RS384),
        DpopAlgorithm::RS512 => Some(Algorithm::RS512),
    }
}

/// Convert private key to jsonwebtoken EncodingKey
///
/// EC keys are stored as raw scalars and converted to PKCS#8 DER here, which
/// is what jsonwebtoken expects. RSA keys are stored as PKCS#1 DER already.
pub fn private_key_to_encoding_key(key: &DpopPrivateKey) -> Result<EncodingKey> {
    match key {
        DpopPrivateKey::EcdsaP256 { key_bytes } => {
            let secret_key = SecretKey::from_bytes(key_bytes.into()).map_err(|e| {
                DpopError::CryptographicError {
                    reason: format!("Invalid EC private key: {e}"),
                }
            })?;

            let pkcs8_der =
                secret_key
                    .to_pkcs8_der()
                    .map_err(|e| DpopError::CryptographicError {
                        reason: format!("Failed to convert EC key to PKCS#8: {e}"),
                    })?;

            Ok(EncodingKey::from_ec_der(pkcs8_der.as_bytes()))
        }
        DpopPrivateKey::Rsa { key_der } => Ok(EncodingKey::from_rsa_der(key_der)),
    }
}

/// Convert public key to a jsonwebtoken JWK for the proof header
pub fn public_key_to_jwk(key: &DpopPublicKey, algorithm: DpopAlgorithm) -> Result<Jwk> {
    let key_algorithm = match algorithm {
        DpopAlgorithm::ES256 => KeyAlgorithm::ES256,
        DpopAlgorithm::ES384 => KeyAlgorithm::ES384,
        DpopAlgorithm::RS256 => KeyAlgorithm::RS256,
        DpopAlgorithm::RS384 => KeyAlgorithm::RS384,
        DpopAlgorithm::RS512 => KeyAlgorithm::RS512,
        DpopAlgorithm::ES512 => {
            return Err(DpopError::CryptographicError {
                reason: "ES512 signing is not supported".to_string(),
            });
        }
    };

    let common = CommonParameters {
        public_key_use: Some(PublicKeyUse::Signature),
        key_operations: None,
        key_algorithm: Some(key_algorithm),
        key_id: None,
        x509_url: None,
        x509_chain: None,
        x509_sha1_fingerprint: None,
        x509_sha256_fingerprint: None,
    };

    let algorithm = match key {
        DpopPublicKey::EcdsaP256 { x, y } => {
            AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            })
        }
        DpopPublicKey::Rsa { n, e } => AlgorithmParameters::RSA(RSAKeyParameters {
            key_type: RSAKeyType::RSA,
            n: URL_SAFE_NO_PAD.encode(n),
            e: URL_SAFE_NO_PAD.encode(e),
        }),
    };

    Ok(Jwk { common, algorithm })
}

/// Build a jsonwebtoken DecodingKey from the proof's embedded JWK
pub fn jwk_to_decoding_key(jwk: &DpopJwk) -> Result<DecodingKey> {
    match jwk {
        DpopJwk::Ec { x, y, .. } => {
            DecodingKey::from_ec_components(x, y).map_err(|e| DpopError::SignatureInvalid {
                reason: format!("Failed to create EC decoding key: {e}"),
            })
        }
        DpopJwk::Rsa { n, e, .. } => {
            DecodingKey::from_rsa_components(n, e).map_err(|e| DpopError::SignatureInvalid {
                reason: format!("Invalid RSA key components: {e}"),
            })
        }
    }
}

/// Normalise a request URI to the `htu` form: scheme://host[:port]/path
///
/// Query and fragment are dropped; the path is kept verbatim, so a trailing
/// slash is significant.
pub fn clean_http_uri(uri: &str) -> Result<String> {
    let url = url::Url::parse(uri).map_err(|e| DpopError::InvalidRequest {
        reason: format!("Invalid URI format: {e}"),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DpopError::InvalidRequest {
            reason: format!("Unsupported URI scheme: {}", url.scheme()),
        });
    }

    let host = url.host_str().ok_or_else(|| DpopError::InvalidRequest {
        reason: "URI missing host".to_string(),
    })?;

    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    Ok(format!("{}://{}{}", url.scheme(), authority, url.path()))
}

/// Constant-time string comparison
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Builder parameters for DPoP proof generation
///
/// ```ignore
/// let proof = DpopProofParams::builder()
///     .http_method("POST")
///     .http_uri("https://as.example.com/token")
///     .build()
///     .sign(&key_pair)?;
/// ```
#[derive(Debug, Builder)]
#[builder(on(String, into))]
pub struct DpopProofParams {
    /// HTTP method (e.g., "GET", "POST")
    http_method: String,

    /// HTTP URI; query and fragment are stripped
    http_uri: String,

    /// Access token to bind via `ath`
    access_token: Option<String>,

    /// Server-provided nonce
    nonce: Option<String>,

    /// Explicit `iat`; defaults to the current time
    issued_at: Option<i64>,

    /// Explicit `jti`; defaults to a fresh UUID
    jti: Option<String>,
}

impl DpopProofParams {
    /// Sign the proof with the given key pair
    ///
    /// # Errors
    /// Returns error if the URI is invalid or signing fails
    pub fn sign(self, key_pair: &DpopKeyPair) -> Result<DpopProof> {
        let generator = crate::proof::DpopProofGenerator::new(key_pair.clone());
        let iat = match self.issued_at {
            Some(iat) => iat,
            None => crate::proof::unix_now()?,
        };
        let jti = self
            .jti
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        generator.generate_at(
            &self.http_method,
            &self.http_uri,
            self.access_token.as_deref(),
            self.nonce.as_deref(),
            iat,
            &jti,
        )
    }
}
