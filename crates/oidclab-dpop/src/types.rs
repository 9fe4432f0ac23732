//! Core DPoP types and data structures
//!
//! This module implements the fundamental types for RFC 9449 DPoP (Demonstration
//! of Proof-of-Possession): algorithms, key pairs, JWKs, proof header/payload and
//! the RFC 7638 thumbprint used for `cnf.jkt` binding.

use std::fmt;
use std::time::SystemTime;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::DpopError;

/// DPoP signature algorithms accepted by the validator
///
/// `none` is deliberately not representable here; unsigned proofs are handled
/// as a separate, explicitly enabled case by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpopAlgorithm {
    /// ECDSA with P-256 and SHA-256
    ES256,
    /// ECDSA with P-384 and SHA-384
    ES384,
    /// ECDSA with P-521 and SHA-512
    ES512,
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 with SHA-512
    RS512,
}

impl DpopAlgorithm {
    /// All algorithms on the allowlist
    pub const ALL: [Self; 6] = [
        Self::ES256,
        Self::ES384,
        Self::ES512,
        Self::RS256,
        Self::RS384,
        Self::RS512,
    ];

    /// Get the algorithm name as specified in RFC 7518
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
        }
    }

    /// Parse a JOSE `alg` header value; `None` for anything off the allowlist
    #[must_use]
    pub fn from_header(alg: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == alg)
    }

    /// Whether this is an elliptic-curve algorithm
    #[must_use]
    pub fn is_ec(self) -> bool {
        matches!(self, Self::ES256 | Self::ES384 | Self::ES512)
    }

    /// Curve name expected in the JWK for EC algorithms
    #[must_use]
    pub fn expected_curve(self) -> Option<&'static str> {
        match self {
            Self::ES256 => Some("P-256"),
            Self::ES384 => Some("P-384"),
            Self::ES512 => Some("P-521"),
            Self::RS256 | Self::RS384 | Self::RS512 => None,
        }
    }
}

impl fmt::Display for DpopAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// DPoP key pair held by a client
///
/// The private key is zeroized on drop.
#[derive(Debug, Clone)]
pub struct DpopKeyPair {
    /// Unique identifier for this key pair
    pub id: String,

    /// Private key material (will be zeroized on drop)
    pub private_key: DpopPrivateKey,

    /// Public key material
    pub public_key: DpopPublicKey,

    /// JWK thumbprint for binding (RFC 7638)
    pub thumbprint: String,

    /// Signing algorithm
    pub algorithm: DpopAlgorithm,

    /// Key creation timestamp
    pub created_at: SystemTime,
}

impl DpopKeyPair {
    /// Generate a new P-256 (ES256) key pair
    ///
    /// # Errors
    /// Returns error if the public point cannot be encoded
    pub fn generate_p256() -> Result<Self, DpopError> {
        use p256::ecdsa::{SigningKey, VerifyingKey};
        use rand::rngs::OsRng;

        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);

        let private_bytes = signing_key.to_bytes();
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(private_bytes.as_ref());

        let public_point = verifying_key.to_encoded_point(false);
        let x_bytes = public_point
            .x()
            .ok_or_else(|| DpopError::CryptographicError {
                reason: "Failed to extract x coordinate from P-256 public key".to_string(),
            })?;
        let y_bytes = public_point
            .y()
            .ok_or_else(|| DpopError::CryptographicError {
                reason: "Failed to extract y coordinate from P-256 public key".to_string(),
            })?;

        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(x_bytes);
        y.copy_from_slice(y_bytes);

        let public_key = DpopPublicKey::EcdsaP256 { x, y };
        let thumbprint = compute_jwk_thumbprint(&public_key.to_jwk())?;

        Ok(Self {
            id: uuid::Uuid::now_v7().to_string(),
            private_key: DpopPrivateKey::EcdsaP256 { key_bytes },
            public_key,
            thumbprint,
            algorithm: DpopAlgorithm::ES256,
            created_at: SystemTime::now(),
        })
    }

    /// Generate a new RSA-2048 key pair signing with the given RS* algorithm
    ///
    /// # Errors
    /// Returns error if `algorithm` is not an RSA algorithm or key generation fails
    pub fn generate_rsa(algorithm: DpopAlgorithm) -> Result<Self, DpopError> {
        use rand::rngs::OsRng;
        use rsa::pkcs1::EncodeRsaPrivateKey;
        use rsa::{RsaPrivateKey, RsaPublicKey};

        if algorithm.is_ec() {
            return Err(DpopError::CryptographicError {
                reason: format!("{algorithm} is not an RSA algorithm"),
            });
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).map_err(|e| {
            DpopError::CryptographicError {
                reason: format!("Failed to generate RSA key: {e}"),
            }
        })?;
        let public_key = RsaPublicKey::from(&private_key);

        // jsonwebtoken signs RSA with PKCS#1 DER keys
        let key_der = private_key
            .to_pkcs1_der()
            .map_err(|e| DpopError::CryptographicError {
                reason: format!("Failed to encode RSA private key: {e}"),
            })?
            .as_bytes()
            .to_vec();

        let public_key = DpopPublicKey::Rsa {
            n: public_key.n().to_bytes_be(),
            e: public_key.e().to_bytes_be(),
        };
        let thumbprint = compute_jwk_thumbprint(&public_key.to_jwk())?;

        Ok(Self {
            id: uuid::Uuid::now_v7().to_string(),
            private_key: DpopPrivateKey::Rsa { key_der },
            public_key,
            thumbprint,
            algorithm,
            created_at: SystemTime::now(),
        })
    }

    /// Public JWK for embedding in proof headers
    #[must_use]
    pub fn public_jwk(&self) -> DpopJwk {
        self.public_key.to_jwk()
    }
}

/// Private key material for DPoP operations
#[derive(Debug, Clone)]
pub enum DpopPrivateKey {
    /// RSA private key
    Rsa {
        /// RSA private key in PKCS#1 DER format
        key_der: Vec<u8>,
    },
    /// ECDSA P-256 private key
    EcdsaP256 {
        /// P-256 private scalar
        key_bytes: [u8; 32],
    },
}

impl Zeroize for DpopPrivateKey {
    fn zeroize(&mut self) {
        match self {
            Self::Rsa { key_der } => key_der.zeroize(),
            Self::EcdsaP256 { key_bytes } => key_bytes.zeroize(),
        }
    }
}

impl Drop for DpopPrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Public key material for DPoP operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DpopPublicKey {
    /// RSA public key
    Rsa {
        /// RSA modulus (n parameter)
        n: Vec<u8>,
        /// RSA public exponent (e parameter)
        e: Vec<u8>,
    },
    /// ECDSA P-256 public key
    EcdsaP256 {
        /// X coordinate of the public key point
        x: [u8; 32],
        /// Y coordinate of the public key point
        y: [u8; 32],
    },
}

impl DpopPublicKey {
    /// Encode as a public JWK
    #[must_use]
    pub fn to_jwk(&self) -> DpopJwk {
        match self {
            Self::Rsa { n, e } => DpopJwk::Rsa {
                use_: Some("sig".to_string()),
                n: URL_SAFE_NO_PAD.encode(n),
                e: URL_SAFE_NO_PAD.encode(e),
            },
            Self::EcdsaP256 { x, y } => DpopJwk::Ec {
                use_: Some("sig".to_string()),
                crv: "P-256".to_string(),
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            },
        }
    }
}

/// DPoP JWT header as defined in RFC 9449
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopHeader {
    /// JWT type - must be "dpop+jwt"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    /// Raw `alg` value; kept as a string so that `none` can be observed
    pub alg: String,

    /// Public key the proof claims to be signed with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<DpopJwk>,
}

impl DpopHeader {
    /// Allowlisted algorithm named by the header, if any
    #[must_use]
    pub fn algorithm(&self) -> Option<DpopAlgorithm> {
        DpopAlgorithm::from_header(&self.alg)
    }

    /// Whether the header declares an unsigned proof
    #[must_use]
    pub fn is_unsigned(&self) -> bool {
        self.alg.eq_ignore_ascii_case("none")
    }
}

/// DPoP JWT payload as defined in RFC 9449
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpopPayload {
    /// JWT ID - unique identifier for replay prevention
    pub jti: String,

    /// HTTP method being bound to this proof
    pub htm: String,

    /// HTTP URI being bound to this proof (without query/fragment)
    pub htu: String,

    /// Issued at timestamp (Unix seconds)
    pub iat: i64,

    /// Access token hash (when binding to an access token)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,

    /// Server-provided nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// JSON Web Key representation for DPoP public keys
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kty")]
pub enum DpopJwk {
    /// RSA public key in JWK format
    #[serde(rename = "RSA")]
    Rsa {
        /// Key usage
        #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
        use_: Option<String>,

        /// RSA modulus (base64url-encoded)
        n: String,

        /// RSA public exponent (base64url-encoded)
        e: String,
    },

    /// Elliptic Curve public key in JWK format
    #[serde(rename = "EC")]
    Ec {
        /// Key usage
        #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
        use_: Option<String>,

        /// Elliptic curve name
        crv: String,

        /// X coordinate (base64url-encoded)
        x: String,

        /// Y coordinate (base64url-encoded)
        y: String,
    },
}

/// JWK members that only appear in private keys
const PRIVATE_JWK_MEMBERS: &[&str] = &["d", "p", "q", "dp", "dq", "qi", "oth", "k"];

impl DpopJwk {
    /// Parse a header `jwk` value, rejecting private key material
    ///
    /// # Errors
    /// Returns [`DpopError::InvalidProofStructure`] if the value is not a public
    /// EC or RSA key
    pub fn from_value(value: &serde_json::Value) -> Result<Self, DpopError> {
        let object = value
            .as_object()
            .ok_or_else(|| DpopError::InvalidProofStructure {
                reason: "jwk header is not a JSON object".to_string(),
            })?;

        if PRIVATE_JWK_MEMBERS
            .iter()
            .any(|member| object.contains_key(*member))
        {
            return Err(DpopError::InvalidProofStructure {
                reason: "jwk header contains private key material".to_string(),
            });
        }

        serde_json::from_value(value.clone()).map_err(|e| DpopError::InvalidProofStructure {
            reason: format!("Invalid JWK in header: {e}"),
        })
    }

    /// Whether this key can verify signatures made with `algorithm`
    #[must_use]
    pub fn supports(&self, algorithm: DpopAlgorithm) -> bool {
        match self {
            Self::Rsa { .. } => !algorithm.is_ec(),
            Self::Ec { crv, .. } => algorithm.expected_curve() == Some(crv.as_str()),
        }
    }
}

/// Complete DPoP proof JWT
#[derive(Debug, Clone)]
pub struct DpopProof {
    /// JWT header
    pub header: DpopHeader,

    /// JWT payload
    pub payload: DpopPayload,

    /// The complete compact JWT
    jwt: String,
}

impl DpopProof {
    /// Wrap an already-serialized proof with its decoded parts
    #[must_use]
    pub fn new(header: DpopHeader, payload: DpopPayload, jwt: String) -> Self {
        Self {
            header,
            payload,
            jwt,
        }
    }

    /// Compact JWT for the `DPoP` HTTP header
    #[must_use]
    pub fn as_jwt(&self) -> &str {
        &self.jwt
    }

    /// Decode a compact DPoP JWT without verifying its signature
    ///
    /// Only structure is checked here: three segments, base64url JSON header
    /// and payload, required claims present, a public `jwk`. Signature,
    /// binding and freshness checks belong to the validator.
    ///
    /// # Errors
    /// Returns [`DpopError::InvalidProofStructure`] for anything unparseable
    pub fn parse(jwt: &str) -> Result<Self, DpopError> {
        let mut segments = jwt.split('.');
        let (Some(header_b64), Some(payload_b64), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(DpopError::InvalidProofStructure {
                reason: "expected three dot-separated segments".to_string(),
            });
        };

        let header_value = decode_segment(header_b64, "header")?;
        let alg = header_value
            .get("alg")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| DpopError::InvalidProofStructure {
                reason: "missing alg header".to_string(),
            })?
            .to_string();
        let typ = header_value
            .get("typ")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let jwk = header_value
            .get("jwk")
            .map(DpopJwk::from_value)
            .transpose()?;

        let payload_value = decode_segment(payload_b64, "payload")?;
        let payload: DpopPayload =
            serde_json::from_value(payload_value).map_err(|e| DpopError::InvalidProofStructure {
                reason: format!("invalid proof claims: {e}"),
            })?;

        if payload.jti.is_empty() {
            return Err(DpopError::InvalidProofStructure {
                reason: "empty jti claim".to_string(),
            });
        }
        if payload.htm.is_empty() || payload.htu.is_empty() {
            return Err(DpopError::InvalidProofStructure {
                reason: "empty htm or htu claim".to_string(),
            });
        }

        Ok(Self::new(DpopHeader { typ, alg, jwk }, payload, jwt.to_string()))
    }

    /// Get the JWK thumbprint of the embedded key
    ///
    /// # Errors
    /// Returns error if the proof carries no key
    pub fn thumbprint(&self) -> Result<String, DpopError> {
        let jwk = self
            .header
            .jwk
            .as_ref()
            .ok_or_else(|| DpopError::InvalidProofStructure {
                reason: "DPoP proof missing JWK in header".to_string(),
            })?;
        compute_jwk_thumbprint(jwk)
    }

    /// Create a builder for DPoP proof generation
    ///
    /// # Example
    /// ```ignore
    /// let proof = DpopProof::builder()
    ///     .http_method("GET")
    ///     .http_uri("https://api.example.com/resource")
    ///     .access_token("token_value")
    ///     .build()
    ///     .sign(&key_pair)?;
    /// ```
    pub fn builder() -> crate::helpers::DpopProofParamsBuilder {
        crate::helpers::DpopProofParams::builder()
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<serde_json::Value, DpopError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| DpopError::InvalidProofStructure {
            reason: format!("{name} is not base64url: {e}"),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| DpopError::InvalidProofStructure {
        reason: format!("{name} is not JSON: {e}"),
    })
}

/// Compute JWK thumbprint as defined in RFC 7638
///
/// # Errors
/// Returns error if the canonical member set cannot be serialized
pub fn compute_jwk_thumbprint(jwk: &DpopJwk) -> Result<String, DpopError> {
    // Required members only, in lexicographic order
    let canonical_jwk = match jwk {
        DpopJwk::Rsa { n, e, .. } => {
            serde_json::json!({
                "e": e,
                "kty": "RSA",
                "n": n
            })
        }
        DpopJwk::Ec { crv, x, y, .. } => {
            serde_json::json!({
                "crv": crv,
                "kty": "EC",
                "x": x,
                "y": y
            })
        }
    };

    let canonical_json =
        serde_json::to_string(&canonical_jwk).map_err(|e| DpopError::CryptographicError {
            reason: format!("Failed to serialize JWK for thumbprint: {e}"),
        })?;

    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical_json.as_bytes())))
}

/// `ath` value for an access token: base64url(SHA-256(token))
#[must_use]
pub fn compute_access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}
