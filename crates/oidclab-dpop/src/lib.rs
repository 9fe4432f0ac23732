//! # oidclab DPoP - RFC 9449 proofs
//!
//! DPoP (Demonstrating Proof-of-Possession) binds access tokens to a
//! client-held key pair. This crate holds both halves of the exchange:
//!
//! - client side: [`DpopKeyPair`] generation and [`DpopProofGenerator`] /
//!   [`DpopProofParams`] for signing proofs
//! - server side: [`DpopProofValidator`], which runs the RFC 9449 checks under
//!   a [`DpopChecks`] profile and records a `jti` in a [`ReplayCache`]
//!
//! ## Architecture
//!
//! - `errors` - DPoP-specific error types
//! - `types` - algorithms, key pairs, JWKs, proof structure, thumbprints
//! - `helpers` - jsonwebtoken conversions, `htu` normalisation, proof builder
//! - `proof` - generation, validation, replay cache
//! - `test_utils` - proof forging for attack tests (feature: `test-utils`)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use oidclab_dpop::{
//!     DpopChecks, DpopKeyPair, DpopProofGenerator, DpopProofValidator, MemoryReplayCache,
//! };
//!
//! # tokio_test::block_on(async {
//! let now = 1_700_000_000;
//! let key = DpopKeyPair::generate_p256()?;
//! let proof = DpopProofGenerator::new(key)
//!     .generate_at("POST", "https://as.example.com/token", None, None, now, "jti-1")?;
//!
//! let validator = DpopProofValidator::new(Arc::new(MemoryReplayCache::new()));
//! let validated = validator
//!     .validate(proof.as_jwt(), "POST", "https://as.example.com/token", None, now, &DpopChecks::strict())
//!     .await?;
//! assert_eq!(validated.jti, "jti-1");
//! # Ok::<(), oidclab_dpop::DpopError>(())
//! # }).unwrap();
//! ```

pub mod errors;
pub mod helpers;
pub mod proof;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use errors::*;
pub use proof::*;
pub use types::*;

pub use helpers::{DpopProofParams, DpopProofParamsBuilder, clean_http_uri, constant_time_compare};

/// DPoP result type
pub type Result<T> = std::result::Result<T, DpopError>;

/// DPoP JWT header type as defined in RFC 9449
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Default accepted skew between proof `iat` and server time
pub const DEFAULT_IAT_WINDOW_SECONDS: i64 = 60;
