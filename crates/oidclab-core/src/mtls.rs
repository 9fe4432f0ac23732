//! Certificate-bound tokens (RFC 8705)
//!
//! Only the application-layer thumbprint comparison lives here. Chain, expiry
//! and revocation checks belong to the TLS terminator that hands us the peer
//! certificate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::crypto::{constant_time_eq, sha256_b64url};
use crate::error::{Check, CoreError, Result};
use crate::events::{EventOutcome, EventSink, EventType, SecurityEvent};
use crate::policy::{Verdict, VulnerabilityPolicy};
use crate::tokens::Confirmation;

/// Thumbprint of the peer certificate on one TLS connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBinding {
    /// base64url(SHA-256(DER))
    pub cert_thumbprint: String,
}

impl CertificateBinding {
    /// Derive the binding from DER bytes
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedInput`] for an empty certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        if der.is_empty() {
            return Err(CoreError::MalformedInput(
                "client certificate is empty".to_string(),
            ));
        }
        Ok(Self {
            cert_thumbprint: MtlsBinder::thumbprint(der),
        })
    }
}

/// Computes and checks `x5t#S256` bindings
#[derive(Debug, Clone)]
pub struct MtlsBinder {
    clock: SharedClock,
    events: Arc<dyn EventSink>,
}

impl MtlsBinder {
    /// Create a binder reporting to `events`, stamped by `clock`
    pub fn new(clock: SharedClock, events: Arc<dyn EventSink>) -> Self {
        Self { clock, events }
    }

    /// base64url SHA-256 of the DER certificate
    pub fn thumbprint(der: &[u8]) -> String {
        sha256_b64url(der)
    }

    /// `cnf` claim for a token bound to `thumbprint`
    pub fn bind_token(thumbprint: &str) -> Confirmation {
        Confirmation::X5tS256(thumbprint.to_string())
    }

    /// Compare the live certificate thumbprint with the token's `cnf`
    ///
    /// # Errors
    /// Returns [`CoreError::ValidationFailed`] with [`Check::Mtls`] if the
    /// token is not certificate-bound or the thumbprints differ
    pub async fn validate_binding(
        &self,
        live_thumbprint: &str,
        cnf: &Confirmation,
        policy: &VulnerabilityPolicy,
    ) -> Result<Verdict> {
        let matches = match cnf {
            Confirmation::X5tS256(expected) => constant_time_eq(live_thumbprint, expected),
            Confirmation::Jkt(_) => false,
        };

        if matches {
            self.emit(EventOutcome::Success, None).await;
            return Ok(Verdict::Verified);
        }

        if policy.skip_mtls_binding_check {
            tracing::warn!("Certificate mismatch accepted by skip_mtls_binding_check");
            self.emit(EventOutcome::Bypassed, Some("skip_mtls_binding_check"))
                .await;
            return Ok(Verdict::Bypassed(vec!["skip_mtls_binding_check"]));
        }

        tracing::warn!("Client certificate does not match token binding");
        self.emit(EventOutcome::Failure, None).await;
        Err(CoreError::validation(
            Check::Mtls,
            "client certificate does not match cnf.x5t#S256",
        ))
    }

    async fn emit(&self, outcome: EventOutcome, flag: Option<&str>) {
        let mut event =
            SecurityEvent::new(EventType::MtlsBindingChecked, outcome).at(self.clock.now());
        if let Some(flag) = flag {
            event = event.with_meta("flag", flag);
        }
        self.events.record(event).await;
    }
}

/// Require a client certificate where a token is certificate-bound
pub(crate) fn missing_certificate(policy: &VulnerabilityPolicy) -> Result<Verdict> {
    if policy.skip_mtls_binding_check {
        Ok(Verdict::Bypassed(vec!["skip_mtls_binding_check"]))
    } else {
        Err(CoreError::validation(
            Check::Mtls,
            "token is certificate-bound but no client certificate was presented",
        ))
    }
}
