//! Vulnerability policy
//!
//! A [`VulnerabilityPolicy`] is a set of flags, each of which relaxes exactly
//! one check owned by exactly one component. Every flag defaults to `false`
//! (strict). Validators receive the policy as an immutable snapshot taken once
//! per request, so a reconfiguration never applies halfway through a flow.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use oidclab_dpop::DpopChecks;

use crate::error::{CoreError, Result};

macro_rules! vulnerability_policy {
    ($($(#[$doc:meta])* $flag:ident,)+) => {
        /// Per-request set of deliberately relaxed checks
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default, deny_unknown_fields)]
        pub struct VulnerabilityPolicy {
            $($(#[$doc])* pub $flag: bool,)+
        }

        impl VulnerabilityPolicy {
            /// Every flag name, in declaration order
            pub const FLAGS: &'static [&'static str] = &[$(stringify!($flag),)+];

            /// Value of the flag called `name`
            pub fn get(&self, name: &str) -> Option<bool> {
                match name {
                    $(stringify!($flag) => Some(self.$flag),)+
                    _ => None,
                }
            }

            /// Set the flag called `name`
            ///
            /// # Errors
            /// Returns [`CoreError::Configuration`] for an unknown flag
            pub fn set(&mut self, name: &str, value: bool) -> Result<()> {
                match name {
                    $(stringify!($flag) => self.$flag = value,)+
                    _ => {
                        return Err(CoreError::Configuration(format!(
                            "unknown vulnerability flag: {name}"
                        )));
                    }
                }
                Ok(())
            }

            /// Names of the flags currently set
            pub fn enabled_flags(&self) -> Vec<&'static str> {
                let mut enabled = Vec::new();
                $(if self.$flag {
                    enabled.push(stringify!($flag));
                })+
                enabled
            }
        }
    };
}

vulnerability_policy! {
    /// State: accept a callback whose state lookup missed
    skip_state_validation,
    /// State: accept an empty state parameter
    missing_state_allowed,
    /// State: do not consume state on successful match
    reusable_state,
    /// PKCE: issue and redeem codes without a challenge
    disable_pkce,
    /// PKCE: accept the `plain` method
    allow_plain_pkce,
    /// Code: accept a `redirect_uri` that merely starts with the registered one
    lax_redirect_uri_match,
    /// Code: do not consume codes on redemption
    allow_code_reuse,
    /// Code: restore the code after a failed PKCE check
    retry_code_on_pkce_failure,
    /// DPoP: accept a replayed `jti`
    skip_jti_replay_check,
    /// DPoP: accept unsigned (`alg: none`) proofs
    allow_alg_none,
    /// DPoP: accept any `typ` header
    skip_dpop_typ_check,
    /// DPoP: accept proofs whose signature does not verify
    skip_dpop_signature_check,
    /// DPoP: accept a mismatched `htm`
    skip_dpop_htm_check,
    /// DPoP: accept a mismatched `htu`
    skip_dpop_htu_check,
    /// DPoP: accept any `iat`
    skip_dpop_iat_check,
    /// DPoP: accept a missing or mismatched `ath`
    skip_dpop_ath_check,
    /// DPoP: accept a proof key that does not match `cnf.jkt`
    skip_dpop_binding_check,
    /// mTLS: accept a certificate that does not match `cnf.x5t#S256`
    skip_mtls_binding_check,
    /// Refresh: keep returning the same refresh token
    disable_refresh_rotation,
    /// Refresh: accept a rotated-out refresh token without revoking the family
    skip_refresh_replay_detection,
    /// ID token: skip the nonce comparison
    skip_nonce_validation,
}

impl VulnerabilityPolicy {
    /// Every check enforced
    pub fn strict() -> Self {
        Self::default()
    }

    /// Build a policy from a `{flag: bool}` map
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] if any key is not a known flag
    pub fn from_flags<'a, I>(flags: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let mut policy = Self::strict();
        for (name, value) in flags {
            policy.set(name, value)?;
        }
        Ok(policy)
    }

    /// Every flag with its current value
    pub fn to_flags(&self) -> BTreeMap<&'static str, bool> {
        Self::FLAGS
            .iter()
            .map(|name| (*name, self.get(name).unwrap_or(false)))
            .collect()
    }

    /// Whether no check is relaxed
    pub fn is_strict(&self) -> bool {
        self.enabled_flags().is_empty()
    }

    /// DPoP checks enforced under this policy
    pub fn dpop_checks(&self) -> DpopChecks {
        DpopChecks {
            typ: !self.skip_dpop_typ_check,
            signature: !self.skip_dpop_signature_check,
            htm: !self.skip_dpop_htm_check,
            htu: !self.skip_dpop_htu_check,
            iat: !self.skip_dpop_iat_check,
            jti_replay: !self.skip_jti_replay_check,
            ath: !self.skip_dpop_ath_check,
            allow_alg_none: self.allow_alg_none,
        }
    }

    /// Policy flag that relaxes a given DPoP check
    pub fn dpop_flag_for(name: &str) -> &'static str {
        use oidclab_dpop::check;
        match name {
            check::TYP => "skip_dpop_typ_check",
            check::SIGNATURE => "skip_dpop_signature_check",
            check::HTM => "skip_dpop_htm_check",
            check::HTU => "skip_dpop_htu_check",
            check::IAT => "skip_dpop_iat_check",
            check::ATH => "skip_dpop_ath_check",
            check::JTI_REPLAY => "skip_jti_replay_check",
            _ => "allow_alg_none",
        }
    }
}

/// How a check concluded when it did not reject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every enforced check passed
    Verified,
    /// At least one check failed and these flags let the request through
    Bypassed(Vec<&'static str>),
}

impl Verdict {
    /// Verdict for a list of flags that were exercised
    pub fn from_bypassed(flags: Vec<&'static str>) -> Self {
        if flags.is_empty() {
            Self::Verified
        } else {
            Self::Bypassed(flags)
        }
    }

    /// Whether any flag was exercised
    pub fn is_bypassed(&self) -> bool {
        matches!(self, Self::Bypassed(_))
    }

    /// Flags exercised, empty when verified
    pub fn flags(&self) -> &[&'static str] {
        match self {
            Self::Verified => &[],
            Self::Bypassed(flags) => flags,
        }
    }

    /// Combine with a later step's verdict
    #[must_use]
    pub fn merge(self, other: Verdict) -> Verdict {
        let mut flags = self.flags().to_vec();
        flags.extend_from_slice(other.flags());
        Self::from_bypassed(flags)
    }
}

/// Live, swappable policy
///
/// Writers replace the whole policy; readers take a [`snapshot`](Self::snapshot)
/// once per request and pass it down.
#[derive(Debug)]
pub struct PolicyHandle {
    current: ArcSwap<VulnerabilityPolicy>,
}

impl PolicyHandle {
    /// Start with `policy`
    pub fn new(policy: VulnerabilityPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    /// Immutable view for one request
    pub fn snapshot(&self) -> Arc<VulnerabilityPolicy> {
        self.current.load_full()
    }

    /// Replace the policy for subsequent requests
    pub fn replace(&self, policy: VulnerabilityPolicy) {
        let enabled = policy.enabled_flags();
        if enabled.is_empty() {
            tracing::info!("Vulnerability policy set to strict");
        } else {
            tracing::warn!(flags = ?enabled, "Vulnerability policy relaxes checks");
        }
        self.current.store(Arc::new(policy));
    }

    /// Toggle one flag for subsequent requests
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] for an unknown flag
    pub fn set_flag(&self, name: &str, value: bool) -> Result<()> {
        if VulnerabilityPolicy::strict().get(name).is_none() {
            return Err(CoreError::Configuration(format!(
                "unknown vulnerability flag: {name}"
            )));
        }
        self.current.rcu(|current| {
            let mut next = **current;
            // Name validated above
            let _ = next.set(name, value);
            next
        });
        tracing::warn!(flag = name, value, "Vulnerability flag changed");
        Ok(())
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(VulnerabilityPolicy::strict())
    }
}
