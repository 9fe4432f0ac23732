//! Core configuration
//!
//! Lifetimes, windows, store bounds, signing and the initial vulnerability
//! policy. Loaded from TOML/YAML/JSON with environment overrides:
//!
//! ```toml
//! issuer = "https://as.example.com"
//! code_ttl_secs = 30
//! store_timeout_ms = 250
//!
//! [policy]
//! skip_state_validation = false
//! ```
//!
//! `OIDCLAB_CODE_TTL_SECS=45` overrides `code_ttl_secs`;
//! `OIDCLAB_POLICY__DISABLE_PKCE=true` overrides a nested policy flag.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::policy::VulnerabilityPolicy;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "OIDCLAB";

/// Hard upper bound on authorization code lifetime
pub const MAX_CODE_TTL_SECS: u64 = 60;

/// Hard upper bound on state lifetime
pub const MAX_STATE_TTL_SECS: u64 = 600;

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value is outside its allowed range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_issuer() -> String {
    "https://oidclab.local".to_string()
}

fn default_code_ttl() -> u64 {
    30
}

fn default_state_ttl() -> u64 {
    600
}

fn default_dpop_window() -> i64 {
    60
}

fn default_public_access_ttl() -> u64 {
    600
}

fn default_confidential_access_ttl() -> u64 {
    3600
}

fn default_refresh_ttl() -> u64 {
    14 * 24 * 3600
}

fn default_id_token_ttl() -> u64 {
    600
}

fn default_store_timeout() -> u64 {
    250
}

fn default_grace() -> u64 {
    60
}

/// Security core configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// `iss` of every token issued
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Authorization code lifetime (1..=60)
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: u64,

    /// State lifetime (1..=600)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,

    /// Accepted DPoP `iat` skew
    #[serde(default = "default_dpop_window")]
    pub dpop_iat_window_secs: i64,

    /// Access token lifetime for public clients (300..=900)
    #[serde(default = "default_public_access_ttl")]
    pub public_access_token_secs: u64,

    /// Access token lifetime for confidential clients (1800..=3600)
    #[serde(default = "default_confidential_access_ttl")]
    pub confidential_access_token_secs: u64,

    /// Refresh token family lifetime
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_secs: u64,

    /// ID token lifetime
    #[serde(default = "default_id_token_ttl")]
    pub id_token_secs: u64,

    /// Upper bound on any single store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// How long expired state/code records are kept to tell "expired" from "missing"
    #[serde(default = "default_grace")]
    pub expired_record_grace_secs: u64,

    /// HS256 signing secret; an ES256 key is generated when absent
    #[serde(default)]
    pub hs256_secret: Option<SecretString>,

    /// Initial vulnerability policy
    #[serde(default)]
    pub policy: VulnerabilityPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            code_ttl_secs: default_code_ttl(),
            state_ttl_secs: default_state_ttl(),
            dpop_iat_window_secs: default_dpop_window(),
            public_access_token_secs: default_public_access_ttl(),
            confidential_access_token_secs: default_confidential_access_ttl(),
            refresh_token_secs: default_refresh_ttl(),
            id_token_secs: default_id_token_ttl(),
            store_timeout_ms: default_store_timeout(),
            expired_record_grace_secs: default_grace(),
            hs256_secret: None,
            policy: VulnerabilityPolicy::strict(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a file (TOML, YAML, or JSON)
    ///
    /// Environment variables with the `OIDCLAB_` prefix override file settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, its format is unsupported,
    /// it does not parse, or a value is out of range
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, ENV_PREFIX)
    }

    /// Load configuration from a file with a custom environment prefix
    ///
    /// # Errors
    ///
    /// Same as [`from_file`](Self::from_file)
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{File, FileFormat};

        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let file = File::new(path.to_str().ok_or(ConfigError::UnsupportedFormat)?, format);
        Self::build(Some(file), env_prefix)
    }

    /// Load configuration from `OIDCLAB_*` environment variables only
    ///
    /// # Errors
    ///
    /// Returns an error if a variable does not parse or a value is out of range
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(None, ENV_PREFIX)
    }

    fn build(
        file: Option<config::File<config::FileSourceFile, config::FileFormat>>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check every value against its allowed range
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn in_range(name: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
            if (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!(
                    "{name} = {value} is outside {min}..={max}"
                )))
            }
        }

        if self.issuer.trim().is_empty() {
            return Err(ConfigError::Invalid("issuer must not be empty".to_string()));
        }
        in_range("code_ttl_secs", self.code_ttl_secs, 1, MAX_CODE_TTL_SECS)?;
        in_range("state_ttl_secs", self.state_ttl_secs, 1, MAX_STATE_TTL_SECS)?;
        in_range("public_access_token_secs", self.public_access_token_secs, 300, 900)?;
        in_range(
            "confidential_access_token_secs",
            self.confidential_access_token_secs,
            1800,
            3600,
        )?;
        in_range("refresh_token_secs", self.refresh_token_secs, 60, u64::from(u32::MAX))?;
        in_range("id_token_secs", self.id_token_secs, 60, 86_400)?;
        in_range("store_timeout_ms", self.store_timeout_ms, 1, 60_000)?;
        in_range("expired_record_grace_secs", self.expired_record_grace_secs, 0, 3600)?;
        if !(1..=600).contains(&self.dpop_iat_window_secs) {
            return Err(ConfigError::Invalid(format!(
                "dpop_iat_window_secs = {} is outside 1..=600",
                self.dpop_iat_window_secs
            )));
        }
        if let Some(secret) = &self.hs256_secret
            && secret.expose_secret().len() < 32
        {
            return Err(ConfigError::Invalid(
                "hs256_secret must be at least 32 bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Store call bound
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Grace period as a chrono duration
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expired_record_grace_secs as i64)
    }
}
