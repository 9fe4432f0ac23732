//! Shared fixtures for the security core integration tests

#![allow(dead_code)]

use std::sync::Arc;

use oidclab_core::pkce::generate_challenge;
use oidclab_core::{
    AuthorizationRequest, ChallengeMethod, ClientType, CoreConfig, ManualClock, MemoryEventSink,
    SecureRandom, SecurityCore, TokenExchangeRequest, VulnerabilityPolicy,
};

pub const CLIENT_ID: &str = "demo-client";
pub const REDIRECT_URI: &str = "https://client.example.com/callback";
pub const TOKEN_ENDPOINT: &str = "https://as.example.com/token";
pub const RESOURCE_URI: &str = "https://rs.example.com/api/profile";
pub const SESSION: &str = "session-1";

pub struct Harness {
    pub core: Arc<SecurityCore>,
    pub clock: ManualClock,
    pub events: Arc<MemoryEventSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let clock = ManualClock::default();
        let events = Arc::new(MemoryEventSink::new());
        let core = SecurityCore::builder()
            .config(config)
            .clock(Arc::new(clock.clone()))
            .events(events.clone())
            .build()
            .expect("core builds");
        Self {
            core: Arc::new(core),
            clock,
            events,
        }
    }

    /// Issue an S256 code; returns `(code, verifier)`
    pub async fn authorize(&self, scope: &str, dpop_jkt: Option<&str>) -> (String, String) {
        let verifier = SecureRandom::code_verifier();
        let challenge = generate_challenge(&verifier).expect("challenge");
        let mut request = AuthorizationRequest::builder()
            .client_id(CLIENT_ID)
            .redirect_uri(REDIRECT_URI)
            .code_challenge(challenge.challenge)
            .code_challenge_method(ChallengeMethod::S256)
            .scope(scope)
            .subject_id("alice")
            .nonce("n-0S6_WzA2Mj".to_string())
            .build();
        request.dpop_jkt = dpop_jkt.map(str::to_string);

        let (code, _) = self
            .core
            .issue_authorization_code(&request, &VulnerabilityPolicy::strict())
            .await
            .expect("code issued");
        (code, verifier)
    }

    pub fn exchange(&self, code: &str, verifier: &str) -> TokenExchangeRequest {
        TokenExchangeRequest::builder()
            .code(code)
            .client_id(CLIENT_ID)
            .client_type(ClientType::Public)
            .redirect_uri(REDIRECT_URI)
            .code_verifier(verifier.to_string())
            .token_endpoint(TOKEN_ENDPOINT)
            .build()
    }

    pub fn now(&self) -> i64 {
        use oidclab_core::Clock;
        self.clock.unix_now()
    }
}

pub fn lax(configure: impl FnOnce(&mut VulnerabilityPolicy)) -> VulnerabilityPolicy {
    let mut policy = VulnerabilityPolicy::strict();
    configure(&mut policy);
    policy
}
