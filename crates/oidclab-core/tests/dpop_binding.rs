//! DPoP-bound tokens from the token endpoint to the resource server

mod common;

use common::{Harness, RESOURCE_URI, TOKEN_ENDPOINT, lax};
use oidclab_core::{
    Check, Confirmation, CoreError, EventOutcome, EventType, OAuthErrorCode, RefreshRequest,
    ResourceRequest, SecureRandom, TokenType, VulnerabilityPolicy,
};
use oidclab_dpop::test_utils::forge_unsigned_proof;
use oidclab_dpop::{DpopKeyPair, DpopProofGenerator};
use pretty_assertions::assert_eq;

struct Client {
    generator: DpopProofGenerator,
}

impl Client {
    fn new() -> Self {
        Self {
            generator: DpopProofGenerator::new(DpopKeyPair::generate_p256().unwrap()),
        }
    }

    fn thumbprint(&self) -> String {
        self.generator.key_pair().thumbprint.clone()
    }

    fn proof(&self, harness: &Harness, method: &str, uri: &str, access_token: Option<&str>) -> String {
        let jti = SecureRandom::nonce();
        self.generator
            .generate_at(method, uri, access_token, None, harness.now(), &jti)
            .unwrap()
            .as_jwt()
            .to_string()
    }
}

async fn dpop_tokens(harness: &Harness, client: &Client) -> oidclab_core::IssuedTokens {
    let (code, verifier) = harness.authorize("read", None).await;
    let mut request = harness.exchange(&code, &verifier);
    request.dpop_proof = Some(client.proof(harness, "POST", TOKEN_ENDPOINT, None));
    harness
        .core
        .exchange_authorization_code(&request, &VulnerabilityPolicy::strict())
        .await
        .unwrap()
}

fn resource(access_token: &str, proof: Option<String>) -> ResourceRequest {
    ResourceRequest {
        access_token: access_token.to_string(),
        method: "GET".to_string(),
        uri: RESOURCE_URI.to_string(),
        dpop_proof: proof,
        client_cert_der: None,
    }
}

#[tokio::test]
async fn test_bound_token_requires_matching_proof() {
    let harness = Harness::new();
    let strict = VulnerabilityPolicy::strict();
    let client = Client::new();

    let tokens = dpop_tokens(&harness, &client).await;
    assert_eq!(tokens.token_type, TokenType::DPoP);
    let bound = harness
        .core
        .introspect_access_token(&tokens.access_token)
        .await
        .unwrap();
    assert_eq!(bound.cnf, Some(Confirmation::Jkt(client.thumbprint())));

    // Holder of the key
    let proof = client.proof(&harness, "GET", RESOURCE_URI, Some(&tokens.access_token));
    let access = harness
        .core
        .authorize_resource_request(&resource(&tokens.access_token, Some(proof)), &strict)
        .await
        .unwrap();
    assert_eq!(access.token.token_id, bound.token_id);

    // Stolen token, no proof
    let error = harness
        .core
        .authorize_resource_request(&resource(&tokens.access_token, None), &strict)
        .await
        .unwrap_err();
    assert_eq!(error.check(), Some(Check::DpopBinding));

    // Stolen token, attacker's own key
    let attacker = Client::new();
    let proof = attacker.proof(&harness, "GET", RESOURCE_URI, Some(&tokens.access_token));
    let error = harness
        .core
        .authorize_resource_request(&resource(&tokens.access_token, Some(proof)), &strict)
        .await
        .unwrap_err();
    assert_eq!(error.check(), Some(Check::DpopBinding));
    assert_eq!(error.oauth_error().error, OAuthErrorCode::InvalidToken);

    assert_eq!(
        harness
            .events
            .count(EventType::ResourceAccess, EventOutcome::Failure),
        2
    );
}

#[tokio::test]
async fn test_proof_replay_rejected() {
    let harness = Harness::new();
    let strict = VulnerabilityPolicy::strict();
    let client = Client::new();
    let tokens = dpop_tokens(&harness, &client).await;

    let proof = client.proof(&harness, "GET", RESOURCE_URI, Some(&tokens.access_token));
    let request = resource(&tokens.access_token, Some(proof));
    harness
        .core
        .authorize_resource_request(&request, &strict)
        .await
        .unwrap();

    let replay = harness
        .core
        .authorize_resource_request(&request, &strict)
        .await
        .unwrap_err();
    assert!(matches!(
        replay,
        CoreError::ReplayDetected {
            check: Check::DpopProof
        }
    ));
    assert_eq!(replay.oauth_error().error, OAuthErrorCode::InvalidDpopProof);
}

#[tokio::test]
async fn test_proof_must_carry_ath() {
    let harness = Harness::new();
    let client = Client::new();
    let tokens = dpop_tokens(&harness, &client).await;

    let proof = client.proof(&harness, "GET", RESOURCE_URI, None);
    let error = harness
        .core
        .authorize_resource_request(
            &resource(&tokens.access_token, Some(proof)),
            &VulnerabilityPolicy::strict(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.check(), Some(Check::DpopProof));
}

/// A bad proof at the token endpoint does not burn the code
#[tokio::test]
async fn test_trailing_slash_htu_rejected_before_code_is_consumed() {
    let harness = Harness::new();
    let strict = VulnerabilityPolicy::strict();
    let client = Client::new();
    let (code, verifier) = harness.authorize("read", None).await;

    let mut request = harness.exchange(&code, &verifier);
    request.dpop_proof = Some(client.proof(&harness, "POST", &format!("{TOKEN_ENDPOINT}/"), None));
    let error = harness
        .core
        .exchange_authorization_code(&request, &strict)
        .await
        .unwrap_err();
    assert_eq!(error.check(), Some(Check::DpopProof));

    request.dpop_proof = Some(client.proof(&harness, "POST", TOKEN_ENDPOINT, None));
    let tokens = harness
        .core
        .exchange_authorization_code(&request, &strict)
        .await
        .unwrap();
    assert_eq!(tokens.token_type, TokenType::DPoP);
}

#[tokio::test]
async fn test_unsigned_proof_rejected_unless_allowed() {
    let harness = Harness::new();
    let client = Client::new();
    let (code, verifier) = harness.authorize("read", None).await;

    let forged = forge_unsigned_proof(
        client.generator.key_pair(),
        "POST",
        TOKEN_ENDPOINT,
        harness.now(),
        "forged-1",
    )
    .unwrap();
    let mut request = harness.exchange(&code, &verifier);
    request.dpop_proof = Some(forged);

    let error = harness
        .core
        .exchange_authorization_code(&request, &VulnerabilityPolicy::strict())
        .await
        .unwrap_err();
    assert!(matches!(error, CoreError::MalformedInput(_)));

    let forged = forge_unsigned_proof(
        client.generator.key_pair(),
        "POST",
        TOKEN_ENDPOINT,
        harness.now(),
        "forged-2",
    )
    .unwrap();
    request.dpop_proof = Some(forged);
    let tokens = harness
        .core
        .exchange_authorization_code(&request, &lax(|p| p.allow_alg_none = true))
        .await
        .unwrap();
    assert_eq!(tokens.verdict.flags(), ["allow_alg_none"]);
}

#[tokio::test]
async fn test_code_bound_to_dpop_jkt() {
    let harness = Harness::new();
    let strict = VulnerabilityPolicy::strict();
    let client = Client::new();
    let attacker = Client::new();
    let (code, verifier) = harness.authorize("read", Some(&client.thumbprint())).await;

    let mut request = harness.exchange(&code, &verifier);
    request.dpop_proof = Some(attacker.proof(&harness, "POST", TOKEN_ENDPOINT, None));
    let error = harness
        .core
        .exchange_authorization_code(&request, &strict)
        .await
        .unwrap_err();
    assert_eq!(error.check(), Some(Check::DpopBinding));
}

#[tokio::test]
async fn test_bound_refresh_requires_same_key() {
    let harness = Harness::new();
    let strict = VulnerabilityPolicy::strict();
    let client = Client::new();
    let tokens = dpop_tokens(&harness, &client).await;
    let refresh_token = tokens.refresh_token.unwrap();

    let attacker = Client::new();
    let request = RefreshRequest::builder()
        .refresh_token(refresh_token.clone())
        .client_id(common::CLIENT_ID)
        .dpop_thumbprint(attacker.thumbprint())
        .build();
    let error = harness
        .core
        .refresh_tokens(&request, &strict)
        .await
        .unwrap_err();
    assert_eq!(error.check(), Some(Check::DpopBinding));

    let request = RefreshRequest::builder()
        .refresh_token(refresh_token)
        .client_id(common::CLIENT_ID)
        .dpop_thumbprint(client.thumbprint())
        .build();
    let rotated = harness.core.refresh_tokens(&request, &strict).await.unwrap();
    assert_eq!(rotated.token_type, TokenType::DPoP);
}

#[tokio::test]
async fn test_skip_binding_check_is_reported() {
    let harness = Harness::new();
    let client = Client::new();
    let tokens = dpop_tokens(&harness, &client).await;
    let policy = lax(|p| p.skip_dpop_binding_check = true);

    let access = harness
        .core
        .authorize_resource_request(&resource(&tokens.access_token, None), &policy)
        .await
        .unwrap();
    assert_eq!(access.verdict.flags(), ["skip_dpop_binding_check"]);
    assert_eq!(
        harness
            .events
            .count(EventType::ResourceAccess, EventOutcome::Bypassed),
        1
    );
}
