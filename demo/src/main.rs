//! oidclab demo - attack/defence scenarios
//!
//! Every scenario plays one attack twice against a fresh core: once with the
//! strict policy, once with the single flag that disables the defence. The
//! strict run should block the attack; the vulnerable run should let it
//! through and report the flag that did so.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use oidclab_core::pkce::generate_challenge;
use oidclab_core::{
    AuthorizationRequest, ChallengeMethod, ClientType, CoreConfig, CoreError, DpopProofRequest,
    EventOutcome, IssuedTokens, MemoryEventSink, MemoryStore, RefreshRequest, ResourceRequest,
    SecureRandom, SecurityCore, SystemClock, TokenExchangeRequest, Verdict, VulnerabilityPolicy,
};
use oidclab_dpop::{DpopKeyPair, DpopProofGenerator};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const CLIENT_ID: &str = "demo-client";
const REDIRECT_URI: &str = "https://client.example.com/callback";
const TOKEN_ENDPOINT: &str = "https://as.example.com/token";
const RESOURCE_URI: &str = "https://rs.example.com/api/profile";
const SESSION: &str = "demo-session";

/// Command line
#[derive(Parser, Debug)]
#[command(
    name = "oidclab-demo",
    version,
    about = "Run OAuth/OIDC attack scenarios against the oidclab security core",
    long_about = "Each scenario runs once in strict mode and once with the vulnerability flag\n\
                  that disables its defence. Strict runs should block every attack."
)]
struct Cli {
    /// Scenarios to run (all when omitted)
    #[arg(long, short = 's', value_enum)]
    scenario: Vec<Scenario>,

    /// Which policies to run each scenario under
    #[arg(long, short = 'm', value_enum, default_value = "both")]
    mode: Mode,

    /// Core configuration file (TOML, YAML or JSON); `OIDCLAB_*` variables otherwise
    #[arg(long, short = 'c', env = "OIDCLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Strict,
    Vulnerable,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Redeem one authorization code twice
    CodeReplay,
    /// Guess the PKCE verifier, then redeem with the right one
    PkceRetry,
    /// Callback carrying a state the session never issued
    ForgedState,
    /// Send the same DPoP proof twice
    DpopReplay,
    /// DPoP proof minted for a different `htu`
    DpopHtu,
    /// Use a stolen DPoP-bound access token without the key
    StolenToken,
    /// Replay a rotated-out refresh token
    RefreshReplay,
}

impl Scenario {
    const ALL: [Scenario; 7] = [
        Scenario::CodeReplay,
        Scenario::PkceRetry,
        Scenario::ForgedState,
        Scenario::DpopReplay,
        Scenario::DpopHtu,
        Scenario::StolenToken,
        Scenario::RefreshReplay,
    ];

    /// The flag that disables this scenario's defence
    fn flag(self) -> &'static str {
        match self {
            Scenario::CodeReplay => "allow_code_reuse",
            Scenario::PkceRetry => "retry_code_on_pkce_failure",
            Scenario::ForgedState => "skip_state_validation",
            Scenario::DpopReplay => "skip_jti_replay_check",
            Scenario::DpopHtu => "skip_dpop_htu_check",
            Scenario::StolenToken => "skip_dpop_binding_check",
            Scenario::RefreshReplay => "skip_refresh_replay_detection",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Scenario::CodeReplay => "code-replay",
            Scenario::PkceRetry => "pkce-retry",
            Scenario::ForgedState => "forged-state",
            Scenario::DpopReplay => "dpop-replay",
            Scenario::DpopHtu => "dpop-htu",
            Scenario::StolenToken => "stolen-token",
            Scenario::RefreshReplay => "refresh-replay",
        }
    }

    /// Set up the victim's flow, then run the attack step under `policy`
    async fn run(
        self,
        demo: &Demo,
        policy: &VulnerabilityPolicy,
    ) -> anyhow::Result<Result<Verdict, CoreError>> {
        let core = &demo.core;
        match self {
            Scenario::CodeReplay => {
                let (code, verifier) = demo.authorize(policy).await?;
                let request = demo.exchange(&code, &verifier);
                core.exchange_authorization_code(&request, policy)
                    .await
                    .context("victim exchange")?;
                Ok(core
                    .exchange_authorization_code(&request, policy)
                    .await
                    .map(|tokens| tokens.verdict))
            }
            Scenario::PkceRetry => {
                let (code, verifier) = demo.authorize(policy).await?;
                let guess = demo.exchange(&code, &"A".repeat(43));
                if core.exchange_authorization_code(&guess, policy).await.is_ok() {
                    bail!("a guessed verifier was accepted");
                }
                Ok(core
                    .exchange_authorization_code(&demo.exchange(&code, &verifier), policy)
                    .await
                    .map(|tokens| tokens.verdict))
            }
            Scenario::ForgedState => {
                core.issue_state(SESSION).await?;
                Ok(core
                    .validate_state(SESSION, &SecureRandom::state(), policy)
                    .await)
            }
            Scenario::DpopReplay => {
                let key = DpopProofGenerator::new(DpopKeyPair::generate_p256()?);
                let proof = key.generate("GET", RESOURCE_URI, None)?;
                let request = DpopProofRequest::builder()
                    .proof(proof.as_jwt())
                    .method("GET")
                    .uri(RESOURCE_URI)
                    .build();
                core.validate_dpop_proof(&request, policy)
                    .await
                    .context("first use of proof")?;
                Ok(core
                    .validate_dpop_proof(&request, policy)
                    .await
                    .map(|proof| proof.verdict))
            }
            Scenario::DpopHtu => {
                let key = DpopProofGenerator::new(DpopKeyPair::generate_p256()?);
                let proof = key.generate("GET", "https://evil.example.com/api/profile", None)?;
                let request = DpopProofRequest::builder()
                    .proof(proof.as_jwt())
                    .method("GET")
                    .uri(RESOURCE_URI)
                    .build();
                Ok(core
                    .validate_dpop_proof(&request, policy)
                    .await
                    .map(|proof| proof.verdict))
            }
            Scenario::StolenToken => {
                let victim = DpopProofGenerator::new(DpopKeyPair::generate_p256()?);
                let tokens = demo.dpop_tokens(&victim, policy).await?;
                let request = ResourceRequest::builder()
                    .access_token(tokens.access_token)
                    .method("GET")
                    .uri(RESOURCE_URI)
                    .build();
                Ok(core
                    .authorize_resource_request(&request, policy)
                    .await
                    .map(|access| access.verdict))
            }
            Scenario::RefreshReplay => {
                let (code, verifier) = demo.authorize(policy).await?;
                let tokens = core
                    .exchange_authorization_code(&demo.exchange(&code, &verifier), policy)
                    .await?;
                let stolen = tokens
                    .refresh_token
                    .context("no refresh token issued")?;
                let request = RefreshRequest::builder()
                    .refresh_token(stolen)
                    .client_id(CLIENT_ID)
                    .build();
                core.refresh_tokens(&request, policy)
                    .await
                    .context("legitimate rotation")?;
                Ok(core
                    .refresh_tokens(&request, policy)
                    .await
                    .map(|tokens| tokens.verdict))
            }
        }
    }
}

/// A fresh core with captured events
struct Demo {
    core: SecurityCore,
    events: Arc<MemoryEventSink>,
}

impl Demo {
    fn new(config: CoreConfig, store: Arc<MemoryStore>) -> anyhow::Result<Self> {
        let events = Arc::new(MemoryEventSink::new());
        let core = SecurityCore::builder()
            .config(config)
            .store(store)
            .events(events.clone())
            .build()?;
        Ok(Self { core, events })
    }

    async fn authorize(&self, policy: &VulnerabilityPolicy) -> anyhow::Result<(String, String)> {
        self.authorize_bound(None, policy).await
    }

    async fn authorize_bound(
        &self,
        dpop_jkt: Option<String>,
        policy: &VulnerabilityPolicy,
    ) -> anyhow::Result<(String, String)> {
        let verifier = SecureRandom::code_verifier();
        let challenge = generate_challenge(&verifier)?;
        let mut request = AuthorizationRequest::builder()
            .client_id(CLIENT_ID)
            .redirect_uri(REDIRECT_URI)
            .code_challenge(challenge.challenge)
            .code_challenge_method(ChallengeMethod::S256)
            .scope("openid profile")
            .subject_id("alice")
            .nonce(SecureRandom::nonce())
            .build();
        request.dpop_jkt = dpop_jkt;
        let (code, _) = self
            .core
            .issue_authorization_code(&request, policy)
            .await
            .context("authorization")?;
        Ok((code, verifier))
    }

    fn exchange(&self, code: &str, verifier: &str) -> TokenExchangeRequest {
        TokenExchangeRequest::builder()
            .code(code)
            .client_id(CLIENT_ID)
            .client_type(ClientType::Public)
            .redirect_uri(REDIRECT_URI)
            .code_verifier(verifier.to_string())
            .token_endpoint(TOKEN_ENDPOINT)
            .build()
    }

    async fn dpop_tokens(
        &self,
        key: &DpopProofGenerator,
        policy: &VulnerabilityPolicy,
    ) -> anyhow::Result<IssuedTokens> {
        let thumbprint = key.key_pair().thumbprint.clone();
        let (code, verifier) = self.authorize_bound(Some(thumbprint), policy).await?;
        let mut request = self.exchange(&code, &verifier);
        request.dpop_proof = Some(key.generate("POST", TOKEN_ENDPOINT, None)?.as_jwt().to_string());
        Ok(self.core.exchange_authorization_code(&request, policy).await?)
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json.then(|| fmt::layer().json()))
        .with((!cli.json).then(|| fmt::layer()))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<CoreConfig> {
    let config = match &cli.config {
        Some(path) => CoreConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoreConfig::from_env().context("loading configuration from environment")?,
    };
    Ok(config)
}

fn describe(result: &Result<Verdict, CoreError>) -> String {
    match result {
        Ok(Verdict::Verified) => "ACCEPTED".to_string(),
        Ok(Verdict::Bypassed(flags)) => format!("ACCEPTED via {}", flags.join(", ")),
        Err(error) => format!("BLOCKED ({})", error.oauth_error().error),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let config = load_config(&cli)?;

    let scenarios: Vec<Scenario> = if cli.scenario.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        cli.scenario.clone()
    };

    let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
    let sweeper = store.spawn_sweeper(Duration::from_secs(30));

    let mut unexpected = 0usize;
    for scenario in scenarios {
        let mut runs = Vec::new();
        if cli.mode != Mode::Vulnerable {
            runs.push(("strict", VulnerabilityPolicy::strict()));
        }
        if cli.mode != Mode::Strict {
            runs.push((
                "vulnerable",
                VulnerabilityPolicy::from_flags([(scenario.flag(), true)])?,
            ));
        }

        for (mode, policy) in runs {
            let demo = Demo::new(config.clone(), store.clone())?;
            let result = scenario
                .run(&demo, &policy)
                .await
                .with_context(|| format!("scenario {}", scenario.name()))?;

            let blocked = result.is_err();
            if blocked != policy.is_strict() {
                unexpected += 1;
            }
            let bypassed = demo
                .events
                .events()
                .iter()
                .filter(|event| event.outcome == EventOutcome::Bypassed)
                .count();
            println!(
                "{:<16} {:<11} {:<48} bypass events: {bypassed}",
                scenario.name(),
                mode,
                describe(&result),
            );
        }
    }

    sweeper.abort();
    if unexpected > 0 {
        bail!("{unexpected} run(s) did not behave as expected");
    }
    Ok(())
}
