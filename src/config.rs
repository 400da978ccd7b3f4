//! TOML configuration.
//!
//! Every section has defaults except `[corpus]` and `[server]`. Secrets are
//! never read from the file: sections that need one name the environment
//! variable that holds it.
//!
//! ```toml
//! [corpus]
//! root = "./assets/docs"
//!
//! [retrieval]
//! top_k = 6
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [authorization]
//! api_url = "https://api.us1.fga.dev"
//! store_id = "01H..."
//!
//! [token_vault]
//! domain = "tenant.us.auth0.com"
//! client_id = "abc"
//!
//! [connections.spotify]
//! scopes = ["playlist-read-private", "playlist-modify-private"]
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub authorization: Option<AuthorizationConfig>,
    #[serde(default)]
    pub token_vault: Option<TokenVaultConfig>,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// OpenAI-compatible API root. OpenRouter works here too.
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: default_generation_base_url(),
            api_key_env: default_generation_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_generation_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generation_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Connection to an OpenFGA-compatible decision service.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthorizationConfig {
    pub api_url: String,
    pub store_id: String,
    #[serde(default)]
    pub authorization_model_id: Option<String>,
    /// Client-credentials issuer host (e.g. `"auth.fga.dev"`). Omit for
    /// unauthenticated local servers.
    #[serde(default)]
    pub token_issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_fga_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fga_secret_env() -> String {
    "FGA_CLIENT_SECRET".to_string()
}

/// Token vault that exchanges a user's refresh token for connection tokens.
#[derive(Debug, Deserialize, Clone)]
pub struct TokenVaultConfig {
    pub domain: String,
    pub client_id: String,
    #[serde(default = "default_vault_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_vault_secret_env() -> String {
    "TOKEN_VAULT_CLIENT_SECRET".to_string()
}

/// Scopes requested for a third-party connection.
///
/// This is the union of what every action on the connection needs; it is
/// fixed when actions are wrapped, never negotiated per call.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Seconds an unresolved interrupt is kept. `0` keeps it until resolved.
    #[serde(default = "default_interrupt_ttl_secs")]
    pub interrupt_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: None,
            interrupt_ttl_secs: default_interrupt_ttl_secs(),
        }
    }
}

fn default_max_steps() -> usize {
    12
}

fn default_interrupt_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Config {
    /// Scopes configured for `connection`, or an empty list.
    pub fn connection_scopes(&self, connection: &str) -> Vec<String> {
        self.connections
            .get(connection)
            .map(|c| c.scopes.clone())
            .unwrap_or_default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

pub fn validate(config: &Config) -> Result<()> {
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }

    if !(1..=100).contains(&config.orchestrator.max_steps) {
        bail!("orchestrator.max_steps must be in [1, 100]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!("generation.model must be specified when provider is 'openai'");
    }

    if let Some(authz) = &config.authorization {
        if authz.store_id.trim().is_empty() {
            bail!("authorization.store_id must not be empty");
        }
        if authz.token_issuer.is_some() && authz.client_id.is_none() {
            bail!("authorization.client_id is required when token_issuer is set");
        }
    }

    for (name, conn) in &config.connections {
        if conn.scopes.iter().any(|s| s.trim().is_empty()) {
            bail!("connections.{}.scopes must not contain empty scopes", name);
        }
    }

    Ok(())
}
