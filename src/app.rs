//! Wiring: build every service from a [`Config`].
//!
//! Custom binaries add their own actions as [`Extension`]s. An extension
//! that names a connection is gated with that connection's configured
//! scopes; one without a connection is registered as is.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agent_gate_core::capability::{AuthorizationService, CapabilityTuple, DecisionError};
use async_trait::async_trait;

use crate::config::Config;
use crate::corpus::{resolve_root, FilesystemCorpus};
use crate::credentials::CredentialBroker;
use crate::embedding::create_provider;
use crate::fga::FgaClient;
use crate::gate::{gate, Connection, GatePolicy};
use crate::generation::create_generators;
use crate::index::SharedIndex;
use crate::orchestrator::Orchestrator;
use crate::rag::AuthorizedRetrieval;
use crate::traits::{Tool, ToolRegistry};

/// An action contributed by the embedding application.
pub struct Extension {
    pub tool: Box<dyn Tool>,
    /// Connection the action calls, if any.
    pub connection: Option<String>,
    pub policy: GatePolicy,
}

impl Extension {
    /// An action that needs no delegated credential.
    pub fn plain(tool: Box<dyn Tool>) -> Self {
        Self {
            tool,
            connection: None,
            policy: GatePolicy::CredentialOnly,
        }
    }

    /// An action on `connection` with the given policy.
    pub fn gated(tool: Box<dyn Tool>, connection: impl Into<String>, policy: GatePolicy) -> Self {
        Self {
            tool,
            connection: Some(connection.into()),
            policy,
        }
    }
}

/// Stands in when `[authorization]` is absent: every check reports that no
/// policy model exists, so the knowledge base answers with the
/// administrative message instead of leaking anything.
pub struct UnconfiguredAuthorization;

#[async_trait]
impl AuthorizationService for UnconfiguredAuthorization {
    async fn check(&self, _tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError> {
        Err(DecisionError::NoPolicyModel)
    }
}

pub struct AppServices {
    pub config: Arc<Config>,
    pub retrieval: Arc<AuthorizedRetrieval>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppServices {
    /// Build all services. `config_path` anchors a relative corpus root.
    pub fn from_config(
        config: Config,
        config_path: &Path,
        extensions: Vec<Extension>,
    ) -> Result<Self> {
        let mut corpus_config = config.corpus.clone();
        corpus_config.root = resolve_root(config_path, &corpus_config.root);

        let embedder =
            create_provider(&config.embedding).context("Failed to create embedding provider")?;
        let index = Arc::new(SharedIndex::new(
            Arc::new(FilesystemCorpus::new(corpus_config)),
            embedder,
        ));

        let authz: Arc<dyn AuthorizationService> = match &config.authorization {
            Some(auth) => Arc::new(FgaClient::new(auth).context("Failed to create FGA client")?),
            None => {
                tracing::warn!("no [authorization] section; knowledge base will refuse all queries");
                Arc::new(UnconfiguredAuthorization)
            }
        };

        let generators =
            create_generators(&config.generation).context("Failed to create generation provider")?;

        let retrieval = Arc::new(AuthorizedRetrieval::new(
            index,
            authz,
            generators.text,
            config.retrieval.top_k,
        ));

        let broker = Arc::new(CredentialBroker::from_config(&config)?);
        let tools = build_registry(&config, broker, extensions);

        let mut orchestrator = Orchestrator::new(generators.chat, tools)
            .with_retrieval(retrieval.clone())
            .with_max_steps(config.orchestrator.max_steps)
            .with_interrupt_ttl(match config.orchestrator.interrupt_ttl_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            });
        if let Some(prompt) = &config.orchestrator.system_prompt {
            orchestrator = orchestrator.with_system_prompt(prompt.clone());
        }

        Ok(Self {
            config: Arc::new(config),
            retrieval,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

/// Built-in tools plus `extensions`, gating those that name a connection.
pub fn build_registry(
    config: &Config,
    broker: Arc<CredentialBroker>,
    extensions: Vec<Extension>,
) -> ToolRegistry {
    let mut tools = ToolRegistry::with_builtins();
    for ext in extensions {
        match ext.connection {
            Some(name) => {
                let scopes = config.connection_scopes(&name);
                if scopes.is_empty() {
                    tracing::warn!(connection = %name, "no scopes configured for connection");
                }
                tools.register(Box::new(gate(
                    ext.tool,
                    broker.clone(),
                    Connection::new(name, scopes),
                    ext.policy,
                )));
            }
            None => tools.register(ext.tool),
        }
    }
    tools
}
