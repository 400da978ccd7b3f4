//! # Agent Gate CLI (`gate`)
//!
//! ## Usage
//!
//! ```bash
//! gate --config ./config/gate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gate index` | Scan the corpus, embed it, and report counts |
//! | `gate ask "<question>" --subject <id>` | Run one turn from the terminal |
//! | `gate search "<question>" --subject <id>` | Query the knowledge base directly |
//! | `gate tools` | List registered tools |
//! | `gate fga-init` | Install the default authorization model and public tuples |
//! | `gate serve` | Start the HTTP server |
//!
//! Logs go to stderr; set `RUST_LOG` to change the level (default `info`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use agent_gate::app::AppServices;
use agent_gate::config::{self, Config};
use agent_gate::fga::{default_model, public_doc_tuples, FgaClient};
use agent_gate::orchestrator::{TurnOutcome, TurnRequest};
use agent_gate::session::StaticSession;

/// Agent Gate: a permission-gated agent over a private knowledge base and
/// the user's connected accounts.
#[derive(Parser)]
#[command(name = "gate", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the vector index and print document and chunk counts.
    Index,

    /// Run one orchestrated turn and print the outcome.
    Ask {
        question: String,

        /// Authenticated user id the turn runs for.
        #[arg(long)]
        subject: String,

        /// Refresh token for the token vault. Falls back to `GATE_REFRESH_TOKEN`.
        #[arg(long, env = "GATE_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,
    },

    /// Query the knowledge base without the orchestrator.
    Search {
        question: String,

        #[arg(long)]
        subject: String,

        /// Override `retrieval.top_k`.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List registered tools and their parameter schemas.
    Tools,

    /// Install the default authorization model and make `public-doc`
    /// viewable by everyone.
    FgaInit,

    /// Start the HTTP server.
    Serve,
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::FgaInit = cli.command {
        return run_fga_init(&cfg).await;
    }

    let services = AppServices::from_config(cfg, &cli.config, Vec::new())?;
    match cli.command {
        Commands::Index => {
            let index = services.retrieval.index().get().await?;
            println!(
                "Indexed {} documents ({} chunks, {} dims).",
                index.document_count(),
                index.len(),
                index.dims().unwrap_or(0)
            );
        }
        Commands::Ask {
            question,
            subject,
            refresh_token,
        } => {
            let session = Arc::new(StaticSession::from_parts(Some(subject), refresh_token));
            let outcome = services
                .orchestrator
                .run_turn(TurnRequest::question(question), session)
                .await;
            print_outcome(&outcome)?;
        }
        Commands::Search {
            question,
            subject,
            top_k,
        } => {
            let answer = services.retrieval.answer(&question, &subject, top_k).await?;
            for hit in &answer.allowed {
                println!("  {:.3}  {}", hit.score, hit.chunk.id);
            }
            if !answer.filtered.is_empty() {
                println!("  ({} results hidden)", answer.filtered.len());
            }
            println!();
            println!("{}", answer.answer);
        }
        Commands::Tools => {
            for info in services.orchestrator.tools().infos() {
                println!("{}  {}", info.name, info.description);
            }
        }
        Commands::Serve => {
            agent_gate::server::run_server(
                &services.config.server.bind,
                services.orchestrator.clone(),
            )
            .await?;
        }
        Commands::FgaInit => unreachable!("handled before services are built"),
    }

    Ok(())
}

async fn run_fga_init(cfg: &Config) -> Result<()> {
    let Some(auth) = &cfg.authorization else {
        anyhow::bail!("[authorization] section required for fga-init");
    };
    let client = FgaClient::new(auth)?;
    let model_id = client.write_model(&default_model()).await?;
    println!("Authorization model: {}", model_id);

    let tuples = public_doc_tuples();
    client.write_tuples(&tuples, Some(&model_id)).await?;
    println!("Wrote {} tuples.", tuples.len());
    println!("Set authorization.authorization_model_id = \"{}\" to pin it.", model_id);
    Ok(())
}

fn print_outcome(outcome: &TurnOutcome) -> Result<()> {
    match outcome {
        TurnOutcome::Completed { answer, .. } => println!("{}", answer),
        TurnOutcome::Interrupted { interrupt, .. } => {
            println!("Paused: {} needs consent.", interrupt.tool);
            println!("{}", serde_json::to_string_pretty(interrupt)?);
        }
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}
