//! # Agent Gate
//!
//! A permission-gated agent: answers questions from a private knowledge
//! base that is filtered per user, and acts on the user's connected
//! third-party accounts only with delegated credentials and, where
//! required, explicit approval.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────────┐
//! │  Corpus  │──▶│ SharedIndex  │──▶│ AuthorizedRetrieval│──▶ FGA batch-check
//! │ (files)  │   │ (built once) │   │  search ▸ filter   │
//! └──────────┘   └──────────────┘   └─────────┬──────────┘
//!                                             │ query_knowledge_base
//!                                             ▼
//!   HTTP / CLI ──▶ Orchestrator ──▶ ToolRegistry ──▶ GatedTool ──▶ action
//!                     │   ▲                             │
//!                     │   └──── resume / decline ───────┤ ConsentRequired
//!                     ▼                                 ▼
//!               ConsentRegistry ◀──── suspend ── CredentialBroker ──▶ token vault
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Domain error kinds and their wire codes |
//! | [`corpus`] | Document sources (filesystem, static) |
//! | [`embedding`] | Embedding providers and HTTP retry |
//! | [`index`] | Lazily built, shared vector index |
//! | [`fga`] | Authorization decision service client |
//! | [`generation`] | Chat completion providers |
//! | [`rag`] | Authorization-filtered retrieval and answering |
//! | [`session`] | Identity of the caller |
//! | [`credentials`] | Delegated credential exchange |
//! | [`consent`] | Interrupts, grants, and the approval ledger |
//! | [`traits`] | Tool trait, context, registry, built-in tools |
//! | [`gate`] | The credential and consent decorator |
//! | [`orchestrator`] | Bounded multi-step tool loop |
//! | [`app`] | Wiring from configuration |
//! | [`server`] | HTTP API |

pub mod app;
pub mod config;
pub mod consent;
pub mod corpus;
pub mod credentials;
pub mod embedding;
pub mod error;
pub mod fga;
pub mod gate;
pub mod generation;
pub mod index;
pub mod orchestrator;
pub mod rag;
pub mod server;
pub mod session;
pub mod traits;

pub use agent_gate_core as core;
