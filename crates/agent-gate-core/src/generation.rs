//! Text generation provider trait.
//!
//! The authorized retrieval service needs exactly one call: turn a prompt
//! into text. Multi-step tool calling is a separate concern owned by the
//! orchestrator in the app crate.

use anyhow::Result;
use async_trait::async_trait;

/// A single-shot text generator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;
}
