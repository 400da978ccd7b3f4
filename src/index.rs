//! Process-wide, lazily built retrieval index.
//!
//! [`SharedIndex`] owns a corpus source and an embedding provider and
//! builds a [`VectorIndex`] the first time anyone asks for it. Concurrent
//! callers during that first build all wait on the same in-flight build
//! and receive the same `Arc`. If the build fails, nothing is stored and
//! the next caller starts a fresh attempt.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::OnceCell;

use agent_gate_core::embedding::EmbeddingProvider;
use agent_gate_core::index::VectorIndex;

use crate::corpus::CorpusSource;

pub struct SharedIndex {
    corpus: Arc<dyn CorpusSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    cell: OnceCell<Arc<VectorIndex>>,
}

impl SharedIndex {
    pub fn new(corpus: Arc<dyn CorpusSource>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            corpus,
            embedder,
            cell: OnceCell::new(),
        }
    }

    /// The built index, building it on first use.
    pub async fn get(&self) -> Result<Arc<VectorIndex>> {
        let index = self
            .cell
            .get_or_try_init(|| self.build())
            .await?;
        Ok(index.clone())
    }

    /// Whether a build has completed successfully.
    pub fn is_built(&self) -> bool {
        self.cell.initialized()
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    async fn build(&self) -> Result<Arc<VectorIndex>> {
        let corpus = self.corpus.clone();
        let label = corpus.describe();
        tracing::info!(corpus = %label, model = self.embedder.model_name(), "building retrieval index");

        let documents = tokio::task::spawn_blocking(move || corpus.load())
            .await
            .context("Corpus loader task panicked")?
            .with_context(|| format!("Failed to load corpus {}", label))?;

        let index = VectorIndex::build(&documents, self.embedder.as_ref())
            .await
            .context("Failed to build retrieval index")?;

        tracing::info!(
            documents = index.document_count(),
            chunks = index.len(),
            dims = index.dims().unwrap_or(0),
            "retrieval index ready"
        );
        Ok(Arc::new(index))
    }
}
