//! In-memory vector index over sentence chunks.
//!
//! Built once from a corpus, then immutable. Search is brute-force cosine
//! similarity over every stored vector, which is the right trade-off for
//! the small, per-process corpora this index serves.
//!
//! # Build
//!
//! 1. Chunk each document with [`chunk_document`].
//! 2. Skip documents that produce no chunks.
//! 3. Embed each document's chunks with one `embed_many` call.
//! 4. Check every vector against the dimensionality of the first one.
//!
//! # Search
//!
//! 1. Return early (no embedding call) if the index is empty or `k == 0`.
//! 2. Embed the query and score every entry.
//! 3. Stable sort by descending score, so ties keep insertion order.
//! 4. Truncate to `k`.

use anyhow::{bail, Result};

use crate::chunk::chunk_document;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::{Chunk, Document, ScoredChunk};

/// A chunk and its embedding vector.
#[derive(Debug, Clone)]
pub struct EmbeddingEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Immutable nearest-neighbor index.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    entries: Vec<EmbeddingEntry>,
    dims: Option<usize>,
    document_count: usize,
}

impl VectorIndex {
    /// An index with no entries. Every search returns nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Chunk and embed `documents` into a new index.
    ///
    /// Fails if the provider errors, returns the wrong number of vectors,
    /// or returns vectors of inconsistent dimensionality.
    pub async fn build<E>(documents: &[Document], embedder: &E) -> Result<Self>
    where
        E: EmbeddingProvider + ?Sized,
    {
        let mut entries = Vec::new();
        let mut document_count = 0;

        for doc in documents {
            let chunks = chunk_document(doc);
            if chunks.is_empty() {
                continue;
            }

            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed_many(&texts).await?;
            if vectors.len() != chunks.len() {
                bail!(
                    "Embedding provider returned {} vectors for {} chunks of document '{}'",
                    vectors.len(),
                    chunks.len(),
                    doc.id
                );
            }

            document_count += 1;
            entries.extend(
                chunks
                    .into_iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| EmbeddingEntry { chunk, vector }),
            );
        }

        let mut index = Self::from_entries(entries)?;
        index.document_count = document_count;
        Ok(index)
    }

    /// Assemble an index from pre-computed entries.
    ///
    /// The dimensionality of the first entry becomes the index's
    /// dimensionality; any entry that disagrees is rejected.
    pub fn from_entries(entries: Vec<EmbeddingEntry>) -> Result<Self> {
        let dims = entries.first().map(|e| e.vector.len());
        if let Some(d) = dims {
            if d == 0 {
                bail!("Embedding vectors must not be empty");
            }
            if let Some(bad) = entries.iter().find(|e| e.vector.len() != d) {
                bail!(
                    "Embedding dimensionality mismatch for chunk '{}': expected {}, got {}",
                    bad.chunk.id,
                    d,
                    bad.vector.len()
                );
            }
        }

        let mut doc_ids: Vec<&str> = entries.iter().map(|e| e.chunk.document_id.as_str()).collect();
        doc_ids.dedup();
        let document_count = doc_ids.len();

        Ok(Self {
            entries,
            dims,
            document_count,
        })
    }

    /// Embed `query` and return at most `k` results, most similar first.
    pub async fn search<E>(&self, query: &str, k: usize, embedder: &E) -> Result<Vec<ScoredChunk>>
    where
        E: EmbeddingProvider + ?Sized,
    {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = embedder.embed(query).await?;
        if Some(query_vec.len()) != self.dims {
            bail!(
                "Query embedding has {} dimensions, index has {}",
                query_vec.len(),
                self.dims.unwrap_or(0)
            );
        }

        Ok(self.rank(&query_vec, k))
    }

    /// Score every entry against a pre-computed query vector.
    pub fn rank(&self, query_vec: &[f32], k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<ScoredChunk> = self
            .entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                score: cosine_similarity(query_vec, &e.vector),
            })
            .collect();

        // `sort_by` is stable: equal scores keep insertion order.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        scored
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vector dimensionality, or `None` for an empty index.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    /// Number of documents that contributed at least one chunk.
    pub fn document_count(&self) -> usize {
        self.document_count
    }
}
