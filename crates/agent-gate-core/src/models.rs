//! Core data models shared by the index, the capability filter, and the
//! retrieval service.

use serde::{Deserialize, Serialize};

/// An immutable unit of source text.
///
/// Documents are produced by a corpus loader and are read-only to the
/// index. The `id` is the stable identity used for capability checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier (e.g. the file stem `"public-doc"`).
    pub id: String,
    /// Origin marker, usually the absolute path the text was read from.
    pub path: Option<String>,
    /// Full document text.
    pub text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            text: text.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A sentence-level span of a [`Document`].
///
/// Chunks carry their parent's identity by value (`document_id`), never
/// by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Deterministic id: `"{document_id}#{chunk_index}"`.
    pub id: String,
    pub document_id: String,
    pub document_path: Option<String>,
    /// Position of the chunk within its document, starting at 0.
    pub chunk_index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// A chunk paired with its similarity to a query. Higher is more similar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

impl ScoredChunk {
    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}
