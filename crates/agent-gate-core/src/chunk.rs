//! Sentence-boundary text chunker.
//!
//! Splits a [`Document`]'s text into [`Chunk`]s on sentence-ending
//! punctuation. Every fragment is trimmed and empty fragments are dropped,
//! so a document made only of whitespace and punctuation yields no chunks.
//!
//! Each chunk receives a deterministic id derived from its document id and
//! position, plus a SHA-256 hash of its text.
//!
//! # Example
//!
//! ```rust
//! use agent_gate_core::chunk::chunk_document;
//! use agent_gate_core::models::Document;
//!
//! let doc = Document::new("doc1", "The sky is blue. Grass is green!");
//! let chunks = chunk_document(&doc);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "The sky is blue");
//! assert_eq!(chunks[1].id, "doc1#1");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, Document};

/// Characters that end a sentence.
const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?'];

/// Split a document into sentence chunks.
///
/// # Guarantees
///
/// - No chunk is empty or whitespace-only.
/// - Chunk order follows the order of sentences in the document.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
pub fn chunk_document(doc: &Document) -> Vec<Chunk> {
    doc.text
        .split(SENTENCE_TERMINATORS)
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .enumerate()
        .map(|(index, fragment)| make_chunk(doc, index, fragment))
        .collect()
}

fn make_chunk(doc: &Document, index: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: format!("{}#{}", doc.id, index),
        document_id: doc.id.clone(),
        document_path: doc.path.clone(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
