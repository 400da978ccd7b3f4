//! Corpus loading.
//!
//! A corpus is the fixed set of [`Document`]s the shared index is built
//! from. The filesystem loader walks a directory, applies include and
//! exclude globs, and turns each matching file into a document whose id is
//! the file stem (`public-doc.md` → `public-doc`). That id is what capability
//! tuples name, so it must match the ids used when writing relationships.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use agent_gate_core::models::Document;

use crate::config::CorpusConfig;

/// A source of documents for the shared index.
///
/// Loading is blocking I/O; [`crate::index::SharedIndex`] calls it from
/// `spawn_blocking`.
pub trait CorpusSource: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String;

    fn load(&self) -> Result<Vec<Document>>;
}

/// Documents held in memory. Used by tests and embedders.
pub struct StaticCorpus {
    documents: Vec<Document>,
}

impl StaticCorpus {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

impl CorpusSource for StaticCorpus {
    fn describe(&self) -> String {
        format!("static ({} documents)", self.documents.len())
    }

    fn load(&self) -> Result<Vec<Document>> {
        Ok(self.documents.clone())
    }
}

/// Documents read from a directory tree.
pub struct FilesystemCorpus {
    config: CorpusConfig,
}

impl FilesystemCorpus {
    pub fn new(config: CorpusConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }
}

impl CorpusSource for FilesystemCorpus {
    fn describe(&self) -> String {
        format!("filesystem:{}", self.config.root.display())
    }

    fn load(&self) -> Result<Vec<Document>> {
        scan_corpus(&self.config)
    }
}

/// Read every matching file under `config.root`, sorted by document id.
///
/// Files that are not valid UTF-8 are skipped with a warning. Two files
/// sharing a stem would share a capability identity, so that is an error.
pub fn scan_corpus(config: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve corpus root: {}", root.display()))?;

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents: Vec<Document> = Vec::new();

    for entry in WalkDir::new(&root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match file_to_document(path)? {
            Some(doc) => documents.push(doc),
            None => tracing::warn!(path = %path.display(), "skipping non-UTF-8 file"),
        }
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));

    if let Some(pair) = documents.windows(2).find(|w| w[0].id == w[1].id) {
        bail!(
            "Two corpus files share the document id '{}': {} and {}",
            pair[0].id,
            pair[0].path.as_deref().unwrap_or("?"),
            pair[1].path.as_deref().unwrap_or("?")
        );
    }

    Ok(documents)
}

fn file_to_document(path: &Path) -> Result<Option<Document>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let Ok(text) = String::from_utf8(bytes) else {
        return Ok(None);
    };

    let id = document_id(path)
        .with_context(|| format!("Cannot derive a document id from {}", path.display()))?;

    Ok(Some(
        Document::new(id, text).with_path(path.display().to_string()),
    ))
}

/// The file stem, which is the document's capability identity.
pub fn document_id(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Resolve a corpus root given relative to the config file's directory.
pub fn resolve_root(config_path: &Path, root: &Path) -> PathBuf {
    if root.is_absolute() {
        return root.to_path_buf();
    }
    config_path
        .parent()
        .map(|dir| dir.join(root))
        .unwrap_or_else(|| root.to_path_buf())
}
