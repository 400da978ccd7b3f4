//! # Agent Gate Core
//!
//! Runtime-free logic for Agent Gate: document and chunk models, the
//! sentence chunker, the in-memory vector index, the embedding and
//! generation provider traits, and capability filtering against an
//! external authorization decision service.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. The
//! `agent-gate` app crate supplies concrete providers and wires these
//! pieces into the orchestration layer.

pub mod capability;
pub mod chunk;
pub mod embedding;
pub mod generation;
pub mod index;
pub mod models;
