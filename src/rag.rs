//! Authorized retrieval: search, filter, then answer from what remains.
//!
//! ```text
//! question ──▶ SharedIndex::search(max(top_k, 1))
//!                 │ empty ─────────────▶ NO_MATCHES_ANSWER
//!                 ▼
//!          partition_authorized(subject)
//!                 │ no policy model ───▶ POLICY_UNCONFIGURED_ANSWER
//!                 │ nothing allowed ───▶ NOT_AUTHORIZED_ANSWER
//!                 ▼
//!          build_prompt(allowed only) ──▶ TextGenerator::generate
//! ```
//!
//! Filtered chunks never reach the prompt, and their text is never logged.
//! The generator is called at most once per answer, and only when at least
//! one chunk survived the filter.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use agent_gate_core::capability::{partition_authorized, AuthorizationService, FilterError};
use agent_gate_core::generation::TextGenerator;
use agent_gate_core::models::ScoredChunk;

use crate::error::GateError;
use crate::index::SharedIndex;

pub const NO_MATCHES_ANSWER: &str = "No relevant documents were found for this question.";

pub const NOT_AUTHORIZED_ANSWER: &str = "No authorized knowledge was found for this user. \
Either no documents match the request or your account lacks permission.";

pub const POLICY_UNCONFIGURED_ANSWER: &str = "The knowledge base is not initialized. \
Ask an administrator to create an OpenFGA authorization model before using this tool.";

const PROMPT_INSTRUCTION: &str = "Answer the following question using only the provided \
authorized context. If the context does not contain the answer, respond that the information \
is not available for this user.";

/// How an answer was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    NoMatches,
    NotAuthorized,
    PolicyUnconfigured,
}

#[derive(Debug, Clone)]
pub struct AuthorizedAnswer {
    pub status: AnswerStatus,
    /// Chunks the subject may view, in ranking order.
    pub allowed: Vec<ScoredChunk>,
    /// Chunks that ranked but were denied, in ranking order.
    pub filtered: Vec<ScoredChunk>,
    pub answer: String,
}

impl AuthorizedAnswer {
    fn fixed(status: AnswerStatus, answer: &str) -> Self {
        Self {
            status,
            allowed: Vec::new(),
            filtered: Vec::new(),
            answer: answer.to_string(),
        }
    }
}

pub struct AuthorizedRetrieval {
    index: Arc<SharedIndex>,
    authz: Arc<dyn AuthorizationService>,
    generator: Arc<dyn TextGenerator>,
    default_top_k: usize,
}

impl AuthorizedRetrieval {
    pub fn new(
        index: Arc<SharedIndex>,
        authz: Arc<dyn AuthorizationService>,
        generator: Arc<dyn TextGenerator>,
        default_top_k: usize,
    ) -> Self {
        Self {
            index,
            authz,
            generator,
            default_top_k,
        }
    }

    pub fn index(&self) -> &Arc<SharedIndex> {
        &self.index
    }

    /// Answer `question` for `subject` using only chunks they may view.
    pub async fn answer(
        &self,
        question: &str,
        subject: &str,
        top_k: Option<usize>,
    ) -> Result<AuthorizedAnswer> {
        if subject.trim().is_empty() {
            return Err(GateError::AuthorizationDenied("no authenticated user".to_string()).into());
        }

        let index = self.index.get().await?;
        let k = top_k.unwrap_or(self.default_top_k).max(1);
        let candidates = index
            .search(question, k, self.index.embedder().as_ref())
            .await
            .map_err(|e| GateError::external("embedding provider", e))?;

        if candidates.is_empty() {
            tracing::debug!("no retrieval candidates");
            return Ok(AuthorizedAnswer::fixed(
                AnswerStatus::NoMatches,
                NO_MATCHES_ANSWER,
            ));
        }

        let partition = match partition_authorized(self.authz.as_ref(), subject, candidates).await
        {
            Ok(p) => p,
            Err(FilterError::PolicyUnconfigured) => {
                tracing::warn!("authorization model missing; knowledge base unavailable");
                return Ok(AuthorizedAnswer::fixed(
                    AnswerStatus::PolicyUnconfigured,
                    POLICY_UNCONFIGURED_ANSWER,
                ));
            }
            Err(e) => return Err(GateError::external("authorization service", e).into()),
        };

        tracing::info!(
            subject,
            allowed = partition.allowed.len(),
            filtered = partition.filtered.len(),
            "filtered retrieval candidates"
        );

        if partition.allowed.is_empty() {
            return Ok(AuthorizedAnswer {
                status: AnswerStatus::NotAuthorized,
                allowed: Vec::new(),
                filtered: partition.filtered,
                answer: NOT_AUTHORIZED_ANSWER.to_string(),
            });
        }

        let prompt = build_prompt(question, &partition.allowed);
        let answer = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| GateError::external("generation provider", e))?;

        Ok(AuthorizedAnswer {
            status: AnswerStatus::Answered,
            allowed: partition.allowed,
            filtered: partition.filtered,
            answer: answer.trim().to_string(),
        })
    }
}

/// The generation prompt: instruction, labeled context, question.
pub fn build_prompt(question: &str, context: &[ScoredChunk]) -> String {
    let blocks: Vec<String> = context
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "Document {} ({} - score: {:.3}):\n{}",
                i + 1,
                c.document_id(),
                c.score,
                c.chunk.text
            )
        })
        .collect();

    format!(
        "{}\n\nContext:\n{}\n\nQuestion: {}",
        PROMPT_INSTRUCTION,
        blocks.join("\n\n"),
        question
    )
}
