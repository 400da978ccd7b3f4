//! Capability tuples and post-hoc filtering of ranked search results.
//!
//! Retrieval ranks every chunk in the corpus; this module then asks an
//! external authorization decision service which of those chunks the
//! subject may view, and keeps only the approved ones in their original
//! order.
//!
//! # Tuple shape
//!
//! ```text
//! (user:<subject>, viewer, doc:<document id>)
//! ```
//!
//! Prefixing is idempotent: `doc:doc:x` is never produced.
//!
//! # Failure policy
//!
//! A decision service that reports "no authorization model" yields
//! [`FilterError::PolicyUnconfigured`] so callers can degrade gracefully.
//! Every other failure is a hard error. Nothing is ever allowed by default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Chunk, ScoredChunk};

/// Relation checked for read access to a document.
pub const VIEWER_RELATION: &str = "viewer";
/// Type prefix for subjects.
pub const USER_TYPE: &str = "user";
/// Type prefix for documents.
pub const DOC_TYPE: &str = "doc";

/// Prefix `identifier` with `"{prefix}:"` unless it already carries it.
///
/// ```rust
/// use agent_gate_core::capability::ensure_prefixed;
///
/// assert_eq!(ensure_prefixed("doc", "a"), "doc:a");
/// assert_eq!(ensure_prefixed("doc", "doc:a"), "doc:a");
/// ```
pub fn ensure_prefixed(prefix: &str, identifier: &str) -> String {
    let tag = format!("{}:", prefix);
    if identifier.starts_with(&tag) {
        identifier.to_string()
    } else {
        format!("{}{}", tag, identifier)
    }
}

/// A `(user, relation, object)` authorization query unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityTuple {
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl CapabilityTuple {
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }

    /// The tuple asking whether `subject` may view the document behind `chunk`.
    pub fn viewer(subject: &str, chunk: &Chunk) -> Self {
        Self::new(
            ensure_prefixed(USER_TYPE, subject),
            VIEWER_RELATION,
            ensure_prefixed(DOC_TYPE, &chunk.document_id),
        )
    }
}

/// Errors reported by an [`AuthorizationService`].
#[derive(Debug, Error)]
pub enum DecisionError {
    /// The service has no authorization model to evaluate against.
    #[error("no authorization model is configured")]
    NoPolicyModel,

    /// Any other failure: transport, auth, malformed response.
    #[error("authorization service error: {0}")]
    Service(String),
}

/// Batched relationship checks against an external decision service.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Check every tuple. The result is aligned by position with `tuples`.
    async fn check(&self, tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError>;
}

/// Errors from [`filter_authorized`].
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("authorization policy is not configured")]
    PolicyUnconfigured,

    #[error(transparent)]
    Decision(DecisionError),

    #[error("authorization service answered {got} checks for {expected} tuples")]
    LengthMismatch { expected: usize, got: usize },
}

impl From<DecisionError> for FilterError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::NoPolicyModel => FilterError::PolicyUnconfigured,
            other => FilterError::Decision(other),
        }
    }
}

/// Ranked candidates split by authorization outcome.
///
/// Both halves keep the relative order of the input ranking.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub allowed: Vec<ScoredChunk>,
    pub filtered: Vec<ScoredChunk>,
}

/// Keep only the candidates `subject` may view, preserving order.
pub async fn filter_authorized<A>(
    service: &A,
    subject: &str,
    candidates: Vec<ScoredChunk>,
) -> Result<Vec<ScoredChunk>, FilterError>
where
    A: AuthorizationService + ?Sized,
{
    Ok(partition_authorized(service, subject, candidates).await?.allowed)
}

/// Split candidates into allowed and filtered-out, with one batched check.
///
/// An empty candidate list never reaches the service.
pub async fn partition_authorized<A>(
    service: &A,
    subject: &str,
    candidates: Vec<ScoredChunk>,
) -> Result<Partition, FilterError>
where
    A: AuthorizationService + ?Sized,
{
    if candidates.is_empty() {
        return Ok(Partition::default());
    }

    let tuples: Vec<CapabilityTuple> = candidates
        .iter()
        .map(|c| CapabilityTuple::viewer(subject, &c.chunk))
        .collect();

    let decisions = service.check(&tuples).await?;
    if decisions.len() != tuples.len() {
        return Err(FilterError::LengthMismatch {
            expected: tuples.len(),
            got: decisions.len(),
        });
    }

    let mut partition = Partition::default();
    for (candidate, allowed) in candidates.into_iter().zip(decisions) {
        if allowed {
            partition.allowed.push(candidate);
        } else {
            partition.filtered.push(candidate);
        }
    }
    Ok(partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_document;
    use crate::models::Document;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct SetService {
        allowed: HashSet<(String, String)>,
        seen: Mutex<Vec<Vec<CapabilityTuple>>>,
    }

    impl SetService {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                allowed: pairs
                    .iter()
                    .map(|(u, o)| (u.to_string(), o.to_string()))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AuthorizationService for SetService {
        async fn check(&self, tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError> {
            self.seen.lock().unwrap().push(tuples.to_vec());
            Ok(tuples
                .iter()
                .map(|t| {
                    t.relation == VIEWER_RELATION
                        && self.allowed.contains(&(t.user.clone(), t.object.clone()))
                })
                .collect())
        }
    }

    struct FailingService(fn() -> DecisionError);

    #[async_trait]
    impl AuthorizationService for FailingService {
        async fn check(&self, _tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError> {
            Err((self.0)())
        }
    }

    struct ShortService;

    #[async_trait]
    impl AuthorizationService for ShortService {
        async fn check(&self, _tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError> {
            Ok(vec![true])
        }
    }

    fn scored(doc_id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk_document(&Document::new(doc_id, "Some text.")).remove(0),
            score,
        }
    }

    #[test]
    fn test_prefix_idempotent() {
        assert_eq!(ensure_prefixed("user", "alice"), "user:alice");
        assert_eq!(ensure_prefixed("user", "user:alice"), "user:alice");
        let once = ensure_prefixed("doc", "x");
        assert_eq!(ensure_prefixed("doc", &once), once);
    }

    #[test]
    fn test_prefix_only_matches_whole_tag() {
        assert_eq!(ensure_prefixed("doc", "docs:a"), "doc:docs:a");
        assert_eq!(ensure_prefixed("doc", "document"), "doc:document");
    }

    #[test]
    fn test_viewer_tuple() {
        let c = scored("public-doc", 0.5);
        let t = CapabilityTuple::viewer("auth0|123", &c.chunk);
        assert_eq!(t.user, "user:auth0|123");
        assert_eq!(t.relation, "viewer");
        assert_eq!(t.object, "doc:public-doc");
    }

    #[tokio::test]
    async fn test_filter_preserves_order() {
        let service = SetService::new(&[("user:u", "doc:a"), ("user:u", "doc:c"), ("user:u", "doc:e")]);
        let candidates = vec![
            scored("e", 0.9),
            scored("b", 0.8),
            scored("a", 0.7),
            scored("d", 0.6),
            scored("c", 0.5),
        ];
        let allowed = filter_authorized(&service, "u", candidates).await.unwrap();
        let ids: Vec<&str> = allowed.iter().map(|c| c.document_id()).collect();
        assert_eq!(ids, vec!["e", "a", "c"]);
    }

    #[tokio::test]
    async fn test_single_batched_query() {
        let service = SetService::new(&[]);
        let candidates = vec![scored("a", 0.3), scored("b", 0.2), scored("c", 0.1)];
        let partition = partition_authorized(&service, "u", candidates).await.unwrap();
        assert!(partition.allowed.is_empty());
        assert_eq!(partition.filtered.len(), 3);

        let seen = service.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 3);
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_service() {
        let service = SetService::new(&[]);
        let partition = partition_authorized(&service, "u", Vec::new()).await.unwrap();
        assert!(partition.allowed.is_empty() && partition.filtered.is_empty());
        assert!(service.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_policy_model_is_distinct() {
        let service = FailingService(|| DecisionError::NoPolicyModel);
        let err = filter_authorized(&service, "u", vec![scored("a", 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::PolicyUnconfigured));
    }

    #[tokio::test]
    async fn test_other_failures_are_hard_errors() {
        let service = FailingService(|| DecisionError::Service("boom".into()));
        let err = filter_authorized(&service, "u", vec![scored("a", 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Decision(_)));
    }

    #[tokio::test]
    async fn test_misaligned_response_rejected() {
        let err = filter_authorized(&ShortService, "u", vec![scored("a", 1.0), scored("b", 0.5)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FilterError::LengthMismatch {
                expected: 2,
                got: 1
            }
        ));
    }
}
