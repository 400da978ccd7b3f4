//! Typed errors that cross the gate boundary.
//!
//! Everything else in the crate uses `anyhow`. These variants are the ones
//! callers need to tell apart: the orchestrator downcasts an
//! [`anyhow::Error`] to [`GateError`] to decide between suspending a turn,
//! feeding the error back to the model, or failing the turn.

use thiserror::Error;

use crate::consent::RequiredGrant;

/// User-visible text for failures that carry no safe detail.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "An unexpected error occurred while processing your request.";

#[derive(Debug, Error)]
pub enum GateError {
    /// No usable delegated credential for the connection.
    #[error("no credential available for connection '{connection}'")]
    MissingCredential { connection: String },

    /// The action cannot run until the user grants something.
    #[error("user consent required: {0}")]
    ConsentRequired(RequiredGrant),

    /// The decision service has no authorization model.
    #[error("authorization policy is not configured")]
    PolicyUnconfigured,

    /// No authenticated subject, or the subject is not allowed.
    #[error("not authorized: {0}")]
    AuthorizationDenied(String),

    /// An external dependency failed: embedding, generation, decision
    /// service, token vault, third-party API.
    #[error("{service} failed: {message}")]
    ExternalService { service: String, message: String },

    /// Tool input did not match the tool's schema.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The turn used every model step it was allowed.
    #[error("step budget of {0} exhausted")]
    StepBudgetExhausted(usize),

    /// A resume or decline named no pending interrupt.
    #[error("no pending interrupt for token '{0}'")]
    UnknownInterrupt(String),
}

impl GateError {
    pub fn external(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        GateError::ExternalService {
            service: service.into(),
            message: message.to_string(),
        }
    }

    /// Machine-readable code used in HTTP bodies and turn outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::MissingCredential { .. } => "missing_credential",
            GateError::ConsentRequired(_) => "consent_required",
            GateError::PolicyUnconfigured => "policy_unconfigured",
            GateError::AuthorizationDenied(_) => "unauthorized",
            GateError::ExternalService { .. } => "external_service",
            GateError::InvalidInput(_) => "bad_request",
            GateError::StepBudgetExhausted(_) => "step_budget_exhausted",
            GateError::UnknownInterrupt(_) => "unknown_interrupt",
        }
    }
}

/// Find a [`GateError`] anywhere in an `anyhow` chain.
pub fn as_gate_error(err: &anyhow::Error) -> Option<&GateError> {
    err.chain().find_map(|e| e.downcast_ref::<GateError>())
}

/// Code for an arbitrary error: the typed code if present, else `"internal"`.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    as_gate_error(err).map(GateError::code).unwrap_or("internal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(GateError::PolicyUnconfigured)
            .context("while querying")
            .unwrap_err();
        assert!(matches!(
            as_gate_error(&err),
            Some(GateError::PolicyUnconfigured)
        ));
        assert_eq!(error_code(&err), "policy_unconfigured");
    }

    #[test]
    fn test_untyped_error_is_internal() {
        let err = anyhow::anyhow!("boom");
        assert!(as_gate_error(&err).is_none());
        assert_eq!(error_code(&err), "internal");
    }

    #[test]
    fn test_external_display() {
        let err = GateError::external("token vault", "HTTP 503");
        assert_eq!(err.to_string(), "token vault failed: HTTP 503");
    }
}
