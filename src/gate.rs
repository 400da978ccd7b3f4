//! The tool gate: credential and consent checks in front of an action.
//!
//! [`gate`] wraps any [`Tool`] in a [`GatedTool`] that presents the same
//! name, description, and schema, and returns the same output. Before the
//! inner action runs, the gate:
//!
//! 1. validates the parameters against the inner schema,
//! 2. asks the [`CredentialBroker`] for a token for the connection,
//! 3. for [`GatePolicy::CredentialAndExplicitGrant`], checks the approval
//!    ledger for this subject's thread and binding message.
//!
//! A failure at step 2 or 3 becomes [`GateError::ConsentRequired`] carrying
//! the [`RequiredGrant`] the user must provide. The inner action has not
//! been called at that point, so there is no side effect to undo. If the
//! inner action itself reports `MissingCredential` (for instance when the
//! third-party API revokes the token), that is mapped the same way.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::consent::{sanitize_binding_message, RequiredGrant};
use crate::credentials::CredentialBroker;
use crate::error::{as_gate_error, GateError};
use crate::traits::{validate_params, Tool, ToolContext};

/// Which checks a gated action requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatePolicy {
    CredentialOnly,
    /// A credential, then a per-thread approval of `binding_message`.
    CredentialAndExplicitGrant { binding_message: String },
}

impl GatePolicy {
    /// An explicit-grant policy with a sanitized binding message.
    pub fn explicit(binding_message: &str) -> Self {
        GatePolicy::CredentialAndExplicitGrant {
            binding_message: sanitize_binding_message(binding_message),
        }
    }
}

/// A connection and the scopes every action on it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub name: String,
    pub scopes: Vec<String>,
}

impl Connection {
    pub fn new(name: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            name: name.into(),
            scopes,
        }
    }
}

pub struct GatedTool {
    inner: Box<dyn Tool>,
    broker: Arc<CredentialBroker>,
    connection: Connection,
    policy: GatePolicy,
}

/// Wrap `inner` so it only runs with a credential for `connection` and,
/// depending on `policy`, an explicit approval.
pub fn gate(
    inner: Box<dyn Tool>,
    broker: Arc<CredentialBroker>,
    connection: Connection,
    policy: GatePolicy,
) -> GatedTool {
    GatedTool {
        inner,
        broker,
        connection,
        policy,
    }
}

impl GatedTool {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    fn credential_grant(&self) -> RequiredGrant {
        RequiredGrant::Credential {
            connection: self.connection.name.clone(),
            scopes: self.connection.scopes.clone(),
        }
    }

    /// Map `MissingCredential` to a consent request; pass anything else on.
    fn recover(&self, err: anyhow::Error) -> anyhow::Error {
        match as_gate_error(&err) {
            Some(GateError::MissingCredential { .. }) => {
                GateError::ConsentRequired(self.credential_grant()).into()
            }
            _ => err,
        }
    }
}

#[async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn is_builtin(&self) -> bool {
        self.inner.is_builtin()
    }

    fn parameters_schema(&self) -> Value {
        self.inner.parameters_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let params = validate_params(&self.inner.parameters_schema(), &params)?;

        let credential = self
            .broker
            .resolve(ctx.session(), &self.connection.name, &self.connection.scopes)
            .await
            .map_err(|e| self.recover(e))?;

        if let GatePolicy::CredentialAndExplicitGrant { binding_message } = &self.policy {
            let subject = ctx.subject().await?;
            if !ctx
                .approvals()
                .is_approved(&subject, ctx.thread_id(), binding_message)?
            {
                tracing::debug!(tool = self.name(), "explicit approval required");
                return Err(GateError::ConsentRequired(RequiredGrant::Approval {
                    binding_message: binding_message.clone(),
                })
                .into());
            }
        }

        tracing::debug!(tool = self.name(), connection = %self.connection.name, "gate passed");
        self.inner
            .execute(params, &ctx.with_credential(credential))
            .await
            .map_err(|e| self.recover(e))
    }
}
