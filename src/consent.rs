//! Consent interrupts: parked tool calls waiting for a user grant.
//!
//! When a gated tool cannot run yet, the orchestrator parks the whole turn
//! here under a fresh correlation token and hands the caller an
//! [`InterruptDescriptor`]. The caller later resolves the token exactly
//! once, with either `resume` or `decline`.
//!
//! # Lifecycle
//!
//! ```text
//! INVOKED ──▶ AWAITING_CONSENT ──┬─▶ GRANTED ──▶ RESUMED
//!                                └─▶ DISMISSED ──▶ DECLINED
//! ```
//!
//! Resolving an interrupt removes it from the registry, so a token can never
//! be resolved twice. A resume after a decline finds nothing and fails with
//! [`GateError::UnknownInterrupt`]. Interrupts left unresolved longer than
//! the registry's TTL are evicted and fail the same way.
//!
//! The registry and the [`ApprovalLedger`] are the only shared mutable state
//! in the orchestration layer. Both are keyed maps behind a short-lived
//! mutex that is never held across an `.await`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use crate::error::GateError;

/// What the user must grant before a suspended call can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequiredGrant {
    /// Connect an account for `connection` with at least `scopes`.
    Credential {
        connection: String,
        scopes: Vec<String>,
    },
    /// Approve one specific action, described by `binding_message`.
    Approval { binding_message: String },
}

impl RequiredGrant {
    pub fn kind(&self) -> GrantKind {
        match self {
            RequiredGrant::Credential { .. } => GrantKind::Credential,
            RequiredGrant::Approval { .. } => GrantKind::Approval,
        }
    }
}

impl fmt::Display for RequiredGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredGrant::Credential { connection, scopes } => {
                write!(f, "connect '{}' ({})", connection, scopes.join(" "))
            }
            RequiredGrant::Approval { binding_message } => {
                write!(f, "approve \"{}\"", binding_message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Credential,
    Approval,
}

/// What the calling surface receives in place of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptDescriptor {
    pub tool: String,
    pub correlation_token: String,
    pub required_grant_kind: GrantKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InterruptDescriptor {
    /// A descriptor for `tool` with a fresh correlation token.
    pub fn new(tool: impl Into<String>, grant: &RequiredGrant) -> Self {
        let (connection_hint, scopes, binding_message) = match grant {
            RequiredGrant::Credential { connection, scopes } => {
                (Some(connection.clone()), scopes.clone(), None)
            }
            RequiredGrant::Approval { binding_message } => {
                (None, Vec::new(), Some(binding_message.clone()))
            }
        };
        Self {
            tool: tool.into(),
            correlation_token: new_correlation_token(),
            required_grant_kind: grant.kind(),
            connection_hint,
            scopes,
            binding_message,
            created_at: Utc::now(),
        }
    }
}

pub fn new_correlation_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A parked continuation and the facts needed to resolve it safely.
#[derive(Debug)]
pub struct PendingInterrupt<C> {
    pub descriptor: InterruptDescriptor,
    pub grant: RequiredGrant,
    /// The subject the turn ran for. Only that subject may resolve it.
    pub subject: String,
    pub continuation: C,
}

/// Live interrupts keyed by correlation token.
pub struct ConsentRegistry<C> {
    pending: Mutex<HashMap<String, PendingInterrupt<C>>>,
    ttl: Option<ChronoDuration>,
}

impl<C> ConsentRegistry<C> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl: None,
        }
    }

    /// Evict interrupts older than `ttl`. `None` keeps them until resolved.
    pub fn with_ttl(mut self, ttl: Option<ChronoDuration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Park `continuation` and return the descriptor to hand to the caller.
    pub fn suspend(
        &self,
        tool: &str,
        grant: RequiredGrant,
        subject: &str,
        continuation: C,
    ) -> Result<InterruptDescriptor> {
        let descriptor = InterruptDescriptor::new(tool, &grant);
        let token = descriptor.correlation_token.clone();
        let mut pending = self.lock()?;
        self.evict_expired(&mut pending, descriptor.created_at);
        pending.insert(
            token,
            PendingInterrupt {
                descriptor: descriptor.clone(),
                grant,
                subject: subject.to_string(),
                continuation,
            },
        );
        Ok(descriptor)
    }

    /// Remove and return the interrupt for `token` if `guard` accepts it.
    ///
    /// A rejected guard leaves the interrupt in place.
    pub fn take<G>(&self, token: &str, guard: G) -> Result<PendingInterrupt<C>>
    where
        G: FnOnce(&PendingInterrupt<C>) -> Result<()>,
    {
        let mut pending = self.lock()?;
        self.evict_expired(&mut pending, Utc::now());
        let entry = pending
            .get(token)
            .ok_or_else(|| GateError::UnknownInterrupt(token.to_string()))?;
        guard(entry)?;
        pending
            .remove(token)
            .ok_or_else(|| GateError::UnknownInterrupt(token.to_string()).into())
    }

    pub fn descriptor(&self, token: &str) -> Result<Option<InterruptDescriptor>> {
        Ok(self.lock()?.get(token).map(|p| p.descriptor.clone()))
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    fn evict_expired(
        &self,
        pending: &mut HashMap<String, PendingInterrupt<C>>,
        now: DateTime<Utc>,
    ) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let before = pending.len();
        pending.retain(|_, p| now.signed_duration_since(p.descriptor.created_at) < ttl);
        let evicted = before - pending.len();
        if evicted > 0 {
            tracing::info!(evicted, "expired consent interrupts evicted");
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingInterrupt<C>>>> {
        self.pending
            .lock()
            .map_err(|_| anyhow!("consent registry lock poisoned"))
    }
}

impl<C> Default for ConsentRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicit approvals recorded per subject and conversation thread.
#[derive(Default)]
pub struct ApprovalLedger {
    approved: Mutex<HashSet<ApprovalKey>>,
}

/// `(subject, thread_id, binding_message)`
type ApprovalKey = (String, String, String);

fn approval_key(subject: &str, thread_id: &str, binding_message: &str) -> ApprovalKey {
    (
        subject.to_string(),
        thread_id.to_string(),
        binding_message.to_string(),
    )
}

impl ApprovalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, subject: &str, thread_id: &str, binding_message: &str) -> Result<()> {
        self.approved
            .lock()
            .map_err(|_| anyhow!("approval ledger lock poisoned"))?
            .insert(approval_key(subject, thread_id, binding_message));
        Ok(())
    }

    pub fn is_approved(
        &self,
        subject: &str,
        thread_id: &str,
        binding_message: &str,
    ) -> Result<bool> {
        Ok(self
            .approved
            .lock()
            .map_err(|_| anyhow!("approval ledger lock poisoned"))?
            .contains(&approval_key(subject, thread_id, binding_message)))
    }
}

/// Keep only `[A-Za-z0-9 +\-_.:,#]` and whitespace, then trim.
///
/// Binding messages are shown verbatim on approval prompts, so anything
/// outside that set is dropped rather than escaped.
pub fn sanitize_binding_message(message: &str) -> String {
    message
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '+' | '-' | '_' | '.' | ':' | ',' | '#')
        })
        .collect::<String>()
        .trim()
        .to_string()
}
