//! Session layer adapter.
//!
//! Login and cookie handling live outside this crate. A [`SessionProvider`]
//! answers two questions on demand, every time they are asked: who is the
//! current subject, and what durable refresh secret does the session hold
//! for them. Neither answer is cached here.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::error::GateError;

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The authenticated subject, or `None` for an anonymous session.
    async fn subject(&self) -> Result<Option<String>>;

    /// The subject's refresh secret, if the session has one.
    async fn refresh_token(&self) -> Result<Option<String>>;
}

/// A session with fixed answers.
///
/// Used for the CLI's `--subject` flag and for requests whose identity was
/// carried in headers.
#[derive(Clone, Default)]
pub struct StaticSession {
    subject: Option<String>,
    refresh_token: Option<String>,
}

impl StaticSession {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            refresh_token: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Build from optional header values; blank values count as absent.
    pub fn from_parts(subject: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            subject: subject.filter(|s| !s.trim().is_empty()),
            refresh_token: refresh_token.filter(|s| !s.trim().is_empty()),
        }
    }
}

impl fmt::Debug for StaticSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSession")
            .field("subject", &self.subject)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn subject(&self) -> Result<Option<String>> {
        Ok(self.subject.clone())
    }

    async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(self.refresh_token.clone())
    }
}

/// The current subject, or [`GateError::AuthorizationDenied`].
pub async fn require_subject(session: &dyn SessionProvider) -> Result<String> {
    match session.subject().await? {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(GateError::AuthorizationDenied("no authenticated user".to_string()).into()),
    }
}
