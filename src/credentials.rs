//! Delegated credentials for third-party connections.
//!
//! The [`CredentialBroker`] turns the session's durable refresh secret into
//! a short-lived access token for one connection, on every call. Nothing is
//! cached and nothing is persisted: a tool call that needs a token gets a
//! freshly minted one, and the token is dropped with the call's context.
//!
//! # Resolution
//!
//! 1. Require an authenticated subject ([`GateError::AuthorizationDenied`]).
//! 2. Read the refresh secret from the session. None on file is
//!    [`GateError::MissingCredential`].
//! 3. Exchange it through a [`TokenExchange`]. "No linked account" is also
//!    `MissingCredential`; transport or server failures are
//!    [`GateError::ExternalService`].
//! 4. If the exchange reports granted scopes, every requested scope must be
//!    among them. A shortfall means the user must reconnect with the wider
//!    scope set, so it is `MissingCredential` too.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, TokenVaultConfig};
use crate::error::GateError;
use crate::session::{require_subject, SessionProvider};

const TOKEN_EXCHANGE_GRANT: &str =
    "urn:auth0:params:oauth:grant-type:token-exchange:federated-connection-access-token";
const REFRESH_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:refresh_token";
const CONNECTION_TOKEN_TYPE: &str = "http://auth0.com/oauth/token-type/federated-connection-access-token";

/// A scoped access token for one connection.
#[derive(Clone)]
pub struct Credential {
    pub connection: String,
    /// Scopes the issuer granted; empty when it did not say.
    pub scopes: Vec<String>,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("connection", &self.connection)
            .field("scopes", &self.scopes)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Input to a [`TokenExchange`].
pub struct TokenRequest<'a> {
    pub subject: &'a str,
    pub connection: &'a str,
    pub scopes: &'a [String],
    pub refresh_token: &'a str,
}

/// Mints connection tokens from a refresh secret.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// `Ok(None)` means the subject has no usable link to `connection`.
    async fn exchange(&self, request: &TokenRequest<'_>) -> Result<Option<Credential>>;
}

/// Used when no token vault is configured: every connection is unlinked.
pub struct UnconfiguredExchange;

#[async_trait]
impl TokenExchange for UnconfiguredExchange {
    async fn exchange(&self, _request: &TokenRequest<'_>) -> Result<Option<Credential>> {
        Ok(None)
    }
}

/// Stateless resolver from (session, connection, scopes) to a credential.
#[derive(Clone)]
pub struct CredentialBroker {
    exchange: Arc<dyn TokenExchange>,
}

impl CredentialBroker {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self { exchange }
    }

    /// A broker backed by `[token_vault]`, or one that never finds a
    /// credential if the section is absent.
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.token_vault {
            Some(vault) => Ok(Self::new(Arc::new(TokenVaultExchange::new(vault)?))),
            None => Ok(Self::new(Arc::new(UnconfiguredExchange))),
        }
    }

    pub async fn resolve(
        &self,
        session: &dyn SessionProvider,
        connection: &str,
        scopes: &[String],
    ) -> Result<Credential> {
        let subject = require_subject(session).await?;
        let missing = || GateError::MissingCredential {
            connection: connection.to_string(),
        };

        let Some(refresh_token) = session.refresh_token().await? else {
            tracing::debug!(connection, "no refresh secret in session");
            return Err(missing().into());
        };

        let request = TokenRequest {
            subject: &subject,
            connection,
            scopes,
            refresh_token: &refresh_token,
        };
        let Some(credential) = self.exchange.exchange(&request).await? else {
            tracing::debug!(connection, "no linked account for connection");
            return Err(missing().into());
        };

        if !credential.scopes.is_empty() {
            if let Some(absent) = scopes.iter().find(|s| !credential.scopes.contains(s)) {
                tracing::debug!(connection, scope = %absent, "granted scopes fall short");
                return Err(missing().into());
            }
        }

        Ok(credential)
    }
}

/// Token vault client using the federated-connection token exchange grant.
pub struct TokenVaultExchange {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
}

impl TokenVaultExchange {
    pub fn new(config: &TokenVaultConfig) -> Result<Self> {
        let client_secret = std::env::var(&config.client_secret_env).map_err(|_| {
            anyhow!(
                "{} environment variable not set (token_vault.client_secret_env)",
                config.client_secret_env
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: token_endpoint(&config.domain),
            client_id: config.client_id.clone(),
            client_secret,
        })
    }
}

#[async_trait]
impl TokenExchange for TokenVaultExchange {
    async fn exchange(&self, request: &TokenRequest<'_>) -> Result<Option<Credential>> {
        let body = serde_json::json!({
            "grant_type": TOKEN_EXCHANGE_GRANT,
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "subject_token_type": REFRESH_TOKEN_TYPE,
            "subject_token": request.refresh_token,
            "requested_token_type": CONNECTION_TOKEN_TYPE,
            "connection": request.connection,
            "scope": request.scopes.join(" "),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::external("token vault", e))?;

        let status = response.status();
        let json: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            return parse_token_response(request.connection, &json).map(Some);
        }
        if is_unlinked(status.as_u16(), &json) {
            return Ok(None);
        }

        let code = json
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown_error");
        Err(GateError::external("token vault", format!("HTTP {}: {}", status, code)).into())
    }
}

fn token_endpoint(domain: &str) -> String {
    let domain = domain.trim_end_matches('/');
    if domain.starts_with("http://") || domain.starts_with("https://") {
        format!("{}/oauth/token", domain)
    } else {
        format!("https://{}/oauth/token", domain)
    }
}

/// Whether an error response means "no linked account" rather than a fault.
///
/// Only the vault's own "no federated token" codes count. A 401, 403, or
/// `unauthorized_client` points at the gate's client credentials and is a
/// service failure.
fn is_unlinked(status: u16, body: &Value) -> bool {
    let code = body.get("error").and_then(|e| e.as_str()).unwrap_or("");
    status < 500
        && matches!(
            code,
            "federated_connection_refresh_token_not_found" | "invalid_grant"
        )
}

fn parse_token_response(connection: &str, json: &Value) -> Result<Credential> {
    let access_token = json
        .get("access_token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GateError::external("token vault", "response has no access_token"))?;

    let scopes = json
        .get("scope")
        .and_then(|s| s.as_str())
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let expires_at = json
        .get("expires_in")
        .and_then(|e| e.as_i64())
        .and_then(ChronoDuration::try_seconds)
        .and_then(|d| Utc::now().checked_add_signed(d));

    Ok(Credential {
        connection: connection.to_string(),
        scopes,
        access_token: access_token.to_string(),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_gate_error;
    use crate::session::StaticSession;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedExchange {
        granted: Option<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchange for FixedExchange {
        async fn exchange(&self, request: &TokenRequest<'_>) -> Result<Option<Credential>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.granted.as_ref().map(|scopes| Credential {
                connection: request.connection.to_string(),
                scopes: scopes.clone(),
                access_token: format!("tok-{}", request.subject),
                expires_at: None,
            }))
        }
    }

    fn broker(granted: Option<Vec<&str>>) -> (CredentialBroker, Arc<FixedExchange>) {
        let exchange = Arc::new(FixedExchange {
            granted: granted.map(|g| g.into_iter().map(String::from).collect()),
            calls: AtomicUsize::new(0),
        });
        (CredentialBroker::new(exchange.clone()), exchange)
    }

    fn scopes(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    fn is_missing(err: &anyhow::Error) -> bool {
        matches!(as_gate_error(err), Some(GateError::MissingCredential { .. }))
    }

    #[tokio::test]
    async fn test_resolves_fresh_each_call() {
        let (broker, exchange) = broker(Some(vec!["read", "write"]));
        let session = StaticSession::new("alice").with_refresh_token("rt");
        let wanted = scopes(&["read"]);

        let a = broker.resolve(&session, "spotify", &wanted).await.unwrap();
        let b = broker.resolve(&session, "spotify", &wanted).await.unwrap();
        assert_eq!(a.access_token, "tok-alice");
        assert_eq!(b.connection, "spotify");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_refresh_secret_is_missing() {
        let (broker, exchange) = broker(Some(vec![]));
        let err = broker
            .resolve(&StaticSession::new("alice"), "spotify", &[])
            .await
            .unwrap_err();
        assert!(is_missing(&err));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unlinked_is_missing() {
        let (broker, _) = broker(None);
        let session = StaticSession::new("alice").with_refresh_token("rt");
        let err = broker.resolve(&session, "spotify", &[]).await.unwrap_err();
        assert!(is_missing(&err));
    }

    #[tokio::test]
    async fn test_scope_shortfall_is_missing() {
        let (broker, _) = broker(Some(vec!["read"]));
        let session = StaticSession::new("alice").with_refresh_token("rt");
        let err = broker
            .resolve(&session, "spotify", &scopes(&["read", "write"]))
            .await
            .unwrap_err();
        assert!(is_missing(&err));
    }

    #[tokio::test]
    async fn test_anonymous_is_denied() {
        let (broker, _) = broker(Some(vec![]));
        let err = broker
            .resolve(&StaticSession::anonymous(), "spotify", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            as_gate_error(&err),
            Some(GateError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn test_token_endpoint() {
        assert_eq!(
            token_endpoint("tenant.us.auth0.com"),
            "https://tenant.us.auth0.com/oauth/token"
        );
        assert_eq!(
            token_endpoint("http://localhost:9000/"),
            "http://localhost:9000/oauth/token"
        );
    }

    #[test]
    fn test_parse_token_response() {
        let json = serde_json::json!({
            "access_token": "abc",
            "scope": "read write",
            "expires_in": 3600
        });
        let cred = parse_token_response("spotify", &json).unwrap();
        assert_eq!(cred.scopes, vec!["read", "write"]);
        assert!(cred.expires_at.is_some());
        assert!(!format!("{:?}", cred).contains("abc"));

        assert!(parse_token_response("spotify", &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_out_of_range_expiry_is_dropped() {
        for secs in [i64::MAX, i64::MIN] {
            let json = serde_json::json!({ "access_token": "abc", "expires_in": secs });
            let cred = parse_token_response("spotify", &json).unwrap();
            assert!(cred.expires_at.is_none());
        }
    }

    #[test]
    fn test_unlinked_classification() {
        assert!(is_unlinked(
            400,
            &serde_json::json!({ "error": "federated_connection_refresh_token_not_found" })
        ));
        assert!(is_unlinked(403, &serde_json::json!({ "error": "invalid_grant" })));

        // client misconfiguration is a service failure, not a missing link
        assert!(!is_unlinked(401, &Value::Null));
        assert!(!is_unlinked(403, &Value::Null));
        assert!(!is_unlinked(404, &Value::Null));
        assert!(!is_unlinked(401, &serde_json::json!({ "error": "unauthorized_client" })));
        assert!(!is_unlinked(500, &Value::Null));
        assert!(!is_unlinked(400, &serde_json::json!({ "error": "invalid_request" })));
    }
}
