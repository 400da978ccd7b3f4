//! OpenFGA-compatible authorization decision client.
//!
//! Implements [`AuthorizationService`] with one `batch-check` request per
//! filter call. Checks are tagged with their position as correlation id and
//! mapped back, so the result is aligned with the input however the server
//! orders its response.
//!
//! # Error classification
//!
//! The server's structured `code` field decides what a failure means:
//!
//! | Code | Result |
//! |------|--------|
//! | `latest_authorization_model_not_found` | [`DecisionError::NoPolicyModel`] |
//! | `authorization_model_not_found` | [`DecisionError::NoPolicyModel`] |
//! | anything else, or no body | [`DecisionError::Service`] |
//!
//! A per-check error inside a successful batch response is a service error.
//! No check ever defaults to allowed.
//!
//! # Seeding
//!
//! [`FgaClient::write_model`] and [`FgaClient::write_tuples`] back the
//! `gate fga-init` command, which installs [`default_model`] and the
//! [`public_doc_tuples`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use agent_gate_core::capability::{
    AuthorizationService, CapabilityTuple, DecisionError, DOC_TYPE, USER_TYPE, VIEWER_RELATION,
};

use crate::config::AuthorizationConfig;

const NO_MODEL_CODES: &[&str] = &[
    "latest_authorization_model_not_found",
    "authorization_model_not_found",
];

/// Client-credentials settings for hosted decision services.
struct ClientCredentials {
    token_url: String,
    audience: String,
    client_id: String,
    client_secret: String,
}

pub struct FgaClient {
    client: reqwest::Client,
    api_url: String,
    store_id: String,
    model_id: Option<String>,
    credentials: Option<ClientCredentials>,
}

impl FgaClient {
    pub fn new(config: &AuthorizationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let credentials = match &config.token_issuer {
            Some(issuer) => {
                let client_id = config
                    .client_id
                    .clone()
                    .ok_or_else(|| anyhow!("authorization.client_id required with token_issuer"))?;
                let client_secret = std::env::var(&config.client_secret_env).map_err(|_| {
                    anyhow!(
                        "{} environment variable not set (authorization.client_secret_env)",
                        config.client_secret_env
                    )
                })?;
                let api_url = config.api_url.trim_end_matches('/');
                Some(ClientCredentials {
                    token_url: issuer_token_url(issuer),
                    audience: config
                        .audience
                        .clone()
                        .unwrap_or_else(|| format!("{}/", api_url)),
                    client_id,
                    client_secret,
                })
            }
            None => None,
        };

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            store_id: config.store_id.clone(),
            model_id: config.authorization_model_id.clone(),
            credentials,
        })
    }

    fn store_url(&self, path: &str) -> String {
        format!("{}/stores/{}/{}", self.api_url, self.store_id, path)
    }

    /// A fresh bearer token, or `None` for unauthenticated servers.
    async fn bearer(&self) -> Result<Option<String>> {
        let Some(creds) = &self.credentials else {
            return Ok(None);
        };

        let response = self
            .client
            .post(&creds.token_url)
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": creds.client_id,
                "client_secret": creds.client_secret,
                "audience": creds.audience,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            bail!("FGA token request failed with HTTP {}", status);
        }
        let json: Value = response.json().await?;
        json.get("access_token")
            .and_then(|t| t.as_str())
            .map(|t| Some(t.to_string()))
            .ok_or_else(|| anyhow!("FGA token response has no access_token"))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(u16, Value)> {
        let mut request = self.client.post(self.store_url(path)).json(body);
        if let Some(token) = self.bearer().await? {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let json = response.json().await.unwrap_or(Value::Null);
        Ok((status, json))
    }

    /// Install an authorization model; returns its id.
    pub async fn write_model(&self, model: &Value) -> Result<String> {
        let (status, json) = self.post("authorization-models", model).await?;
        if !(200..300).contains(&status) {
            return Err(anyhow!(classify_error(status, &json)));
        }
        json.get("authorization_model_id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("write_model response has no authorization_model_id"))
    }

    /// Write relationship tuples, optionally against a specific model.
    pub async fn write_tuples(
        &self,
        tuples: &[CapabilityTuple],
        model_id: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({
            "writes": { "tuple_keys": tuples.iter().map(tuple_key).collect::<Vec<_>>() }
        });
        if let Some(id) = model_id.or(self.model_id.as_deref()) {
            body["authorization_model_id"] = json!(id);
        }

        let (status, json) = self.post("write", &body).await?;
        if !(200..300).contains(&status) {
            return Err(anyhow!(classify_error(status, &json)));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationService for FgaClient {
    async fn check(&self, tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError> {
        if tuples.is_empty() {
            return Ok(Vec::new());
        }

        let mut decisions = Vec::with_capacity(tuples.len());
        for chunk in tuples.chunks(MAX_CHECKS_PER_BATCH) {
            let body = batch_check_body(chunk, self.model_id.as_deref());
            let (status, json) = self
                .post("batch-check", &body)
                .await
                .map_err(|e| DecisionError::Service(e.to_string()))?;

            if !(200..300).contains(&status) {
                return Err(classify_error(status, &json));
            }
            decisions.extend(parse_batch_check(&json, chunk.len())?);
        }

        tracing::debug!(checks = tuples.len(), "batch check complete");
        Ok(decisions)
    }
}

/// The server's default cap on checks in one `batch-check` request.
const MAX_CHECKS_PER_BATCH: usize = 50;

fn batch_check_body(tuples: &[CapabilityTuple], model_id: Option<&str>) -> Value {
    let checks: Vec<Value> = tuples
        .iter()
        .enumerate()
        .map(|(i, t)| json!({ "tuple_key": tuple_key(t), "correlation_id": i.to_string() }))
        .collect();
    let mut body = json!({ "checks": checks });
    if let Some(id) = model_id {
        body["authorization_model_id"] = json!(id);
    }
    body
}

fn tuple_key(t: &CapabilityTuple) -> Value {
    json!({ "user": t.user, "relation": t.relation, "object": t.object })
}

fn issuer_token_url(issuer: &str) -> String {
    let issuer = issuer.trim_end_matches('/');
    if issuer.starts_with("http://") || issuer.starts_with("https://") {
        format!("{}/oauth/token", issuer)
    } else {
        format!("https://{}/oauth/token", issuer)
    }
}

/// Map an error response to a [`DecisionError`] by its structured code.
fn classify_error(status: u16, body: &Value) -> DecisionError {
    let code = body.get("code").and_then(|c| c.as_str()).unwrap_or("");
    if NO_MODEL_CODES.contains(&code) {
        return DecisionError::NoPolicyModel;
    }
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("no error body");
    DecisionError::Service(format!("HTTP {} {}: {}", status, code, message))
}

/// Align `result.{correlation_id}.allowed` with the request order.
fn parse_batch_check(json: &Value, expected: usize) -> Result<Vec<bool>, DecisionError> {
    let result = json
        .get("result")
        .and_then(|r| r.as_object())
        .ok_or_else(|| DecisionError::Service("batch-check response has no result".into()))?;

    (0..expected)
        .map(|i| {
            let id = i.to_string();
            let entry = result.get(&id).ok_or_else(|| {
                DecisionError::Service(format!("batch-check response missing check {}", id))
            })?;
            if let Some(err) = entry.get("error").filter(|e| !e.is_null()) {
                return Err(DecisionError::Service(format!("check {} failed: {}", id, err)));
            }
            entry
                .get("allowed")
                .and_then(|a| a.as_bool())
                .ok_or_else(|| DecisionError::Service(format!("check {} has no decision", id)))
        })
        .collect()
}

/// A `user`/`doc` model where `doc#viewer` admits users and `user:*`.
pub fn default_model() -> Value {
    json!({
        "schema_version": "1.1",
        "type_definitions": [
            { "type": USER_TYPE },
            {
                "type": DOC_TYPE,
                "relations": { VIEWER_RELATION: { "this": {} } },
                "metadata": {
                    "relations": {
                        VIEWER_RELATION: {
                            "directly_related_user_types": [
                                { "type": USER_TYPE },
                                { "type": USER_TYPE, "wildcard": {} }
                            ]
                        }
                    }
                }
            }
        ]
    })
}

/// Everyone may view `doc:public-doc`.
pub fn public_doc_tuples() -> Vec<CapabilityTuple> {
    vec![CapabilityTuple::new(
        format!("{}:*", USER_TYPE),
        VIEWER_RELATION,
        format!("{}:public-doc", DOC_TYPE),
    )]
}
