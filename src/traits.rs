//! The tool extension point.
//!
//! Agents act through [`Tool`]s. A tool is a name, a description, a JSON
//! Schema for its parameters, and an async `execute`. The orchestrator
//! offers every registered tool to the model and dispatches the calls it
//! makes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  ┌──────────────┐   ┌──────────────────┐ │
//! │  │  Built-in    │   │  Gated actions   │ │
//! │  │ query_kb     │   │ GatedTool<inner> │ │
//! │  └──────────────┘   └──────────────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        Orchestrator::run_turn()
//! ```
//!
//! Tools report distinguished failures by returning a
//! [`GateError`](crate::error::GateError) inside the `anyhow::Error`. The
//! orchestrator downcasts to decide whether to suspend, feed the error back
//! to the model, or end the turn.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::consent::ApprovalLedger;
use crate::credentials::Credential;
use crate::error::GateError;
use crate::rag::AuthorizedRetrieval;
use crate::session::{require_subject, SessionProvider};

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// An action that agents can discover and call.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use agent_gate::traits::{Tool, ToolContext};
///
/// pub struct WhoAmI;
///
/// #[async_trait]
/// impl Tool for WhoAmI {
///     fn name(&self) -> &str { "who_am_i" }
///     fn description(&self) -> &str { "Return the current user id" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {} })
///     }
///
///     async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
///         Ok(json!({ "subject": ctx.subject().await? }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores (e.g. `"create_playlist"`).
    fn name(&self) -> &str;

    /// One-line description the model uses to decide whether to call it.
    fn description(&self) -> &str;

    /// Whether this tool ships with the crate. Defaults to `false`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// OpenAI function-calling JSON Schema with `type: "object"`,
    /// `properties`, and optionally `required`.
    fn parameters_schema(&self) -> Value;

    /// Execute with parameters that already passed [`validate_params`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Per-call context handed to [`Tool::execute`].
///
/// Built by the orchestrator for each call. A gated tool receives a copy
/// carrying the credential that was minted for that one call.
#[derive(Clone)]
pub struct ToolContext {
    session: Arc<dyn SessionProvider>,
    thread_id: String,
    retrieval: Option<Arc<AuthorizedRetrieval>>,
    approvals: Arc<ApprovalLedger>,
    credential: Option<Credential>,
}

impl ToolContext {
    pub fn new(session: Arc<dyn SessionProvider>, thread_id: impl Into<String>) -> Self {
        Self {
            session,
            thread_id: thread_id.into(),
            retrieval: None,
            approvals: Arc::new(ApprovalLedger::new()),
            credential: None,
        }
    }

    pub fn with_retrieval(mut self, retrieval: Option<Arc<AuthorizedRetrieval>>) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalLedger>) -> Self {
        self.approvals = approvals;
        self
    }

    /// A copy of this context carrying `credential`.
    pub fn with_credential(&self, credential: Credential) -> Self {
        Self {
            credential: Some(credential),
            ..self.clone()
        }
    }

    pub fn session(&self) -> &dyn SessionProvider {
        self.session.as_ref()
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn approvals(&self) -> &ApprovalLedger {
        &self.approvals
    }

    /// The current subject, or `AuthorizationDenied`.
    pub async fn subject(&self) -> Result<String> {
        require_subject(self.session.as_ref()).await
    }

    /// The credential minted for this call, if it is for `connection`.
    ///
    /// Fails with `MissingCredential` otherwise, which the gate turns into
    /// a consent interrupt.
    pub fn credential(&self, connection: &str) -> Result<&Credential> {
        self.credential
            .as_ref()
            .filter(|c| c.connection == connection)
            .ok_or_else(|| {
                GateError::MissingCredential {
                    connection: connection.to_string(),
                }
                .into()
            })
    }

    pub fn retrieval(&self) -> Result<&AuthorizedRetrieval> {
        match &self.retrieval {
            Some(r) => Ok(r.as_ref()),
            None => bail!("knowledge base is not configured"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter validation
// ═══════════════════════════════════════════════════════════════════════

/// Check `params` against a tool's schema and fill in defaults.
///
/// Validates required fields, `type`, `enum`, and numeric `minimum` /
/// `maximum`. Failures are [`GateError::InvalidInput`].
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let params_obj = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => return Err(invalid(format!("parameters must be an object, got {}", json_type_name(other)))),
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    for req_field in &required {
        if !params_obj.contains_key(*req_field) {
            return Err(invalid(format!("missing required parameter: {}", req_field)));
        }
    }

    let mut result = params_obj.clone();

    for (prop_name, prop_schema) in &properties {
        let Some(value) = params_obj.get(prop_name) else {
            if let Some(default) = prop_schema.get("default") {
                result.insert(prop_name.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected_type) = prop_schema.get("type").and_then(|t| t.as_str()) {
            let type_ok = match expected_type {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !type_ok {
                return Err(invalid(format!(
                    "parameter '{}' must be of type '{}', got {}",
                    prop_name,
                    expected_type,
                    json_type_name(value)
                )));
            }
        }

        if let Some(enum_values) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !enum_values.contains(value) {
                let allowed: Vec<String> = enum_values.iter().map(|v| v.to_string()).collect();
                return Err(invalid(format!(
                    "parameter '{}' must be one of [{}], got {}",
                    prop_name,
                    allowed.join(", "),
                    value
                )));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = prop_schema.get("minimum").and_then(|m| m.as_f64()) {
                if n < min {
                    return Err(invalid(format!("parameter '{}' must be >= {}", prop_name, min)));
                }
            }
            if let Some(max) = prop_schema.get("maximum").and_then(|m| m.as_f64()) {
                if n > max {
                    return Err(invalid(format!("parameter '{}' must be <= {}", prop_name, max)));
                }
            }
        }
    }

    Ok(Value::Object(result))
}

fn invalid(message: String) -> anyhow::Error {
    GateError::InvalidInput(message).into()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tools
// ═══════════════════════════════════════════════════════════════════════

/// Answers questions from the knowledge base using only documents the
/// current user may view.
pub struct KnowledgeBaseTool;

#[derive(Debug, Serialize)]
struct ContextEntry {
    id: String,
    text: String,
    score: f64,
}

fn context_entries(chunks: &[agent_gate_core::models::ScoredChunk]) -> Vec<ContextEntry> {
    chunks
        .iter()
        .map(|c| ContextEntry {
            id: c.document_id().to_string(),
            text: c.chunk.text.clone(),
            score: (c.score as f64 * 1000.0).round() / 1000.0,
        })
        .collect()
}

#[async_trait]
impl Tool for KnowledgeBaseTool {
    fn name(&self) -> &str {
        "query_knowledge_base"
    }

    fn description(&self) -> &str {
        "Answer a question from the internal knowledge base, using only documents the current user is authorized to view"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question to answer" },
                "top_k": {
                    "type": "integer",
                    "description": "Number of passages to retrieve",
                    "minimum": 1,
                    "maximum": 20
                },
                "include_filtered": {
                    "type": "boolean",
                    "description": "Also return passages that matched but were not authorized",
                    "default": false
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let question = params["question"].as_str().unwrap_or("");
        if question.trim().is_empty() {
            return Err(invalid("question must not be empty".to_string()));
        }
        let top_k = params["top_k"].as_u64().map(|k| k as usize);
        let include_filtered = params["include_filtered"].as_bool().unwrap_or(false);

        let subject = ctx.subject().await?;
        let answer = ctx.retrieval()?.answer(question, &subject, top_k).await?;

        let mut out = json!({
            "answer": answer.answer,
            "status": answer.status,
            "context": context_entries(&answer.allowed),
        });
        if include_filtered {
            out["filtered"] = serde_json::to_value(context_entries(&answer.filtered))?;
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Serializable tool info for the `/tools/list` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    /// OpenAI function-calling JSON Schema.
    pub parameters: Value,
}

/// Registry of the tools offered to the model.
///
/// ```rust
/// use agent_gate::traits::ToolRegistry;
///
/// let tools = ToolRegistry::with_builtins();
/// assert!(tools.find("query_knowledge_base").is_some());
/// ```
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// A registry holding the built-in knowledge-base tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(KnowledgeBaseTool));
        registry
    }

    /// Register a tool. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                builtin: t.is_builtin(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
