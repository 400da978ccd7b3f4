//! OpenAI-compatible chat completions.
//!
//! [`OpenAIChat`] implements both generation interfaces:
//! - [`TextGenerator`] for the retrieval service's single grounded answer,
//! - [`ChatModel`] for the orchestrator's tool-calling steps.
//!
//! Any server speaking the `/chat/completions` wire format works, including
//! OpenRouter. Requests use the same retry strategy as the embedding
//! providers.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use agent_gate_core::generation::TextGenerator;

use crate::config::GenerationConfig;
use crate::embedding::post_with_retry;
use crate::orchestrator::{ChatMessage, ChatModel, ModelStep, ToolCall, ToolSpec};

pub struct OpenAIChat {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAIChat {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model,
            api_key,
            max_retries: config.max_retries,
        })
    }

    async fn complete(&self, body: &Value) -> Result<Value> {
        let json = post_with_retry(self.max_retries, "generation provider", || {
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(body)
        })
        .await?;

        json.pointer("/choices/0/message")
            .cloned()
            .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message"))
    }
}

#[async_trait]
impl TextGenerator for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let message = self.complete(&body).await?;
        Ok(message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn step(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelStep> {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(to_wire).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }

        let message = self.complete(&body).await?;
        parse_step(&message)
    }
}

/// Our transcript message in the chat completions wire format.
fn to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({ "role": "system", "content": content }),
        ChatMessage::User { content } => json!({ "role": "user", "content": content }),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut wire = json!({ "role": "assistant", "content": content });
            if !tool_calls.is_empty() {
                wire["tool_calls"] = tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments.to_string() }
                        })
                    })
                    .collect();
            }
            wire
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
            ..
        } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
    }
}

/// Read a `choices[0].message` object into a [`ModelStep`].
///
/// Arguments that are not valid JSON are kept as a string, so parameter
/// validation rejects them and the model sees why.
fn parse_step(message: &Value) -> Result<ModelStep> {
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    let calls = match message.get("tool_calls").and_then(|t| t.as_array()) {
        Some(calls) => calls
            .iter()
            .map(|c| {
                let id = c.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                let name = c
                    .pointer("/function/name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| anyhow!("Invalid chat response: tool call without a name"))?;
                let raw = c
                    .pointer("/function/arguments")
                    .and_then(|a| a.as_str())
                    .unwrap_or("{}");
                let arguments = serde_json::from_str(raw).unwrap_or_else(|_| json!(raw));
                Ok(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    if calls.is_empty() {
        return Ok(ModelStep::Final(content.unwrap_or_default()));
    }
    Ok(ModelStep::ToolCalls { content, calls })
}

/// Stands in when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

#[async_trait]
impl ChatModel for DisabledGenerator {
    async fn step(&self, _messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ModelStep> {
        bail!("Generation provider is disabled")
    }
}

/// Both generation interfaces, backed by the configured provider.
pub struct Generators {
    pub text: Arc<dyn TextGenerator>,
    pub chat: Arc<dyn ChatModel>,
}

pub fn create_generators(config: &GenerationConfig) -> Result<Generators> {
    match config.provider.as_str() {
        "disabled" => Ok(Generators {
            text: Arc::new(DisabledGenerator),
            chat: Arc::new(DisabledGenerator),
        }),
        "openai" => {
            let client = Arc::new(OpenAIChat::new(config)?);
            Ok(Generators {
                text: client.clone(),
                chat: client,
            })
        }
        other => bail!("Unknown generation provider: {}", other),
    }
}
