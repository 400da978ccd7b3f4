//! Bounded multi-step tool orchestration with consent interrupts.
//!
//! A turn alternates model steps and tool calls until the model answers,
//! the step budget runs out, a tool fails, or a gated tool needs a grant.
//!
//! ```text
//!            ┌──────────────────────────────────────┐
//!            ▼                                      │
//!   ChatModel::step ──Final──▶ Completed            │
//!            │                                      │
//!        ToolCalls ──▶ pending queue ──▶ execute ───┘
//!                            │
//!                   ConsentRequired
//!                            ▼
//!              ConsentRegistry::suspend ──▶ Interrupted
//!                            │
//!           resume(token) ───┴─── decline(token) ──▶ Declined
//!                 │
//!     replay the suspended call, then the rest of the queue
//! ```
//!
//! Tool calls within a step run one at a time in the order the model
//! issued them. Only [`ChatModel::step`] counts against the budget, so a
//! resume or decline never spends a step.
//!
//! Invalid tool input and unknown tool names go back to the model as a tool
//! error, because validation runs before any side effect and the model can
//! correct itself. Every other failure ends the turn with one user-visible
//! message.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::consent::{ApprovalLedger, ConsentRegistry, InterruptDescriptor, RequiredGrant};
use crate::error::{as_gate_error, error_code, GateError, GENERIC_FAILURE_MESSAGE};
use crate::rag::{AuthorizedRetrieval, POLICY_UNCONFIGURED_ANSWER};
use crate::session::{require_subject, SessionProvider};
use crate::traits::{validate_params, ToolContext, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that acts on the user's \
behalf through the tools you are given.
Use query_knowledge_base for questions about internal company knowledge; it only returns \
documents the current user is allowed to see, so never guess at content it does not return.
Some tools act on the user's connected accounts. If one of them needs the user to connect an \
account or approve an action, the request is paused until they decide; do not retry it yourself.
Summarize tool results in plain language and say what you did.";

// ═══════════════════════════════════════════════════════════════════════
// Model interface
// ═══════════════════════════════════════════════════════════════════════

/// A message in the turn transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool as offered to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What the model decided to do in one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStep {
    Final(String),
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// A chat model with function calling.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn step(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelStep>;
}

// ═══════════════════════════════════════════════════════════════════════
// Turns
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRequest {
    /// Conversation so far. `system` messages are dropped; use
    /// `system_prompt` instead.
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Replaces the configured system prompt for this turn.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl TurnRequest {
    pub fn question(question: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(question)],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed {
        thread_id: String,
        answer: String,
        messages: Vec<ChatMessage>,
        steps: usize,
    },
    Interrupted {
        thread_id: String,
        interrupt: InterruptDescriptor,
    },
    Declined {
        thread_id: String,
        tool: String,
        message: String,
    },
    Failed {
        thread_id: String,
        code: String,
        message: String,
    },
    BudgetExhausted {
        thread_id: String,
        message: String,
        steps: usize,
    },
}

/// The parked state of an interrupted turn.
///
/// `pending` starts with the call that was suspended, followed by the
/// calls from the same step that have not run yet.
#[derive(Debug)]
pub struct SuspendedTurn {
    thread_id: String,
    messages: Vec<ChatMessage>,
    pending: VecDeque<ToolCall>,
    steps_used: usize,
}

enum CallResult {
    Output(String),
    Suspend(RequiredGrant),
    Fail(anyhow::Error),
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

pub struct Orchestrator {
    chat: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    retrieval: Option<Arc<AuthorizedRetrieval>>,
    approvals: Arc<ApprovalLedger>,
    interrupts: ConsentRegistry<SuspendedTurn>,
    max_steps: usize,
    system_prompt: String,
}

impl Orchestrator {
    pub fn new(chat: Arc<dyn ChatModel>, tools: ToolRegistry) -> Self {
        Self {
            chat,
            tools,
            retrieval: None,
            approvals: Arc::new(ApprovalLedger::new()),
            interrupts: ConsentRegistry::new(),
            max_steps: 12,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_retrieval(mut self, retrieval: Arc<AuthorizedRetrieval>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Evict interrupts left unresolved for longer than `ttl`.
    pub fn with_interrupt_ttl(mut self, ttl: Option<Duration>) -> Self {
        let ttl = ttl.map(|d| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX));
        self.interrupts = ConsentRegistry::new().with_ttl(ttl);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn approvals(&self) -> &Arc<ApprovalLedger> {
        &self.approvals
    }

    pub fn pending_interrupts(&self) -> Result<usize> {
        self.interrupts.pending_count()
    }

    /// Run a new turn for the session's subject.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        session: Arc<dyn SessionProvider>,
    ) -> TurnOutcome {
        let thread_id = request
            .thread_id
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let subject = match require_subject(session.as_ref()).await {
            Ok(s) => s,
            Err(e) => return fail(&thread_id, e),
        };

        let system_prompt = request
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.system_prompt.clone());

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::System {
            content: system_prompt,
        });
        messages.extend(
            request
                .messages
                .into_iter()
                .filter(|m| !matches!(m, ChatMessage::System { .. })),
        );

        tracing::info!(thread = %thread_id, subject = %subject, "starting turn");
        let state = SuspendedTurn {
            thread_id,
            messages,
            pending: VecDeque::new(),
            steps_used: 0,
        };
        self.drive(state, session, subject).await
    }

    /// Grant the interrupt named by `token` and continue its turn.
    ///
    /// The suspended call is replayed with its original input. Only the
    /// subject the turn ran for may resume it.
    pub async fn resume(
        &self,
        token: &str,
        session: Arc<dyn SessionProvider>,
    ) -> Result<TurnOutcome> {
        let subject = require_subject(session.as_ref()).await?;
        let pending = self.interrupts.take(token, |p| owned_by(p.subject.as_str(), &subject))?;

        if let RequiredGrant::Approval { binding_message } = &pending.grant {
            self.approvals.record(
                &pending.subject,
                &pending.continuation.thread_id,
                binding_message,
            )?;
        }

        tracing::info!(token, tool = %pending.descriptor.tool, "resuming suspended turn");
        Ok(self.drive(pending.continuation, session, subject).await)
    }

    /// Dismiss the interrupt named by `token`. Its turn ends; nothing runs.
    pub async fn decline(
        &self,
        token: &str,
        session: Arc<dyn SessionProvider>,
    ) -> Result<TurnOutcome> {
        let subject = require_subject(session.as_ref()).await?;
        let pending = self.interrupts.take(token, |p| owned_by(p.subject.as_str(), &subject))?;

        let tool = pending.descriptor.tool;
        tracing::info!(token, tool = %tool, "interrupt declined");
        Ok(TurnOutcome::Declined {
            thread_id: pending.continuation.thread_id,
            message: format!(
                "Access was not granted, so {} was not run. Nothing was changed.",
                tool
            ),
            tool,
        })
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .tools()
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    async fn drive(
        &self,
        mut state: SuspendedTurn,
        session: Arc<dyn SessionProvider>,
        subject: String,
    ) -> TurnOutcome {
        let ctx = ToolContext::new(session, state.thread_id.clone())
            .with_retrieval(self.retrieval.clone())
            .with_approvals(self.approvals.clone());
        let specs = self.tool_specs();

        loop {
            while let Some(call) = state.pending.front().cloned() {
                match self.execute_call(&call, &ctx).await {
                    CallResult::Output(content) => {
                        state.pending.pop_front();
                        state.messages.push(ChatMessage::Tool {
                            tool_call_id: call.id,
                            name: call.name,
                            content,
                        });
                    }
                    CallResult::Suspend(grant) => {
                        let thread_id = state.thread_id.clone();
                        return match self.interrupts.suspend(&call.name, grant, &subject, state) {
                            Ok(interrupt) => {
                                tracing::info!(
                                    tool = %call.name,
                                    token = %interrupt.correlation_token,
                                    "turn suspended awaiting consent"
                                );
                                TurnOutcome::Interrupted {
                                    thread_id,
                                    interrupt,
                                }
                            }
                            Err(e) => fail(&thread_id, e),
                        };
                    }
                    CallResult::Fail(err) => return fail(&state.thread_id, err),
                }
            }

            if state.steps_used >= self.max_steps {
                tracing::warn!(thread = %state.thread_id, steps = state.steps_used, "step budget exhausted");
                return TurnOutcome::BudgetExhausted {
                    message: GateError::StepBudgetExhausted(self.max_steps).to_string(),
                    thread_id: state.thread_id,
                    steps: state.steps_used,
                };
            }
            state.steps_used += 1;

            let step = match self.chat.step(&state.messages, &specs).await {
                Ok(step) => step,
                Err(e) => {
                    return fail(
                        &state.thread_id,
                        GateError::external("generation provider", e).into(),
                    )
                }
            };

            match step {
                ModelStep::ToolCalls { content, calls } if !calls.is_empty() => {
                    tracing::debug!(step = state.steps_used, calls = calls.len(), "model requested tools");
                    state.messages.push(ChatMessage::Assistant {
                        content,
                        tool_calls: calls.clone(),
                    });
                    state.pending = calls.into();
                }
                ModelStep::ToolCalls { content, .. } => {
                    return complete(state, content.unwrap_or_default());
                }
                ModelStep::Final(text) => return complete(state, text),
            }
        }
    }

    async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> CallResult {
        let Some(tool) = self.tools.find(&call.name) else {
            tracing::warn!(tool = %call.name, "model called an unknown tool");
            return CallResult::Output(tool_error(&format!("unknown tool: {}", call.name)));
        };

        let params = match validate_params(&tool.parameters_schema(), &call.arguments) {
            Ok(p) => p,
            Err(e) => return CallResult::Output(tool_error(&e.to_string())),
        };

        tracing::info!(tool = %call.name, call_id = %call.id, "executing tool");
        match tool.execute(params, ctx).await {
            Ok(value) => CallResult::Output(value.to_string()),
            Err(err) => match as_gate_error(&err) {
                Some(GateError::ConsentRequired(grant)) => CallResult::Suspend(grant.clone()),
                Some(GateError::InvalidInput(message)) => CallResult::Output(tool_error(message)),
                _ => CallResult::Fail(err),
            },
        }
    }
}

fn owned_by(owner: &str, subject: &str) -> Result<()> {
    if owner == subject {
        Ok(())
    } else {
        Err(GateError::AuthorizationDenied("interrupt belongs to another user".to_string()).into())
    }
}

fn tool_error(message: &str) -> String {
    json!({ "error": message }).to_string()
}

fn complete(mut state: SuspendedTurn, answer: String) -> TurnOutcome {
    let answer = answer.trim().to_string();
    state.messages.push(ChatMessage::Assistant {
        content: Some(answer.clone()),
        tool_calls: Vec::new(),
    });
    tracing::info!(thread = %state.thread_id, steps = state.steps_used, "turn completed");
    TurnOutcome::Completed {
        thread_id: state.thread_id,
        answer,
        messages: state.messages,
        steps: state.steps_used,
    }
}

fn fail(thread_id: &str, err: anyhow::Error) -> TurnOutcome {
    tracing::warn!(thread = %thread_id, error = %err, "turn failed");
    TurnOutcome::Failed {
        thread_id: thread_id.to_string(),
        code: error_code(&err).to_string(),
        message: user_message(&err),
    }
}

/// The one message a failed turn shows the user.
pub fn user_message(err: &anyhow::Error) -> String {
    match as_gate_error(err) {
        Some(GateError::PolicyUnconfigured) => POLICY_UNCONFIGURED_ANSWER.to_string(),
        Some(GateError::AuthorizationDenied(_)) => {
            "You need to be signed in to use this assistant.".to_string()
        }
        Some(GateError::ExternalService { service, .. }) => {
            format!("The {} is not responding right now. Please try again later.", service)
        }
        Some(GateError::MissingCredential { connection }) => {
            format!("No connected account is available for {}.", connection)
        }
        Some(other) => other.to_string(),
        None => GENERIC_FAILURE_MESSAGE.to_string(),
    }
}
