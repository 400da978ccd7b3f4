//! End-to-end flows over in-process fakes: retrieval with authorization
//! filtering, and gated tool calls through the orchestrator.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_gate::consent::GrantKind;
use agent_gate::config::CorpusConfig;
use agent_gate::corpus::{FilesystemCorpus, StaticCorpus};
use agent_gate::credentials::{Credential, CredentialBroker, TokenExchange, TokenRequest};
use agent_gate::error::{as_gate_error, GateError};
use agent_gate::gate::{gate, Connection, GatePolicy};
use agent_gate::index::SharedIndex;
use agent_gate::orchestrator::{
    ChatMessage, ChatModel, ModelStep, Orchestrator, ToolCall, ToolSpec, TurnOutcome, TurnRequest,
};
use agent_gate::rag::{
    AnswerStatus, AuthorizedRetrieval, NOT_AUTHORIZED_ANSWER, NO_MATCHES_ANSWER,
    POLICY_UNCONFIGURED_ANSWER,
};
use agent_gate::session::{SessionProvider, StaticSession};
use agent_gate::traits::{Tool, ToolContext, ToolRegistry};
use agent_gate_core::capability::{AuthorizationService, CapabilityTuple, DecisionError};
use agent_gate_core::embedding::EmbeddingProvider;
use agent_gate_core::generation::TextGenerator;
use agent_gate_core::models::Document;

// ============ Fakes ============

const DIMS: usize = 64;

/// Bag-of-words vectors: each lowercase word bumps one hashed bucket.
struct HashedWords {
    calls: AtomicUsize,
}

impl HashedWords {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            word.to_lowercase().hash(&mut h);
            v[(h.finish() as usize) % DIMS] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashedWords {
    fn model_name(&self) -> &str {
        "hashed-words"
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Grants `viewer` on the listed documents; can also report a missing model.
struct FakeAuthz {
    allowed: HashSet<String>,
    no_model: bool,
    calls: AtomicUsize,
}

impl FakeAuthz {
    fn allowing(docs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            allowed: docs.iter().map(|d| format!("doc:{}", d)).collect(),
            no_model: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn without_model() -> Arc<Self> {
        Arc::new(Self {
            allowed: HashSet::new(),
            no_model: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AuthorizationService for FakeAuthz {
    async fn check(&self, tuples: &[CapabilityTuple]) -> Result<Vec<bool>, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.no_model {
            return Err(DecisionError::NoPolicyModel);
        }
        Ok(tuples
            .iter()
            .map(|t| t.relation == "viewer" && self.allowed.contains(&t.object))
            .collect())
    }
}

/// Answers with the first context line and records every prompt.
struct RecordingGenerator {
    prompts: Mutex<Vec<String>>,
}

impl RecordingGenerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for RecordingGenerator {
    fn model_name(&self) -> &str {
        "recording"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let first = prompt
            .lines()
            .skip_while(|l| !l.starts_with("Document 1"))
            .nth(1)
            .unwrap_or("I don't know");
        Ok(format!("{}.", first))
    }
}

struct ScriptedModel {
    steps: Mutex<VecDeque<ModelStep>>,
}

impl ScriptedModel {
    fn new(steps: Vec<ModelStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
        })
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn step(&self, _messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ModelStep> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ModelStep::Final("done".into())))
    }
}

/// Token vault stand-in: the connection is linked once `linked` is set.
struct ToggleVault {
    linked: AtomicBool,
}

#[async_trait]
impl TokenExchange for ToggleVault {
    async fn exchange(&self, request: &TokenRequest<'_>) -> Result<Option<Credential>> {
        Ok(self.linked.load(Ordering::SeqCst).then(|| Credential {
            connection: request.connection.to_string(),
            scopes: request.scopes.to_vec(),
            access_token: format!("token-for-{}", request.subject),
            expires_at: None,
        }))
    }
}

/// A third-party write that counts real executions and keeps their input.
struct CreatePlaylist {
    executed: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Tool for CreatePlaylist {
    fn name(&self) -> &str {
        "create_playlist"
    }

    fn description(&self) -> &str {
        "Create a playlist in the user's music account"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "public": { "type": "boolean", "default": false }
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let cred = ctx.credential("spotify")?;
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(params.clone());
        Ok(json!({
            "playlist_id": "pl_1",
            "title": params["title"],
            "token": cred.access_token,
        }))
    }
}

// ============ Helpers ============

fn retrieval(
    docs: Vec<Document>,
    authz: Arc<FakeAuthz>,
    generator: Arc<RecordingGenerator>,
) -> Arc<AuthorizedRetrieval> {
    let index = Arc::new(SharedIndex::new(
        Arc::new(StaticCorpus::new(docs)),
        HashedWords::new(),
    ));
    Arc::new(AuthorizedRetrieval::new(index, authz, generator, 4))
}

fn sky_corpus() -> Vec<Document> {
    vec![Document::new("doc1", "The sky is blue.")]
}

struct Harness {
    orchestrator: Orchestrator,
    vault: Arc<ToggleVault>,
    executed: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Value>>>,
}

fn harness(policy: GatePolicy, linked: bool, steps: Vec<ModelStep>) -> Harness {
    let vault = Arc::new(ToggleVault {
        linked: AtomicBool::new(linked),
    });
    let executed = Arc::new(AtomicUsize::new(0));
    let inputs = Arc::new(Mutex::new(Vec::new()));

    let mut tools = ToolRegistry::with_builtins();
    tools.register(Box::new(gate(
        Box::new(CreatePlaylist {
            executed: executed.clone(),
            inputs: inputs.clone(),
        }),
        Arc::new(CredentialBroker::new(vault.clone())),
        Connection::new("spotify", vec!["playlist-modify-private".into()]),
        policy,
    )));

    Harness {
        orchestrator: Orchestrator::new(ScriptedModel::new(steps), tools),
        vault,
        executed,
        inputs,
    }
}

fn playlist_steps() -> Vec<ModelStep> {
    vec![
        ModelStep::ToolCalls {
            content: None,
            calls: vec![ToolCall {
                id: "call_1".into(),
                name: "create_playlist".into(),
                arguments: json!({ "title": "Road trip" }),
            }],
        },
        ModelStep::Final("Created your Road trip playlist.".into()),
    ]
}

fn alice() -> Arc<dyn SessionProvider> {
    Arc::new(StaticSession::new("alice").with_refresh_token("rt-alice"))
}

fn bob() -> Arc<dyn SessionProvider> {
    Arc::new(StaticSession::new("bob").with_refresh_token("rt-bob"))
}

fn interrupt_token(outcome: &TurnOutcome) -> String {
    match outcome {
        TurnOutcome::Interrupted { interrupt, .. } => interrupt.correlation_token.clone(),
        other => panic!("expected an interrupt, got {:?}", other),
    }
}

// ============ Retrieval ============

#[tokio::test]
async fn test_authorized_subject_gets_grounded_answer() {
    let authz = FakeAuthz::allowing(&["doc1"]);
    let generator = RecordingGenerator::new();
    let service = retrieval(sky_corpus(), authz, generator.clone());

    let answer = service.answer("sky color", "alice", None).await.unwrap();
    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.allowed.len(), 1);
    assert_eq!(answer.allowed[0].chunk.text, "The sky is blue");
    assert!(answer.answer.contains("blue"));

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("The sky is blue"));
    assert!(prompts[0].contains("Question: sky color"));
}

#[tokio::test]
async fn test_unauthorized_subject_gets_fixed_message() {
    let authz = FakeAuthz::allowing(&[]);
    let generator = RecordingGenerator::new();
    let service = retrieval(sky_corpus(), authz, generator.clone());

    let answer = service.answer("sky color", "mallory", None).await.unwrap();
    assert_eq!(answer.status, AnswerStatus::NotAuthorized);
    assert!(answer.allowed.is_empty());
    assert_eq!(answer.filtered.len(), 1);
    assert_eq!(answer.answer, NOT_AUTHORIZED_ANSWER);
    assert!(generator.prompts().is_empty());
}

#[tokio::test]
async fn test_empty_corpus_skips_authorization() {
    let authz = FakeAuthz::allowing(&["doc1"]);
    let generator = RecordingGenerator::new();
    let service = retrieval(Vec::new(), authz.clone(), generator.clone());

    let answer = service.answer("sky color", "alice", None).await.unwrap();
    assert_eq!(answer.status, AnswerStatus::NoMatches);
    assert_eq!(answer.answer, NO_MATCHES_ANSWER);
    assert_eq!(authz.calls.load(Ordering::SeqCst), 0);
    assert!(generator.prompts().is_empty());
}

#[tokio::test]
async fn test_missing_policy_model_reports_admin_message() {
    let authz = FakeAuthz::without_model();
    let generator = RecordingGenerator::new();
    let service = retrieval(sky_corpus(), authz, generator.clone());

    let answer = service.answer("sky color", "alice", None).await.unwrap();
    assert_eq!(answer.status, AnswerStatus::PolicyUnconfigured);
    assert_eq!(answer.answer, POLICY_UNCONFIGURED_ANSWER);
    assert!(generator.prompts().is_empty());
}

#[tokio::test]
async fn test_denied_text_never_reaches_generator() {
    let docs = vec![
        Document::new("public-faq", "The office opens at nine. The merger is rumored."),
        Document::new("board-minutes", "The merger code name is Falcon. The merger closes in May."),
    ];
    let authz = FakeAuthz::allowing(&["public-faq"]);
    let generator = RecordingGenerator::new();
    let service = retrieval(docs, authz, generator.clone());

    let answer = service
        .answer("what is the merger code name", "alice", Some(10))
        .await
        .unwrap();
    assert_eq!(answer.status, AnswerStatus::Answered);
    assert!(answer
        .allowed
        .iter()
        .all(|c| c.document_id() == "public-faq"));
    assert!(!answer.filtered.is_empty());

    for prompt in generator.prompts() {
        assert!(!prompt.contains("Falcon"));
        assert!(!prompt.contains("closes in May"));
    }
    assert!(!answer.answer.contains("Falcon"));
}

#[tokio::test]
async fn test_filesystem_corpus_ids_drive_authorization() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("public-doc.md"),
        "Support is open on weekdays. The office is in Lisbon.",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("board-roadmap.md"),
        "Support pricing rises next year.",
    )
    .unwrap();
    std::fs::write(dir.path().join(".draft.md"), "Support secret draft.").unwrap();

    let corpus = FilesystemCorpus::new(CorpusConfig {
        root: dir.path().to_path_buf(),
        include_globs: vec!["**/*.md".into()],
        exclude_globs: Vec::new(),
        follow_symlinks: false,
    });
    let index = Arc::new(SharedIndex::new(Arc::new(corpus), HashedWords::new()));
    let authz = FakeAuthz::allowing(&["public-doc"]);
    let generator = RecordingGenerator::new();
    let service = AuthorizedRetrieval::new(index.clone(), authz, generator.clone(), 6);

    let answer = service
        .answer("when is support open", "alice", None)
        .await
        .unwrap();
    assert_eq!(index.get().await.unwrap().document_count(), 2);
    assert!(answer.allowed.iter().all(|c| c.document_id() == "public-doc"));
    assert!(answer
        .filtered
        .iter()
        .all(|c| c.document_id() == "board-roadmap"));
    for prompt in generator.prompts() {
        assert!(!prompt.contains("pricing"));
        assert!(!prompt.contains("secret draft"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_builds_index_once() {
    let embedder = HashedWords::new();
    let docs = vec![
        Document::new("a", "Alpha text."),
        Document::new("b", "Beta text."),
    ];
    let index = Arc::new(SharedIndex::new(
        Arc::new(StaticCorpus::new(docs)),
        embedder.clone(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let index = index.clone();
            tokio::spawn(async move { index.get().await.unwrap() })
        })
        .collect();

    let mut built = Vec::new();
    for h in handles {
        built.push(h.await.unwrap());
    }

    // one embedding call per document, made by exactly one builder
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    assert!(built.iter().all(|i| Arc::ptr_eq(i, &built[0])));
    assert_eq!(built[0].document_count(), 2);
}

// ============ Orchestration ============

#[tokio::test]
async fn test_knowledge_base_tool_through_orchestrator() {
    let generator = RecordingGenerator::new();
    let service = retrieval(sky_corpus(), FakeAuthz::allowing(&["doc1"]), generator);
    let steps = vec![
        ModelStep::ToolCalls {
            content: None,
            calls: vec![ToolCall {
                id: "kb_1".into(),
                name: "query_knowledge_base".into(),
                arguments: json!({ "question": "sky color" }),
            }],
        },
        ModelStep::Final("The sky is blue.".into()),
    ];
    let orchestrator = Orchestrator::new(ScriptedModel::new(steps), ToolRegistry::with_builtins())
        .with_retrieval(service);

    let outcome = orchestrator
        .run_turn(TurnRequest::question("What color is the sky?"), alice())
        .await;
    let TurnOutcome::Completed { messages, answer, .. } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(answer, "The sky is blue.");

    let tool_output = messages
        .iter()
        .find_map(|m| match m {
            ChatMessage::Tool { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    let tool_output: Value = serde_json::from_str(&tool_output).unwrap();
    assert_eq!(tool_output["status"], "answered");
    assert_eq!(tool_output["context"][0]["id"], "doc1");
}

#[tokio::test]
async fn test_missing_credential_interrupts_then_resume_replays() {
    let h = harness(GatePolicy::CredentialOnly, false, playlist_steps());

    let outcome = h
        .orchestrator
        .run_turn(TurnRequest::question("make me a road trip playlist"), alice())
        .await;
    let TurnOutcome::Interrupted { interrupt, .. } = &outcome else {
        panic!("expected an interrupt, got {:?}", outcome);
    };
    assert_eq!(interrupt.tool, "create_playlist");
    assert_eq!(interrupt.required_grant_kind, GrantKind::Credential);
    assert_eq!(interrupt.connection_hint.as_deref(), Some("spotify"));
    assert_eq!(interrupt.scopes, vec!["playlist-modify-private"]);
    assert_eq!(h.executed.load(Ordering::SeqCst), 0);
    assert_eq!(h.orchestrator.pending_interrupts().unwrap(), 1);

    // user links the account
    h.vault.linked.store(true, Ordering::SeqCst);
    let token = interrupt.correlation_token.clone();
    let resumed = h.orchestrator.resume(&token, alice()).await.unwrap();

    let TurnOutcome::Completed { answer, messages, .. } = resumed else {
        panic!("expected completion");
    };
    assert_eq!(answer, "Created your Road trip playlist.");
    assert_eq!(h.executed.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.inputs.lock().unwrap()[0],
        json!({ "title": "Road trip", "public": false })
    );
    assert!(messages.iter().any(|m| matches!(
        m,
        ChatMessage::Tool { content, .. } if content.contains("pl_1") && content.contains("token-for-alice")
    )));
    assert_eq!(h.orchestrator.pending_interrupts().unwrap(), 0);

    // the token is single use
    let err = h.orchestrator.resume(&token, alice()).await.unwrap_err();
    assert!(matches!(
        as_gate_error(&err),
        Some(GateError::UnknownInterrupt(_))
    ));
}

#[tokio::test]
async fn test_decline_is_terminal() {
    let h = harness(GatePolicy::CredentialOnly, false, playlist_steps());
    let outcome = h
        .orchestrator
        .run_turn(TurnRequest::question("make a playlist"), alice())
        .await;
    let token = interrupt_token(&outcome);

    let declined = h.orchestrator.decline(&token, alice()).await.unwrap();
    assert!(matches!(
        declined,
        TurnOutcome::Declined { ref tool, .. } if tool == "create_playlist"
    ));

    h.vault.linked.store(true, Ordering::SeqCst);
    let err = h.orchestrator.resume(&token, alice()).await.unwrap_err();
    assert!(matches!(
        as_gate_error(&err),
        Some(GateError::UnknownInterrupt(_))
    ));
    assert_eq!(h.executed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_explicit_grant_interrupt_and_approval() {
    let h = harness(
        GatePolicy::explicit("Approve creating a playlist"),
        true,
        playlist_steps(),
    );
    let outcome = h
        .orchestrator
        .run_turn(TurnRequest::question("make a playlist"), alice())
        .await;
    let TurnOutcome::Interrupted { interrupt, thread_id } = &outcome else {
        panic!("expected an interrupt");
    };
    assert_eq!(interrupt.required_grant_kind, GrantKind::Approval);
    assert_eq!(
        interrupt.binding_message.as_deref(),
        Some("Approve creating a playlist")
    );
    assert_eq!(h.executed.load(Ordering::SeqCst), 0);

    let resumed = h
        .orchestrator
        .resume(&interrupt.correlation_token, alice())
        .await
        .unwrap();
    assert!(matches!(resumed, TurnOutcome::Completed { .. }));
    assert_eq!(h.executed.load(Ordering::SeqCst), 1);
    assert!(h
        .orchestrator
        .approvals()
        .is_approved("alice", thread_id, "Approve creating a playlist")
        .unwrap());
}

#[tokio::test]
async fn test_approval_does_not_carry_to_another_subject_on_same_thread() {
    let mut steps = playlist_steps();
    steps.extend(playlist_steps());
    let h = harness(GatePolicy::explicit("Approve creating a playlist"), true, steps);
    let on_shared_thread = || TurnRequest {
        thread_id: Some("shared-thread".into()),
        ..TurnRequest::question("make a playlist")
    };

    let outcome = h.orchestrator.run_turn(on_shared_thread(), alice()).await;
    let token = interrupt_token(&outcome);
    let resumed = h.orchestrator.resume(&token, alice()).await.unwrap();
    assert!(matches!(resumed, TurnOutcome::Completed { .. }));
    assert_eq!(h.executed.load(Ordering::SeqCst), 1);

    let outcome = h.orchestrator.run_turn(on_shared_thread(), bob()).await;
    let TurnOutcome::Interrupted { interrupt, .. } = &outcome else {
        panic!("expected bob to need a separate approval, got {:?}", outcome);
    };
    assert_eq!(interrupt.required_grant_kind, GrantKind::Approval);
    assert_eq!(h.executed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_expired_interrupt_cannot_be_resumed() {
    let mut h = harness(GatePolicy::CredentialOnly, false, playlist_steps());
    h.orchestrator = h.orchestrator.with_interrupt_ttl(Some(Duration::ZERO));
    let outcome = h
        .orchestrator
        .run_turn(TurnRequest::question("make a playlist"), alice())
        .await;
    let token = interrupt_token(&outcome);
    h.vault.linked.store(true, Ordering::SeqCst);

    let err = h.orchestrator.resume(&token, alice()).await.unwrap_err();
    assert!(matches!(
        as_gate_error(&err),
        Some(GateError::UnknownInterrupt(_))
    ));
    assert_eq!(h.executed.load(Ordering::SeqCst), 0);
    assert_eq!(h.orchestrator.pending_interrupts().unwrap(), 0);
}

#[tokio::test]
async fn test_other_subject_cannot_resolve_interrupt() {
    let h = harness(GatePolicy::CredentialOnly, false, playlist_steps());
    let outcome = h
        .orchestrator
        .run_turn(TurnRequest::question("make a playlist"), alice())
        .await;
    let token = interrupt_token(&outcome);
    h.vault.linked.store(true, Ordering::SeqCst);

    let err = h.orchestrator.resume(&token, bob()).await.unwrap_err();
    assert!(matches!(
        as_gate_error(&err),
        Some(GateError::AuthorizationDenied(_))
    ));
    assert!(h.orchestrator.decline(&token, bob()).await.is_err());
    assert_eq!(h.executed.load(Ordering::SeqCst), 0);

    // still pending for its owner
    let resumed = h.orchestrator.resume(&token, alice()).await.unwrap();
    assert!(matches!(resumed, TurnOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_linked_connection_runs_without_interrupt() {
    let h = harness(GatePolicy::CredentialOnly, true, playlist_steps());
    let outcome = h
        .orchestrator
        .run_turn(TurnRequest::question("make a playlist"), alice())
        .await;
    assert!(matches!(outcome, TurnOutcome::Completed { steps: 2, .. }));
    assert_eq!(h.executed.load(Ordering::SeqCst), 1);
}
