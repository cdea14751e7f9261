//! Scripted model backend and harness shared by the engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_config::{RuntimeConfig, prepare_yaml};
use agora_core::{
    ChatRole, CompletionRequest, CompletionResponse, ContentBlock, EventKind, EventSink, ModelBackend,
    RuntimeEvent, StopReason, Usage,
};
use agora_store::SqliteStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::coordinator::{CoordinatorBuilder, TurnCoordinator};

pub const TEST_YAML: &str = r#"
agents:
  - id: syn
    name: Syn
    model: test-model
    identity: You are Syn.
  - id: arbor
    name: Arbor
    model: test-model
    identity: You are Arbor.
  - id: eiron
    name: Eiron
    model: test-model
    identity: You are Eiron.
approval:
  mode: autonomous
distillation:
  workspaceLog: false
"#;

pub fn test_config() -> RuntimeConfig {
    config_from(TEST_YAML)
}

pub fn config_from(yaml: &str) -> RuntimeConfig {
    prepare_yaml(yaml, &HashMap::new()).expect("test config")
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse> + Send + Sync>;

pub struct TestBackend {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl TestBackend {
    pub fn new(
        handler: impl Fn(&CompletionRequest) -> Result<CompletionResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies in order, then "done" forever.
    pub fn scripted(responses: Vec<CompletionResponse>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            Ok(queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| text_response("done")))
        })
    }

    pub fn echo() -> Self {
        Self::new(|req| Ok(text_response(&format!("echo: {}", last_user_text(req)))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(request)
    }
}

pub fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        content: vec![ContentBlock::text(text)],
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 100,
            output_tokens: 10,
            ..Usage::default()
        },
        model: "test-model".into(),
    }
}

pub fn tool_response(calls: &[(&str, &str, Value)]) -> CompletionResponse {
    CompletionResponse {
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
        stop_reason: StopReason::ToolUse,
        usage: Usage {
            input_tokens: 100,
            output_tokens: 10,
            ..Usage::default()
        },
        model: "test-model".into(),
    }
}

/// Identity line of the request, e.g. "You are Arbor.".
pub fn system_text(req: &CompletionRequest) -> String {
    req.system.first().map(|b| b.text.clone()).unwrap_or_default()
}

pub fn last_user_text(req: &CompletionRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User && !m.text().is_empty())
        .map(|m| m.text())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RuntimeEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: RuntimeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub coordinator: Arc<TurnCoordinator>,
    pub store: Arc<SqliteStore>,
    pub backend: Arc<TestBackend>,
    pub events: Arc<RecordingSink>,
}

pub async fn harness(backend: TestBackend) -> Harness {
    harness_with(test_config(), backend, |b| b).await
}

pub async fn harness_with(
    config: RuntimeConfig,
    backend: TestBackend,
    customize: impl FnOnce(CoordinatorBuilder) -> CoordinatorBuilder,
) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().expect("in-memory store"));
    let backend = Arc::new(backend);
    let events = Arc::new(RecordingSink::default());
    let builder = CoordinatorBuilder::new(config, store.clone(), backend.clone()).events(events.clone());
    let coordinator = customize(builder).build().await.expect("coordinator");
    Harness {
        coordinator,
        store,
        backend,
        events,
    }
}
