use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{ContentBlock, ConversationMessage};

// ---------------------------------------------------------------------------
// Model backend
// ---------------------------------------------------------------------------

/// One system prompt block. `cache` marks a cache breakpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    #[serde(default)]
    pub cache: bool,
}

impl SystemBlock {
    pub fn cached(text: impl Into<String>) -> Self {
        Self { text: text.into(), cache: true }
    }

    pub fn dynamic(text: impl Into<String>) -> Self {
        Self { text: text.into(), cache: false }
    }
}

/// Schema of a tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Request to a model backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    /// Total prompt size the backend saw for this call.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// Response from a model backend.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
}

impl CompletionResponse {
    pub fn has_tool_uses(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Incremental output of a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
}

/// Trait for language-model backends.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Send a completion request and return the full response.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Streaming variant. Deltas are pushed to `deltas` before the final
    /// response is returned. Backends without native streaming emit the
    /// whole text as one delta.
    async fn stream(
        &self,
        request: &CompletionRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<CompletionResponse> {
        let response = self.complete(request).await?;
        for block in &response.content {
            let delta = match block {
                ContentBlock::Text { text } => StreamDelta::Text(text.clone()),
                ContentBlock::Thinking { thinking, .. } => StreamDelta::Thinking(thinking.clone()),
                _ => continue,
            };
            if deltas.send(delta).await.is_err() {
                break;
            }
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// How undoable a tool's side effects are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reversibility {
    /// No side effects.
    ReadOnly,
    #[default]
    Reversible,
    Irreversible,
}

impl Reversibility {
    pub fn is_side_effect_free(&self) -> bool {
        matches!(self, Reversibility::ReadOnly)
    }
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub session_id: String,
    pub session_key: String,
    pub turn_id: String,
    /// Depth of the turn executing this tool.
    pub depth: u32,
    pub workspace: PathBuf,
    pub cancel: CancellationToken,
}

/// A capability that an agent can invoke dynamically.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of the tool (e.g., "read").
    fn name(&self) -> &str;

    /// Description for the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    fn reversibility(&self) -> Reversibility {
        Reversibility::Reversible
    }

    /// Whether the tool loop's per-call timeout applies. Tools that bound
    /// their own waits opt out so the outer limit cannot cut them short.
    fn uses_call_timeout(&self) -> bool {
        true
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Watchdog view of named dependencies.
pub trait HealthMonitor: Send + Sync {
    fn dependencies(&self) -> Vec<DependencyHealth>;

    fn is_healthy(&self, name: &str) -> bool {
        self.dependencies()
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.healthy)
            .unwrap_or(true)
    }

    fn unhealthy(&self) -> Vec<DependencyHealth> {
        self.dependencies().into_iter().filter(|d| !d.healthy).collect()
    }
}

/// Name under which the long-term memory subsystem reports health.
pub const MEMORY_DEPENDENCY: &str = "memory";

/// In-process health board, updated by whoever probes the dependencies.
#[derive(Default)]
pub struct HealthBoard {
    entries: RwLock<HashMap<String, DependencyHealth>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, healthy: bool, detail: Option<String>) {
        let name = name.into();
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(name.clone(), DependencyHealth { name, healthy, detail });
        }
    }
}

impl HealthMonitor for HealthBoard {
    fn dependencies(&self) -> Vec<DependencyHealth> {
        let mut deps: Vec<_> = self
            .entries
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default();
        deps.sort_by(|a, b| a.name.cmp(&b.name));
        deps
    }
}

// ---------------------------------------------------------------------------
// Long-term memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub text: String,
    pub score: f32,
}

/// Vector/graph memory shared across sessions of an agent.
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn recall(&self, agent_id: &str, query: &str, limit: usize) -> Result<Vec<RecalledMemory>>;

    async fn remember(&self, agent_id: &str, session_id: &str, facts: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_board_defaults_healthy() {
        let board = HealthBoard::new();
        assert!(board.is_healthy(MEMORY_DEPENDENCY));
        board.set(MEMORY_DEPENDENCY, false, Some("qdrant down".into()));
        assert!(!board.is_healthy(MEMORY_DEPENDENCY));
        assert_eq!(board.unhealthy().len(), 1);
    }

    #[test]
    fn test_usage_context_tokens() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 100,
            cache_write_tokens: 1,
        });
        assert_eq!(total.context_tokens(), 111);
        assert_eq!(total.output_tokens, 5);
    }

    struct Echo;

    #[async_trait]
    impl ModelBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn complete(&self, _req: &CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: vec![ContentBlock::text("pong")],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "echo".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_default_stream_emits_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let req = CompletionRequest {
            model: "echo".into(),
            system: vec![],
            messages: vec![],
            tools: vec![],
            max_tokens: 16,
        };
        let resp = Echo.stream(&req, tx).await.unwrap();
        assert_eq!(resp.text(), "pong");
        assert_eq!(rx.recv().await, Some(StreamDelta::Text("pong".into())));
    }
}
