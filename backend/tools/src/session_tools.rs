//! Session tools: let an agent talk to other agents through the
//! cross-agent dispatcher (send, ask, spawn, dispatch, deliberate).
//!
//! The tools only parse input and format output. Everything that touches
//! the turn engine sits behind [`CrossAgentBackend`].

use std::sync::Arc;
use std::time::Duration;

use agora_core::{AgoraError, Tool, ToolContext};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub const SESSIONS_SEND: &str = "sessions_send";
pub const SESSIONS_ASK: &str = "sessions_ask";
pub const SESSIONS_SPAWN: &str = "sessions_spawn";
pub const SESSIONS_DISPATCH: &str = "sessions_dispatch";
pub const SESSIONS_DELIBERATE: &str = "sessions_deliberate";

// ---------------------------------------------------------------------------
// Call shapes
// ---------------------------------------------------------------------------

/// The turn a cross-agent call is made from.
#[derive(Debug, Clone)]
pub struct CallOrigin {
    pub agent_id: String,
    pub session_id: String,
    pub session_key: String,
    pub depth: u32,
    /// Cancelled when the calling turn is aborted.
    pub cancel: CancellationToken,
}

impl From<&ToolContext> for CallOrigin {
    fn from(ctx: &ToolContext) -> Self {
        Self {
            agent_id: ctx.agent_id.clone(),
            session_id: ctx.session_id.clone(),
            session_key: ctx.session_key.clone(),
            depth: ctx.depth,
            cancel: ctx.cancel.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub call_id: String,
    pub target_agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskReply {
    pub call_id: String,
    pub target_agent_id: String,
    pub session_id: String,
    pub text: String,
    /// Label of the disagreement pattern the reply matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disagreement: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchTask {
    #[serde(alias = "agentId")]
    pub agent: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchTaskResult {
    pub index: usize,
    pub agent: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub results: Vec<DispatchTaskResult>,
    pub succeeded: usize,
    pub failed: usize,
    /// Elapsed time of the whole fan-out.
    pub wall_clock_ms: u64,
    /// Sum of the individual task durations.
    pub sequential_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliberationRequest {
    pub topic: String,
    /// First participant poses and revises; the rest critique.
    pub agents: Vec<String>,
    /// Agent that writes the synthesis. Defaults to the first participant.
    #[serde(default)]
    pub synthesizer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliberationStage {
    Pose,
    Critique,
    Revise,
    Synthesize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliberationPhase {
    pub stage: DeliberationStage,
    pub agent: String,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliberationReport {
    pub topic: String,
    pub phases: Vec<DeliberationPhase>,
    pub conclusion: Option<String>,
}

/// Engine-side implementation of the cross-agent call shapes.
#[async_trait]
pub trait CrossAgentBackend: Send + Sync {
    async fn send(&self, origin: &CallOrigin, target: &str, message: &str) -> Result<SendReceipt, AgoraError>;

    async fn ask(
        &self,
        origin: &CallOrigin,
        target: &str,
        message: &str,
        timeout: Option<Duration>,
    ) -> Result<AskReply, AgoraError>;

    /// Run a sub-agent turn in a fresh child session.
    async fn spawn(
        &self,
        origin: &CallOrigin,
        target: &str,
        task: &str,
        timeout: Option<Duration>,
    ) -> Result<AskReply, AgoraError>;

    async fn dispatch(&self, origin: &CallOrigin, tasks: Vec<DispatchTask>) -> Result<DispatchReport, AgoraError>;

    async fn deliberate(
        &self,
        origin: &CallOrigin,
        request: DeliberationRequest,
    ) -> Result<DeliberationReport, AgoraError>;
}

// ---------------------------------------------------------------------------
// Tool inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendInput {
    agent: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskInput {
    agent: String,
    message: String,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnInput {
    agent: String,
    task: String,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DispatchInput {
    tasks: Vec<DispatchTask>,
}

fn parse<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).with_context(|| format!("invalid arguments for {}", tool))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

pub struct SessionsSendTool {
    backend: Arc<dyn CrossAgentBackend>,
}

impl SessionsSendTool {
    pub fn new(backend: Arc<dyn CrossAgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for SessionsSendTool {
    fn name(&self) -> &str {
        SESSIONS_SEND
    }

    fn description(&self) -> &str {
        "Send a message to another agent without waiting for a reply."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": { "type": "string", "description": "Target agent id" },
                "message": { "type": "string" }
            },
            "required": ["agent", "message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let input: SendInput = parse(SESSIONS_SEND, args)?;
        let receipt = self
            .backend
            .send(&CallOrigin::from(ctx), &input.agent, &input.message)
            .await?;
        to_json(&receipt)
    }
}

pub struct SessionsAskTool {
    backend: Arc<dyn CrossAgentBackend>,
}

impl SessionsAskTool {
    pub fn new(backend: Arc<dyn CrossAgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for SessionsAskTool {
    fn name(&self) -> &str {
        SESSIONS_ASK
    }

    fn uses_call_timeout(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        "Ask another agent a question and wait for its answer."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": { "type": "string", "description": "Target agent id" },
                "message": { "type": "string" },
                "timeoutSecs": { "type": "integer", "minimum": 1 }
            },
            "required": ["agent", "message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let input: AskInput = parse(SESSIONS_ASK, args)?;
        let reply = self
            .backend
            .ask(
                &CallOrigin::from(ctx),
                &input.agent,
                &input.message,
                input.timeout_secs.map(Duration::from_secs),
            )
            .await?;
        to_json(&reply)
    }
}

pub struct SessionsSpawnTool {
    backend: Arc<dyn CrossAgentBackend>,
}

impl SessionsSpawnTool {
    pub fn new(backend: Arc<dyn CrossAgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for SessionsSpawnTool {
    fn name(&self) -> &str {
        SESSIONS_SPAWN
    }

    fn uses_call_timeout(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        "Run a task with another agent in a fresh sub-session and return its result."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": { "type": "string" },
                "task": { "type": "string" },
                "timeoutSecs": { "type": "integer", "minimum": 1 }
            },
            "required": ["agent", "task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let input: SpawnInput = parse(SESSIONS_SPAWN, args)?;
        let reply = self
            .backend
            .spawn(
                &CallOrigin::from(ctx),
                &input.agent,
                &input.task,
                input.timeout_secs.map(Duration::from_secs),
            )
            .await?;
        to_json(&reply)
    }
}

pub struct SessionsDispatchTool {
    backend: Arc<dyn CrossAgentBackend>,
}

impl SessionsDispatchTool {
    pub fn new(backend: Arc<dyn CrossAgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for SessionsDispatchTool {
    fn name(&self) -> &str {
        SESSIONS_DISPATCH
    }

    fn uses_call_timeout(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        "Fan independent tasks out to agents in parallel and collect every result."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent": { "type": "string" },
                            "message": { "type": "string" }
                        },
                        "required": ["agent", "message"]
                    }
                }
            },
            "required": ["tasks"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let input: DispatchInput = parse(SESSIONS_DISPATCH, args)?;
        let report = self.backend.dispatch(&CallOrigin::from(ctx), input.tasks).await?;
        to_json(&report)
    }
}

pub struct SessionsDeliberateTool {
    backend: Arc<dyn CrossAgentBackend>,
}

impl SessionsDeliberateTool {
    pub fn new(backend: Arc<dyn CrossAgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for SessionsDeliberateTool {
    fn name(&self) -> &str {
        SESSIONS_DELIBERATE
    }

    fn uses_call_timeout(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        "Run a structured deliberation (pose, critique, revise, synthesize) across agents."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": { "type": "string" },
                "agents": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "synthesizer": { "type": "string" }
            },
            "required": ["topic", "agents"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let request: DeliberationRequest = parse(SESSIONS_DELIBERATE, args)?;
        let report = self.backend.deliberate(&CallOrigin::from(ctx), request).await?;
        to_json(&report)
    }
}

/// All five session tools over one backend.
pub fn session_tools(backend: Arc<dyn CrossAgentBackend>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SessionsSendTool::new(backend.clone())),
        Arc::new(SessionsAskTool::new(backend.clone())),
        Arc::new(SessionsSpawnTool::new(backend.clone())),
        Arc::new(SessionsDispatchTool::new(backend.clone())),
        Arc::new(SessionsDeliberateTool::new(backend)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, u32, String)>>,
    }

    #[async_trait]
    impl CrossAgentBackend for Recorder {
        async fn send(&self, origin: &CallOrigin, target: &str, _message: &str) -> Result<SendReceipt, AgoraError> {
            self.calls.lock().unwrap().push(("send".into(), origin.depth, target.into()));
            Ok(SendReceipt {
                call_id: "c1".into(),
                target_agent_id: target.into(),
            })
        }

        async fn ask(
            &self,
            origin: &CallOrigin,
            target: &str,
            message: &str,
            timeout: Option<Duration>,
        ) -> Result<AskReply, AgoraError> {
            if timeout == Some(Duration::from_secs(1)) {
                return Err(AgoraError::CrossAgentTimeout {
                    agent: target.into(),
                    secs: 1,
                });
            }
            self.calls.lock().unwrap().push(("ask".into(), origin.depth, target.into()));
            Ok(AskReply {
                call_id: "c2".into(),
                target_agent_id: target.into(),
                session_id: "s2".into(),
                text: format!("echo: {message}"),
                disagreement: None,
            })
        }

        async fn spawn(
            &self,
            origin: &CallOrigin,
            target: &str,
            task: &str,
            timeout: Option<Duration>,
        ) -> Result<AskReply, AgoraError> {
            self.ask(origin, target, task, timeout).await
        }

        async fn dispatch(&self, _origin: &CallOrigin, tasks: Vec<DispatchTask>) -> Result<DispatchReport, AgoraError> {
            Ok(DispatchReport {
                succeeded: tasks.len(),
                failed: 0,
                results: vec![],
                wall_clock_ms: 0,
                sequential_ms: 0,
            })
        }

        async fn deliberate(
            &self,
            _origin: &CallOrigin,
            request: DeliberationRequest,
        ) -> Result<DeliberationReport, AgoraError> {
            Ok(DeliberationReport {
                topic: request.topic,
                phases: vec![],
                conclusion: None,
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "syn".into(),
            session_id: "s1".into(),
            session_key: "main".into(),
            turn_id: "t1".into(),
            depth: 1,
            workspace: std::env::temp_dir(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_ask_passes_origin_depth() {
        let backend = Arc::new(Recorder::default());
        let tool = SessionsAskTool::new(backend.clone());
        let out = tool
            .execute(json!({"agent": "arbor", "message": "hi"}), &ctx())
            .await
            .unwrap();
        let reply: AskReply = serde_json::from_str(&out).unwrap();
        assert_eq!(reply.text, "echo: hi");
        assert_eq!(backend.calls.lock().unwrap()[0], ("ask".to_string(), 1, "arbor".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_error() {
        let tool = SessionsAskTool::new(Arc::new(Recorder::default()));
        let err = tool
            .execute(json!({"agent": "arbor", "message": "hi", "timeoutSecs": 1}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_bad_arguments_rejected() {
        let tool = SessionsDispatchTool::new(Arc::new(Recorder::default()));
        let err = tool.execute(json!({"tasks": "nope"}), &ctx()).await.unwrap_err();
        assert!(err.to_string().contains(SESSIONS_DISPATCH));
    }

    #[test]
    fn test_session_tools_names() {
        let tools = session_tools(Arc::new(Recorder::default()));
        let names: Vec<_> = tools.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(
            names,
            vec![SESSIONS_SEND, SESSIONS_ASK, SESSIONS_SPAWN, SESSIONS_DISPATCH, SESSIONS_DELIBERATE]
        );
    }
}
