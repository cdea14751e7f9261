//! Model ↔ tool rounds for one turn.
//!
//! Each round calls the model, persists its reply, and executes any tool
//! uses in planned batches. Every call passes the approval gate, runs under
//! a timeout and feeds the loop detector. The loop ends when the model stops
//! asking for tools, the detector halts it, the round ceiling is hit, or the
//! turn is cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_config::ToolLoopConfig;
use agora_core::{
    AgoraError, CompletionRequest, CompletionResponse, ContentBlock, ConversationMessage,
    EventKind, EventSink, ModelBackend, NewMessage, RuntimeEvent, SessionStore, StopReason,
    StreamDelta, SystemBlock, ToolCallRecord, ToolContext, ToolDefinition, ToolFilter,
    ToolRegistry, TurnStreamEvent, Usage,
};
use agora_sandbox::{
    ApprovalGate, ApprovalOutcome, ApprovalPolicy, ApprovalRequest, ApprovalRequirement,
};
use agora_tools::{LoopDetector, LoopDetectorConfig, LoopVerdict, plan_batches};
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::history::encode_assistant;

/// Result content for calls skipped because the turn was cancelled.
pub const CANCELLED_RESULT: &str = "[cancelled: the turn was aborted before this call ran]";

/// Identity and cancellation shared by every stage of one turn.
#[derive(Debug, Clone)]
pub struct TurnScope {
    pub turn_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub session_key: String,
    pub depth: u32,
    pub workspace: PathBuf,
    pub cancel: CancellationToken,
}

impl TurnScope {
    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            session_key: self.session_key.clone(),
            turn_id: self.turn_id.clone(),
            depth: self.depth,
            workspace: self.workspace.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

pub struct LoopRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<ConversationMessage>,
    pub filter: ToolFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    Halted { reason: String },
    MaxRounds,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct LoopOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    /// Prompt size of the last model call.
    pub last_input_tokens: u64,
    pub rounds: u32,
    pub exit: LoopExit,
}

struct PendingCall {
    id: String,
    name: String,
    input: Value,
}

pub struct ToolLoop {
    backend: Arc<dyn ModelBackend>,
    store: Arc<dyn SessionStore>,
    registry: Arc<ToolRegistry>,
    policy: ApprovalPolicy,
    gate: Arc<ApprovalGate>,
    events: Arc<dyn EventSink>,
    config: ToolLoopConfig,
}

impl ToolLoop {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        store: Arc<dyn SessionStore>,
        registry: Arc<ToolRegistry>,
        policy: ApprovalPolicy,
        gate: Arc<ApprovalGate>,
        events: Arc<dyn EventSink>,
        config: ToolLoopConfig,
    ) -> Self {
        Self {
            backend,
            store,
            registry,
            policy,
            gate,
            events,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn run(
        &self,
        scope: &TurnScope,
        request: LoopRequest,
        stream: Option<&mpsc::Sender<TurnStreamEvent>>,
    ) -> Result<LoopOutput, AgoraError> {
        let LoopRequest {
            model,
            max_tokens,
            system,
            tools,
            mut messages,
            filter,
        } = request;
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            window: self.config.loop_window,
            warn_threshold: self.config.loop_warn_threshold,
            halt_threshold: self.config.loop_halt_threshold,
            error_streak_warn: self.config.error_streak_warn,
        });
        let mut out = LoopOutput {
            text: String::new(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            last_input_tokens: 0,
            rounds: 0,
            exit: LoopExit::Completed,
        };

        while out.rounds < self.config.max_rounds {
            if scope.cancel.is_cancelled() {
                out.exit = LoopExit::Aborted;
                return Ok(out);
            }
            out.rounds += 1;
            let completion = CompletionRequest {
                model: model.clone(),
                system: system.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens,
            };
            let response = match self.call_model(&completion, &scope.cancel, stream).await {
                Ok(r) => r,
                Err(AgoraError::Aborted) => {
                    out.exit = LoopExit::Aborted;
                    return Ok(out);
                }
                Err(e) => return Err(e),
            };
            out.usage.add(&response.usage);
            out.last_input_tokens = response.usage.context_tokens();

            if !response.content.is_empty() {
                self.store
                    .append_message(&scope.session_id, NewMessage::assistant(encode_assistant(&response.content)))
                    .await?;
            }
            let calls: Vec<PendingCall> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(PendingCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }),
                    _ => None,
                })
                .collect();
            let text = response.text();
            messages.push(ConversationMessage::assistant_blocks(response.content));

            if calls.is_empty() || response.stop_reason != StopReason::ToolUse {
                debug!(turn_id = %scope.turn_id, rounds = out.rounds, "[ToolLoop] Model finished");
                out.text = text;
                out.exit = LoopExit::Completed;
                return Ok(out);
            }

            let round = self.execute_round(scope, calls, &filter, &mut detector, stream).await?;
            out.tool_calls.extend(round.records);
            let mut blocks = round.results;

            if let Some(reason) = round.halted {
                messages.push(ConversationMessage::user_blocks(blocks));
                let text = format!(
                    "I stopped the tool loop because it was not making progress: {}",
                    reason
                );
                self.persist_text(scope, &text).await?;
                out.text = text;
                out.exit = LoopExit::Halted { reason };
                return Ok(out);
            }
            if round.aborted {
                out.exit = LoopExit::Aborted;
                return Ok(out);
            }
            if !round.warnings.is_empty() {
                blocks.push(ContentBlock::text(format!(
                    "[Loop detector] {}",
                    round.warnings.join(" ")
                )));
            }
            messages.push(ConversationMessage::user_blocks(blocks));
        }

        warn!(turn_id = %scope.turn_id, max_rounds = self.config.max_rounds, "[ToolLoop] Round ceiling reached");
        let text = format!(
            "I reached the limit of {} tool rounds before finishing. Ask me to continue if you want me to keep going.",
            self.config.max_rounds
        );
        self.persist_text(scope, &text).await?;
        out.text = text;
        out.exit = LoopExit::MaxRounds;
        Ok(out)
    }

    async fn persist_text(&self, scope: &TurnScope, text: &str) -> Result<(), AgoraError> {
        self.store
            .append_message(&scope.session_id, NewMessage::assistant(text))
            .await?;
        Ok(())
    }

    async fn call_model(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        stream: Option<&mpsc::Sender<TurnStreamEvent>>,
    ) -> Result<CompletionResponse, AgoraError> {
        let call = async {
            match stream {
                None => self.backend.complete(request).await,
                Some(events) => {
                    let (tx, mut rx) = mpsc::channel::<StreamDelta>(64);
                    let forward = async {
                        while let Some(delta) = rx.recv().await {
                            let event = match delta {
                                StreamDelta::Text(text) => TurnStreamEvent::TextDelta { text },
                                StreamDelta::Thinking(text) => TurnStreamEvent::ThinkingDelta { text },
                            };
                            // A dropped consumer does not stop the turn.
                            let _ = events.send(event).await;
                        }
                    };
                    let (result, ()) = tokio::join!(self.backend.stream(request, tx), forward);
                    result
                }
            }
        };
        tokio::select! {
            result = call => result.map_err(|e| AgoraError::Model(e.to_string())),
            _ = cancel.cancelled() => Err(AgoraError::Aborted),
        }
    }

    // -----------------------------------------------------------------------
    // Tool execution
    // -----------------------------------------------------------------------

    async fn execute_round(
        &self,
        scope: &TurnScope,
        calls: Vec<PendingCall>,
        filter: &ToolFilter,
        detector: &mut LoopDetector,
        stream: Option<&mpsc::Sender<TurnStreamEvent>>,
    ) -> Result<RoundResult, AgoraError> {
        let mut round = RoundResult::default();
        let batches = plan_batches(calls, |c| {
            filter.permits(&c.name) && self.registry.reversibility(&c.name).is_side_effect_free()
        });

        for batch in batches {
            let skip_reason = match (&round.halted, round.aborted || scope.cancel.is_cancelled()) {
                (Some(reason), _) => Some(format!("[skipped: {}]", reason)),
                (None, true) => Some(CANCELLED_RESULT.to_string()),
                _ => None,
            };
            if let Some(content) = skip_reason {
                round.aborted |= round.halted.is_none();
                for call in batch.calls {
                    let record = ToolCallRecord {
                        id: call.id,
                        name: call.name,
                        input: call.input,
                        output: content.clone(),
                        is_error: true,
                        duration_ms: 0,
                    };
                    self.record(scope, &mut round, record, false).await?;
                }
                continue;
            }

            debug!(turn_id = %scope.turn_id, parallel = batch.parallel, size = batch.calls.len(), "[ToolLoop] Executing batch");
            let records = if batch.parallel {
                join_all(batch.calls.into_iter().map(|c| self.execute_call(scope, c, filter, stream))).await
            } else {
                let mut records = Vec::with_capacity(batch.calls.len());
                for call in batch.calls {
                    records.push(self.execute_call(scope, call, filter, stream).await);
                }
                records
            };

            for record in records {
                match detector.record(&record.name, &record.input, record.is_error) {
                    LoopVerdict::Ok => {}
                    LoopVerdict::Warn { reason } => {
                        warn!(turn_id = %scope.turn_id, tool = %record.name, %reason, "[ToolLoop] Loop warning");
                        self.emit(scope, EventKind::LoopWarning, json!({ "tool": record.name, "reason": reason }));
                        round.warnings.push(reason);
                    }
                    LoopVerdict::Halt { reason } => {
                        warn!(turn_id = %scope.turn_id, tool = %record.name, %reason, "[ToolLoop] Loop halted");
                        self.emit(scope, EventKind::LoopHalted, json!({ "tool": record.name, "reason": reason }));
                        round.halted.get_or_insert(reason);
                    }
                }
                self.record(scope, &mut round, record, true).await?;
            }
        }
        Ok(round)
    }

    async fn record(
        &self,
        scope: &TurnScope,
        round: &mut RoundResult,
        record: ToolCallRecord,
        executed: bool,
    ) -> Result<(), AgoraError> {
        self.store
            .append_message(
                &scope.session_id,
                NewMessage::tool_result(&record.id, &record.name, &record.output, record.is_error),
            )
            .await?;
        round
            .results
            .push(ContentBlock::tool_result(&record.id, &record.output, record.is_error));
        if executed {
            round.records.push(record);
        }
        Ok(())
    }

    async fn execute_call(
        &self,
        scope: &TurnScope,
        call: PendingCall,
        filter: &ToolFilter,
        stream: Option<&mpsc::Sender<TurnStreamEvent>>,
    ) -> ToolCallRecord {
        if let Some(events) = stream {
            let _ = events
                .send(TurnStreamEvent::ToolStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;
        }
        let started = Instant::now();
        let (output, is_error) = match self.gated_execute(scope, &call, filter).await {
            Ok(output) => (output, false),
            Err(message) => (message, true),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(events) = stream {
            let _ = events
                .send(TurnStreamEvent::ToolEnd {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    is_error,
                    duration_ms,
                })
                .await;
        }
        let kind = if is_error { EventKind::ToolFailed } else { EventKind::ToolExecuted };
        self.emit(scope, kind, json!({ "tool": call.name, "toolCallId": call.id, "durationMs": duration_ms }));
        info!(
            turn_id = %scope.turn_id,
            tool = %call.name,
            is_error,
            duration_ms,
            "[ToolLoop] Tool call finished"
        );
        ToolCallRecord {
            id: call.id,
            name: call.name,
            input: call.input,
            output,
            is_error,
            duration_ms,
        }
    }

    /// Filter, approval, then timed execution. `Err` carries the text fed
    /// back to the model as an error result.
    async fn gated_execute(
        &self,
        scope: &TurnScope,
        call: &PendingCall,
        filter: &ToolFilter,
    ) -> Result<String, String> {
        if !filter.permits(&call.name) || self.registry.get(&call.name).is_none() {
            return Err(format!("Error: tool '{}' is not available to this agent", call.name));
        }

        let reversibility = self.registry.reversibility(&call.name);
        if let ApprovalRequirement::Required { reason } =
            self.policy.evaluate(&call.name, reversibility, &call.input)
        {
            self.emit(
                scope,
                EventKind::ApprovalRequested,
                json!({ "tool": call.name, "toolCallId": call.id, "reason": reason }),
            );
            let request = ApprovalRequest {
                turn_id: scope.turn_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input: call.input.clone(),
                agent_id: scope.agent_id.clone(),
                session_id: scope.session_id.clone(),
                reason,
            };
            let denial = match self.gate.wait_for_approval(request, &scope.cancel).await {
                Ok(ApprovalOutcome::Approved) => None,
                Ok(ApprovalOutcome::Denied { reason }) => Some(reason),
                Err(e) => Some(e.to_string()),
            };
            self.emit(
                scope,
                EventKind::ApprovalResolved,
                json!({ "tool": call.name, "toolCallId": call.id, "approved": denial.is_none() }),
            );
            if let Some(reason) = denial {
                self.emit(
                    scope,
                    EventKind::ToolDenied,
                    json!({ "tool": call.name, "toolCallId": call.id, "reason": reason }),
                );
                return Err(format!("denied: {}", reason));
            }
        }

        let secs = self.config.tool_timeout_secs;
        let ctx = scope.tool_context();
        let run = self.registry.execute(&call.name, call.input.clone(), &ctx);
        let bounded = self.registry.get(&call.name).is_none_or(|t| t.uses_call_timeout());
        let result = if bounded {
            tokio::time::timeout(Duration::from_secs(secs), run).await
        } else {
            Ok(run.await)
        };
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("Error: {}", e)),
            Err(_) => Err(format!(
                "Error: {}",
                AgoraError::ToolTimeout {
                    tool: call.name.clone(),
                    secs
                }
            )),
        }
    }

    fn emit(&self, scope: &TurnScope, kind: EventKind, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("turnId".into(), Value::String(scope.turn_id.clone()));
        }
        self.events
            .emit(RuntimeEvent::new(&scope.agent_id, kind, payload).in_session(&scope.session_id));
    }
}

#[derive(Default)]
struct RoundResult {
    results: Vec<ContentBlock>,
    records: Vec<ToolCallRecord>,
    warnings: Vec<String>,
    halted: Option<String>,
    aborted: bool,
}
