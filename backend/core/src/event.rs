use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structured event emitted by the turn engine.
/// Every turn, tool call, approval, and distillation is reported as one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Categories of events that can occur inside the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A turn entered the pipeline
    TurnStarted,
    /// A turn produced its final outcome
    TurnCompleted,
    /// A pipeline stage failed
    TurnFailed,
    /// A turn was cancelled
    TurnAborted,
    /// A tool call returned
    ToolExecuted,
    /// A tool call raised or timed out
    ToolFailed,
    /// A tool call was refused by the approval gate
    ToolDenied,
    /// The loop detector saw a repeating pattern
    LoopWarning,
    /// The loop detector stopped the tool loop
    LoopHalted,
    ApprovalRequested,
    ApprovalResolved,
    DistillationCompleted,
    DistillationFailed,
    /// A send/ask/spawn/dispatch between agents
    CrossAgentCall,
    /// A response contained pushback against the asker
    Disagreement,
    /// An inbound message was refused before reaching the model
    CircuitBreaker,
}

impl RuntimeEvent {
    pub fn new(agent_id: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            session_id: None,
            kind,
            payload,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Destination for runtime events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RuntimeEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: RuntimeEvent) {}
}
