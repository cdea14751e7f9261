use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::MediaAttachment;

/// A message arriving at the turn coordinator, from a channel or another agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub text: String,
    /// Explicit target agent. Wins over routing.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    /// Cross-agent recursion depth; 0 for channel traffic.
    #[serde(default)]
    pub depth: u32,
    /// Set for spawned sub-agent sessions.
    #[serde(default)]
    pub parent_session_id: Option<String>,
    /// Agent that sent this message, for cross-agent traffic.
    #[serde(default)]
    pub source_agent_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl InboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn to_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn from_peer(mut self, channel: impl Into<String>, peer: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self.peer = Some(peer.into());
        self
    }

    pub fn at_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media.push(media);
        self
    }
}

/// Record of one tool call executed during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// The well-formed result of every submitted turn.
///
/// Stage failures set `error` and leave `text` empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub turn_id: String,
    pub text: String,
    pub agent_id: String,
    pub session_id: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn aborted(&self) -> bool {
        self.error.as_deref() == Some(ABORTED)
    }
}

/// `TurnOutcome::error` value for cancelled turns.
pub const ABORTED: &str = "aborted";

/// Events produced by a streaming turn, drained lazily by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnStreamEvent {
    TurnStart {
        turn_id: String,
        agent_id: String,
        session_id: String,
    },
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolStart {
        id: String,
        name: String,
        input: Value,
    },
    ToolEnd {
        id: String,
        name: String,
        is_error: bool,
        duration_ms: u64,
    },
    TurnAbort {
        reason: String,
    },
    Error {
        message: String,
    },
    TurnComplete {
        outcome: TurnOutcome,
    },
}

impl TurnStreamEvent {
    /// True for the last event a stream will produce.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStreamEvent::TurnComplete { .. })
    }
}
