use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Content blocks
// ---------------------------------------------------------------------------

/// One block of model-facing message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Extended reasoning. Replaying it requires the backend's signature.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    Document {
        media_type: String,
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// Either plain text or a list of blocks, matching the backend's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Normalize into a block list.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text }],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One entry of the conversation array sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Ids of every tool-use block in this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids referenced by every tool-result block in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_plain_user_text(&self) -> bool {
        self.role == ChatRole::User && matches!(self.content, MessageContent::Text(_))
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stored messages
// ---------------------------------------------------------------------------

/// Role of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredRole {
    User,
    Assistant,
    ToolResult,
}

impl StoredRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoredRole::User => "user",
            StoredRole::Assistant => "assistant",
            StoredRole::ToolResult => "tool_result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(StoredRole::User),
            "assistant" => Some(StoredRole::Assistant),
            "tool_result" => Some(StoredRole::ToolResult),
            _ => None,
        }
    }
}

impl fmt::Display for StoredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the append-only session log.
///
/// Assistant messages with tool uses store their blocks as a JSON array in
/// `content`; everything else is plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub seq: i64,
    pub role: StoredRole,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub is_error: bool,
    pub token_estimate: u64,
    pub is_distilled: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Archived,
    Distilled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
            SessionStatus::Distilled => "distilled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "archived" => SessionStatus::Archived,
            "distilled" => SessionStatus::Distilled,
            _ => SessionStatus::Active,
        }
    }
}

/// The agent's self-maintained picture of what it is doing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingState {
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub recent_decisions: Vec<String>,
    #[serde(default)]
    pub open_files: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkingState {
    pub fn is_empty(&self) -> bool {
        self.current_task.is_none()
            && self.completed_steps.is_empty()
            && self.next_steps.is_empty()
            && self.recent_decisions.is_empty()
            && self.open_files.is_empty()
    }

    /// Render as a prompt section.
    pub fn render(&self) -> String {
        let mut out = String::from("## Working State\n");
        if let Some(task) = &self.current_task {
            out.push_str(&format!("Current task: {}\n", task));
        }
        let sections = [
            ("Completed", &self.completed_steps),
            ("Next", &self.next_steps),
            ("Recent decisions", &self.recent_decisions),
            ("Open files", &self.open_files),
        ];
        for (title, items) in sections {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("{}:\n", title));
            for item in items {
                out.push_str(&format!("- {}\n", item));
            }
        }
        out
    }
}

/// One durable conversation thread, keyed by (agent_id, session_key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub session_key: String,
    pub status: SessionStatus,
    pub token_count_estimate: u64,
    /// Undistilled messages currently in the session.
    pub message_count: u64,
    pub last_input_tokens: u64,
    pub distillation_count: u32,
    pub turn_count: u64,
    pub parent_session_id: Option<String>,
    pub thread_id: Option<String>,
    pub working_state: Option<WorkingState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn lock_key(&self) -> String {
        lock_key(&self.agent_id, &self.session_key)
    }
}

/// The per-session serialization key.
pub fn lock_key(agent_id: &str, session_key: &str) -> String {
    format!("{}:{}", agent_id, session_key)
}

/// An inbound media attachment, already base64 encoded by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub media_type: String,
    pub data: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl MediaAttachment {
    pub fn to_block(&self) -> ContentBlock {
        if self.media_type.starts_with("image/") {
            ContentBlock::Image {
                media_type: self.media_type.clone(),
                data: self.data.clone(),
            }
        } else {
            ContentBlock::Document {
                media_type: self.media_type.clone(),
                data: self.data.clone(),
            }
        }
    }
}
