use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tokens::estimate_tokens;
use crate::types::{Session, SessionStatus, StoredMessage, StoredRole, WorkingState};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Attributes fixed when a session is first created.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub parent_session_id: Option<String>,
    pub thread_id: Option<String>,
}

/// A message about to be appended. The store assigns id and sequence.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: StoredRole,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub is_error: bool,
    pub token_estimate: u64,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(StoredRole::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(StoredRole::Assistant, content.into())
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut msg = Self::with_role(StoredRole::ToolResult, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg.is_error = is_error;
        msg
    }

    fn with_role(role: StoredRole, content: String) -> Self {
        let token_estimate = estimate_tokens(&content);
        Self {
            role,
            content,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            token_estimate,
        }
    }
}

/// Write-once audit of one distillation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistillationRecord {
    pub session_id: String,
    pub messages_before: u64,
    pub messages_after: u64,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub facts_extracted: u64,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Send,
    Ask,
    Spawn,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Send => "send",
            CallKind::Ask => "ask",
            CallKind::Spawn => "spawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send" => Some(CallKind::Send),
            "ask" => Some(CallKind::Ask),
            "spawn" => Some(CallKind::Spawn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Delivered,
    Responded,
    Timeout,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Delivered => "delivered",
            CallStatus::Responded => "responded",
            CallStatus::Timeout => "timeout",
            CallStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CallStatus::Pending),
            "delivered" => Some(CallStatus::Delivered),
            "responded" => Some(CallStatus::Responded),
            "timeout" => Some(CallStatus::Timeout),
            "error" => Some(CallStatus::Error),
            _ => None,
        }
    }

    /// Terminal rows are never updated again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Pending)
    }
}

/// Audit row for one agent-to-agent call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossAgentCall {
    pub id: String,
    pub source_agent_id: String,
    pub source_session_id: Option<String>,
    pub target_agent_id: String,
    pub target_session_id: Option<String>,
    pub kind: CallKind,
    pub content: String,
    pub response: Option<String>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrossAgentCall {
    pub fn new(
        source_agent_id: impl Into<String>,
        source_session_id: Option<String>,
        target_agent_id: impl Into<String>,
        kind: CallKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_agent_id: source_agent_id.into(),
            source_session_id,
            target_agent_id: target_agent_id.into(),
            target_session_id: None,
            kind,
            content: content.into(),
            response: None,
            status: CallStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub session_id: String,
    pub agent_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub key: String,
    pub value: String,
    pub author_agent_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// An observability signal worth keeping past the log horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSignal {
    pub session_id: Option<String>,
    pub agent_id: String,
    /// e.g. "disagreement", "circuit_breaker".
    pub kind: String,
    pub detail: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable session storage shared by every in-flight turn.
///
/// Single-session updates must be atomic: counters and messages are never
/// observed half-written.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the active session for `(agent_id, session_key)`, creating it if absent.
    async fn open_session(&self, agent_id: &str, session_key: &str, seed: SessionSeed) -> Result<Session>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Append with the next sequence number and bump the session counters.
    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<StoredMessage>;

    /// Messages in `(seq, id)` order.
    async fn messages(&self, session_id: &str, include_distilled: bool) -> Result<Vec<StoredMessage>>;

    /// Record the backend-reported input size of the turn's last call.
    async fn record_turn(&self, session_id: &str, last_input_tokens: u64) -> Result<()>;

    /// Mark `message_ids` distilled, insert `summary` in their place, and
    /// write `record`, all in one transaction.
    async fn apply_distillation(
        &self,
        session_id: &str,
        message_ids: &[i64],
        summary: NewMessage,
        record: &DistillationRecord,
    ) -> Result<Session>;

    async fn distillations(&self, session_id: &str) -> Result<Vec<DistillationRecord>>;

    async fn set_working_state(&self, session_id: &str, state: &WorkingState) -> Result<()>;

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;

    async fn add_note(&self, session_id: &str, agent_id: &str, content: &str) -> Result<Note>;

    /// Notes oldest first.
    async fn notes(&self, session_id: &str) -> Result<Vec<Note>>;

    async fn blackboard_put(
        &self,
        key: &str,
        value: &str,
        author_agent_id: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()>;

    async fn blackboard_get(&self, key: &str) -> Result<Option<BlackboardEntry>>;

    /// Unexpired entries whose key starts with `prefix`, newest first.
    async fn blackboard_list(&self, prefix: &str) -> Result<Vec<BlackboardEntry>>;

    async fn record_cross_agent_call(&self, call: &CrossAgentCall) -> Result<()>;

    /// Move a pending call to a terminal status. No-op if already terminal.
    async fn complete_cross_agent_call(
        &self,
        call_id: &str,
        status: CallStatus,
        response: Option<&str>,
        target_session_id: Option<&str>,
    ) -> Result<bool>;

    async fn get_cross_agent_call(&self, call_id: &str) -> Result<Option<CrossAgentCall>>;

    async fn record_signal(&self, signal: &InteractionSignal) -> Result<()>;

    async fn thread_summary(&self, thread_id: &str) -> Result<Option<String>>;

    async fn set_thread_summary(&self, thread_id: &str, agent_id: &str, summary: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_estimates() {
        let msg = NewMessage::user("hello world, this is a test");
        assert_eq!(msg.role, StoredRole::User);
        assert!(msg.token_estimate > 0);

        let tr = NewMessage::tool_result("tu_1", "read", "ok", true);
        assert_eq!(tr.tool_call_id.as_deref(), Some("tu_1"));
        assert!(tr.is_error);
    }

    #[test]
    fn test_call_status_terminal() {
        assert!(!CallStatus::Pending.is_terminal());
        for s in [CallStatus::Delivered, CallStatus::Responded, CallStatus::Timeout, CallStatus::Error] {
            assert!(s.is_terminal());
            assert_eq!(CallStatus::parse(s.as_str()), Some(s));
        }
    }
}
