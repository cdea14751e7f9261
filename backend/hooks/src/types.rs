//! Hook lifecycle types.
//!
//! Phases map to the two places the engine exposes: turn execution and
//! distillation. `Before*` phases are awaited and may transform or abort;
//! `After*` phases are observational.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    BeforeTurn,
    AfterTurn,
    BeforeDistill,
    AfterDistill,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPayload {
    pub agent_id: String,
    pub session_id: String,
    pub turn_id: String,
    pub text: String,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompletePayload {
    pub agent_id: String,
    pub session_id: String,
    pub turn_id: String,
    pub response_text: String,
    pub tool_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistillPayload {
    pub agent_id: String,
    pub session_id: String,
    pub messages_before: usize,
    pub tokens_before: u64,
    /// Filled for `AfterDistill`.
    pub messages_after: Option<usize>,
    pub tokens_after: Option<u64>,
    pub summary: Option<String>,
}

/// Phase-tagged payload handed to every hook in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "snake_case")]
pub enum HookPayload {
    BeforeTurn(TurnPayload),
    AfterTurn(TurnCompletePayload),
    BeforeDistill(DistillPayload),
    AfterDistill(DistillPayload),
}

impl HookPayload {
    pub fn phase(&self) -> HookPhase {
        match self {
            HookPayload::BeforeTurn(_) => HookPhase::BeforeTurn,
            HookPayload::AfterTurn(_) => HookPhase::AfterTurn,
            HookPayload::BeforeDistill(_) => HookPhase::BeforeDistill,
            HookPayload::AfterDistill(_) => HookPhase::AfterDistill,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            HookPayload::BeforeTurn(p) => &p.session_id,
            HookPayload::AfterTurn(p) => &p.session_id,
            HookPayload::BeforeDistill(p) | HookPayload::AfterDistill(p) => &p.session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    /// Replacement text for the inbound message (`BeforeTurn` only).
    pub modified_content: Option<String>,
    /// Model to use for this turn instead of the agent default.
    pub model_override: Option<String>,
    pub abort: bool,
    pub reason: Option<String>,
}

impl HookResult {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            abort: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn transform(content: impl Into<String>) -> Self {
        Self {
            modified_content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model_override: Some(model.into()),
            ..Self::default()
        }
    }
}
