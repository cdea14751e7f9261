//! Agora runtime configuration schema.
//!
//! Every section is optional in YAML; missing fields take the values in
//! [`crate::defaults`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::defaults::*;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the Agora turn engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Configured agents (nous)
    #[serde(default)]
    pub agents: Vec<NousConfig>,

    /// Agent that receives messages no binding matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,

    /// Channel + peer routing table
    #[serde(default)]
    pub bindings: Vec<RouteBindingConfig>,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub tool_loop: ToolLoopConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub distillation: DistillationConfig,

    #[serde(default)]
    pub cross_agent: CrossAgentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl RuntimeConfig {
    pub fn agent(&self, id: &str) -> Option<&NousConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NousConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub model: String,
    /// Directory holding SOUL.md, USER.md, and the other workspace files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// Inline identity text, prepended to the workspace files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default)]
    pub tools: ToolPolicyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl NousConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBindingConfig {
    pub channel: String,
    /// Absent means "every peer on this channel"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub agent: String,
}

// ---------------------------------------------------------------------------
// Engine sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    pub context_window: u64,
    pub max_output_tokens: u32,
    pub notes_token_budget: u64,
    pub recall_limit: usize,
    pub recall_timeout_ms: u64,
    /// Inject session metrics every N turns; 0 disables
    pub metrics_every_turns: u64,
    /// Pre-flight distillation fires at this share of the window
    pub overflow_ratio: f64,
    pub overflow_min_messages: u64,
    pub bootstrap_cache_ttl_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            notes_token_budget: DEFAULT_NOTES_TOKEN_BUDGET,
            recall_limit: DEFAULT_RECALL_LIMIT,
            recall_timeout_ms: DEFAULT_RECALL_TIMEOUT_MS,
            metrics_every_turns: DEFAULT_METRICS_EVERY_TURNS,
            overflow_ratio: DEFAULT_OVERFLOW_RATIO,
            overflow_min_messages: DEFAULT_OVERFLOW_MIN_MESSAGES,
            bootstrap_cache_ttl_secs: DEFAULT_BOOTSTRAP_CACHE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolLoopConfig {
    pub max_rounds: u32,
    pub tool_timeout_secs: u64,
    pub loop_window: usize,
    pub loop_warn_threshold: usize,
    pub loop_halt_threshold: usize,
    pub error_streak_warn: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            loop_window: DEFAULT_LOOP_WINDOW,
            loop_warn_threshold: DEFAULT_LOOP_WARN,
            loop_halt_threshold: DEFAULT_LOOP_HALT,
            error_streak_warn: DEFAULT_ERROR_STREAK_WARN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Never ask
    Autonomous,
    /// Ask for irreversible tools and destructive commands
    #[default]
    Guarded,
    /// Ask for everything that is not read-only
    Supervised,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalConfig {
    pub mode: ApprovalMode,
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::default(),
            max_age_secs: DEFAULT_APPROVAL_MAX_AGE_SECS,
            sweep_interval_secs: DEFAULT_APPROVAL_SWEEP_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistillationConfig {
    pub min_messages: usize,
    pub preserve_recent_messages: usize,
    pub preserve_recent_tokens: u64,
    /// Extraction input above this is split into chunks
    pub chunk_token_ceiling: u64,
    /// Model for extraction and summary; the agent's model when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Background distillation after a turn above this share of the window
    pub auto_threshold: f64,
    pub workspace_log: bool,
    pub push_to_memory: bool,
    pub max_output_tokens: u32,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            min_messages: DEFAULT_DISTILL_MIN_MESSAGES,
            preserve_recent_messages: DEFAULT_PRESERVE_RECENT_MESSAGES,
            preserve_recent_tokens: DEFAULT_PRESERVE_RECENT_TOKENS,
            chunk_token_ceiling: DEFAULT_CHUNK_TOKEN_CEILING,
            model: None,
            auto_threshold: DEFAULT_AUTO_DISTILL_THRESHOLD,
            workspace_log: true,
            push_to_memory: true,
            max_output_tokens: DEFAULT_DISTILL_MAX_OUTPUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrossAgentConfig {
    /// Turns at or above this depth are rejected
    pub max_depth: u32,
    pub ask_timeout_secs: u64,
    pub max_dispatch_tasks: usize,
    pub dispatch_timeout_secs: u64,
}

impl Default for CrossAgentConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            ask_timeout_secs: DEFAULT_ASK_TIMEOUT_SECS,
            max_dispatch_tasks: DEFAULT_MAX_DISPATCH_TASKS,
            dispatch_timeout_secs: DEFAULT_DISPATCH_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for the rolling JSON log; console only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}
