//! Config defaults: constants for every knob, plus the pass that fills
//! fields whose default depends on other fields.

use crate::io::config_dir;
use crate::schema::RuntimeConfig;

/// Default context window size (tokens).
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Default max tokens for model responses.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 16_384;

pub const DEFAULT_NOTES_TOKEN_BUDGET: u64 = 2_000;
pub const DEFAULT_RECALL_LIMIT: usize = 8;
pub const DEFAULT_RECALL_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_METRICS_EVERY_TURNS: u64 = 10;
pub const DEFAULT_OVERFLOW_RATIO: f64 = 0.9;
pub const DEFAULT_OVERFLOW_MIN_MESSAGES: u64 = 10;
pub const DEFAULT_BOOTSTRAP_CACHE_TTL_SECS: u64 = 600;

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 40;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOOP_WINDOW: usize = 12;
pub const DEFAULT_LOOP_WARN: usize = 3;
pub const DEFAULT_LOOP_HALT: usize = 5;
pub const DEFAULT_ERROR_STREAK_WARN: usize = 4;

/// Pending approvals older than this are auto-denied.
pub const DEFAULT_APPROVAL_MAX_AGE_SECS: u64 = 300;
pub const DEFAULT_APPROVAL_SWEEP_SECS: u64 = 30;

pub const DEFAULT_DISTILL_MIN_MESSAGES: usize = 6;
pub const DEFAULT_PRESERVE_RECENT_MESSAGES: usize = 4;
pub const DEFAULT_PRESERVE_RECENT_TOKENS: u64 = 8_000;
pub const DEFAULT_CHUNK_TOKEN_CEILING: u64 = 40_000;
pub const DEFAULT_AUTO_DISTILL_THRESHOLD: f64 = 0.7;
pub const DEFAULT_DISTILL_MAX_OUTPUT: u32 = 4_096;

/// Default cross-agent ping-pong ceiling.
pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const DEFAULT_ASK_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_DISPATCH_TASKS: usize = 10;
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_DB_FILE: &str = "agora.db";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: RuntimeConfig) -> RuntimeConfig {
    let config = apply_default_agent(config);
    let config = apply_agent_workspaces(config);
    apply_storage_defaults(config)
}

/// The first configured agent catches unrouted traffic.
fn apply_default_agent(mut config: RuntimeConfig) -> RuntimeConfig {
    if config.default_agent.is_none() {
        config.default_agent = config.agents.first().map(|a| a.id.clone());
    }
    config
}

/// Agents without a workspace get `<config_dir>/workspaces/<id>`.
fn apply_agent_workspaces(mut config: RuntimeConfig) -> RuntimeConfig {
    let root = config_dir().join("workspaces");
    for agent in &mut config.agents {
        if agent.workspace.is_none() {
            agent.workspace = Some(root.join(&agent.id));
        }
    }
    config
}

fn apply_storage_defaults(mut config: RuntimeConfig) -> RuntimeConfig {
    if config.storage.db_path.is_none() {
        config.storage.db_path = Some(config_dir().join(DEFAULT_DB_FILE));
    }
    config
}
