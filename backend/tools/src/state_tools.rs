//! Tools that write durable agent state: session notes, the shared
//! blackboard, and the working-state snapshot.

use std::sync::Arc;

use agora_core::{SessionStore, Tool, ToolContext, WorkingState};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

/// Blackboard keys under this prefix are shown to every agent as broadcasts.
pub const BROADCAST_PREFIX: &str = "broadcast:";

pub const NOTE_TOOL: &str = "note";
pub const BLACKBOARD_TOOL: &str = "blackboard";
pub const WORKING_STATE_TOOL: &str = "working_state";

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum NoteAction {
    Add { content: String },
    List,
}

pub struct NoteTool {
    store: Arc<dyn SessionStore>,
}

impl NoteTool {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for NoteTool {
    fn name(&self) -> &str {
        NOTE_TOOL
    }

    fn description(&self) -> &str {
        "Keep short notes that stay in your context for the rest of this session."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["add", "list"] },
                "content": { "type": "string" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let action: NoteAction = serde_json::from_value(args).context("invalid note arguments")?;
        match action {
            NoteAction::Add { content } => {
                if content.trim().is_empty() {
                    bail!("note content is empty");
                }
                let note = self.store.add_note(&ctx.session_id, &ctx.agent_id, &content).await?;
                Ok(format!("Saved note #{}", note.id))
            }
            NoteAction::List => {
                let notes = self.store.notes(&ctx.session_id).await?;
                if notes.is_empty() {
                    return Ok("No notes.".to_string());
                }
                Ok(notes
                    .iter()
                    .map(|n| format!("#{} {}", n.id, n.content))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Blackboard
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum BlackboardAction {
    Write {
        key: String,
        value: String,
        #[serde(default, rename = "ttlSecs")]
        ttl_secs: Option<u64>,
    },
    Read {
        key: String,
    },
    List {
        #[serde(default)]
        prefix: String,
    },
    Broadcast {
        message: String,
        #[serde(default, rename = "ttlSecs")]
        ttl_secs: Option<u64>,
    },
}

pub struct BlackboardTool {
    store: Arc<dyn SessionStore>,
}

impl BlackboardTool {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for BlackboardTool {
    fn name(&self) -> &str {
        BLACKBOARD_TOOL
    }

    fn description(&self) -> &str {
        "Shared key/value board visible to all agents. Broadcasts appear in every agent's context until they expire."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["write", "read", "list", "broadcast"] },
                "key": { "type": "string" },
                "value": { "type": "string" },
                "message": { "type": "string" },
                "prefix": { "type": "string" },
                "ttlSecs": { "type": "integer", "minimum": 1 }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let action: BlackboardAction =
            serde_json::from_value(args).context("invalid blackboard arguments")?;
        match action {
            BlackboardAction::Write { key, value, ttl_secs } => {
                self.store.blackboard_put(&key, &value, &ctx.agent_id, ttl_secs).await?;
                Ok(format!("Wrote {}", key))
            }
            BlackboardAction::Read { key } => Ok(match self.store.blackboard_get(&key).await? {
                Some(entry) => entry.value,
                None => format!("No entry for {}", key),
            }),
            BlackboardAction::List { prefix } => {
                let entries = self.store.blackboard_list(&prefix).await?;
                let listing: Vec<Value> = entries
                    .iter()
                    .map(|e| json!({ "key": e.key, "value": e.value, "author": e.author_agent_id }))
                    .collect();
                Ok(serde_json::to_string_pretty(&listing)?)
            }
            BlackboardAction::Broadcast { message, ttl_secs } => {
                let key = format!(
                    "{}{}:{}",
                    BROADCAST_PREFIX,
                    ctx.agent_id,
                    Utc::now().timestamp_millis()
                );
                self.store
                    .blackboard_put(&key, &message, &ctx.agent_id, ttl_secs.or(Some(3600)))
                    .await?;
                Ok(format!("Broadcast as {}", key))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Working state
// ---------------------------------------------------------------------------

pub struct WorkingStateTool {
    store: Arc<dyn SessionStore>,
}

impl WorkingStateTool {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for WorkingStateTool {
    fn name(&self) -> &str {
        WORKING_STATE_TOOL
    }

    fn description(&self) -> &str {
        "Replace your working-state snapshot (current task, steps, decisions, open files). It survives distillation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "currentTask": { "type": "string" },
                "completedSteps": { "type": "array", "items": { "type": "string" } },
                "nextSteps": { "type": "array", "items": { "type": "string" } },
                "recentDecisions": { "type": "array", "items": { "type": "string" } },
                "openFiles": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let mut state: WorkingState =
            serde_json::from_value(args).context("invalid working_state arguments")?;
        state.updated_at = Some(Utc::now());
        self.store.set_working_state(&ctx.session_id, &state).await?;
        Ok("Working state updated.".to_string())
    }
}

/// Note, blackboard and working-state tools over one store.
pub fn state_tools(store: Arc<dyn SessionStore>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(NoteTool::new(store.clone())),
        Arc::new(BlackboardTool::new(store.clone())),
        Arc::new(WorkingStateTool::new(store)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::SessionSeed;
    use agora_store::SqliteStore;
    use tokio_util::sync::CancellationToken;

    async fn setup() -> (Arc<dyn SessionStore>, ToolContext) {
        let store: Arc<dyn SessionStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let session = store
            .open_session("syn", "main", SessionSeed::default())
            .await
            .unwrap();
        let ctx = ToolContext {
            agent_id: "syn".into(),
            session_id: session.id,
            session_key: "main".into(),
            turn_id: "t1".into(),
            depth: 0,
            workspace: std::env::temp_dir(),
            cancel: CancellationToken::new(),
        };
        (store, ctx)
    }

    #[tokio::test]
    async fn test_notes_add_and_list() {
        let (store, ctx) = setup().await;
        let tool = NoteTool::new(store.clone());
        tool.execute(json!({"action": "add", "content": "user prefers metric"}), &ctx)
            .await
            .unwrap();
        let listed = tool.execute(json!({"action": "list"}), &ctx).await.unwrap();
        assert!(listed.contains("user prefers metric"));
        assert!(tool
            .execute(json!({"action": "add", "content": "  "}), &ctx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_broadcast_lands_under_prefix() {
        let (store, ctx) = setup().await;
        let tool = BlackboardTool::new(store.clone());
        tool.execute(json!({"action": "broadcast", "message": "deploy frozen"}), &ctx)
            .await
            .unwrap();
        let entries = store.blackboard_list(BROADCAST_PREFIX).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "deploy frozen");
        assert_eq!(entries[0].author_agent_id, "syn");
    }

    #[tokio::test]
    async fn test_blackboard_write_read() {
        let (store, ctx) = setup().await;
        let tool = BlackboardTool::new(store);
        tool.execute(json!({"action": "write", "key": "plan", "value": "v2"}), &ctx)
            .await
            .unwrap();
        let v = tool.execute(json!({"action": "read", "key": "plan"}), &ctx).await.unwrap();
        assert_eq!(v, "v2");
    }

    #[tokio::test]
    async fn test_working_state_persisted() {
        let (store, ctx) = setup().await;
        let tool = WorkingStateTool::new(store.clone());
        tool.execute(json!({"currentTask": "migrate db", "nextSteps": ["backup"]}), &ctx)
            .await
            .unwrap();
        let session = store.get_session(&ctx.session_id).await.unwrap().unwrap();
        let state = session.working_state.unwrap();
        assert_eq!(state.current_task.as_deref(), Some("migrate db"));
        assert_eq!(state.next_steps, vec!["backup".to_string()]);
    }
}
