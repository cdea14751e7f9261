//! Two-pass distillation of old session history.
//!
//! Pass one extracts structured facts chunk by chunk; pass two writes a
//! prose summary from the merged extraction. The older messages are then
//! marked distilled and replaced by one summary message, in a single store
//! transaction. At most one distillation runs per session.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use agora_config::{DistillationConfig, NousConfig};
use agora_core::{
    AgoraError, CompletionRequest, ContentBlock, ConversationMessage, DistillationRecord,
    EventKind, EventSink, LongTermMemory, ModelBackend, NewMessage, NullEventSink, RuntimeEvent,
    SessionStore, StoredMessage, StoredRole, SystemBlock, estimate_tokens,
};
use agora_hooks::{DistillPayload, HookPipeline};
use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::extract::{Extraction, parse_extraction};
use crate::history::{SUMMARY_MARKER, parse_assistant};

/// Appended under the agent workspace after every distillation.
pub const DISTILLATION_LOG: &str = "memory/distillations.md";

const TOOL_RESULT_EXCERPT: usize = 2_000;

const EXTRACTION_PROMPT: &str = "You extract durable information from a conversation transcript. \
Reply with one JSON object and nothing else, with the keys facts, decisions, openItems, entities \
and contradictions. Each value is an array of short self-contained strings.";

const SUMMARY_PROMPT: &str = "You compress conversation history for an assistant that will pick \
the conversation up later. Write a concise prose summary of what happened and where things stand. \
Do not invent details.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistillTrigger {
    /// Context was near overflow before a turn.
    Preflight,
    /// Background run after a large turn.
    Auto,
    Manual,
}

impl DistillTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistillTrigger::Preflight => "preflight",
            DistillTrigger::Auto => "auto",
            DistillTrigger::Manual => "manual",
        }
    }
}

pub struct DistillationPipeline {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn ModelBackend>,
    config: DistillationConfig,
    hooks: HookPipeline,
    events: Arc<dyn EventSink>,
    memory: Option<Arc<dyn LongTermMemory>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases the per-session claim when the run ends, however it ends.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.session_id);
        }
    }
}

impl DistillationPipeline {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn ModelBackend>,
        config: DistillationConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            hooks: HookPipeline::default(),
            events: Arc::new(NullEventSink),
            memory: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: HookPipeline) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_memory(mut self, memory: Option<Arc<dyn LongTermMemory>>) -> Self {
        self.memory = memory;
        self
    }

    pub fn config(&self) -> &DistillationConfig {
        &self.config
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(session_id))
            .unwrap_or(false)
    }

    /// Distill the older part of `session_id`.
    ///
    /// Fails with [`AgoraError::DistillationInProgress`] while another run
    /// holds the session and with [`AgoraError::NothingToDistill`] when too
    /// few messages sit outside the preserved tail.
    pub async fn distill(
        &self,
        agent: &NousConfig,
        session_id: &str,
        trigger: DistillTrigger,
    ) -> Result<DistillationRecord, AgoraError> {
        let _guard = self.claim(session_id)?;
        match self.run(agent, session_id, trigger).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if !matches!(e, AgoraError::NothingToDistill { .. }) {
                    warn!(session_id, trigger = trigger.as_str(), error = %e, "[Distill] Failed");
                    self.events.emit(
                        RuntimeEvent::new(
                            &agent.id,
                            EventKind::DistillationFailed,
                            json!({ "trigger": trigger.as_str(), "error": e.to_string() }),
                        )
                        .in_session(session_id),
                    );
                }
                Err(e)
            }
        }
    }

    fn claim(&self, session_id: &str) -> Result<FlightGuard<'_>, AgoraError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| AgoraError::DistillationInProgress(session_id.to_string()))?;
        if !set.insert(session_id.to_string()) {
            debug!(session_id, "[Distill] Already running");
            return Err(AgoraError::DistillationInProgress(session_id.to_string()));
        }
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            session_id: session_id.to_string(),
        })
    }

    async fn run(
        &self,
        agent: &NousConfig,
        session_id: &str,
        trigger: DistillTrigger,
    ) -> Result<DistillationRecord, AgoraError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AgoraError::Store(format!("unknown session: {}", session_id)))?;
        let messages = self.store.messages(session_id, false).await?;
        let boundary = split_point(
            &messages,
            self.config.preserve_recent_messages,
            self.config.preserve_recent_tokens,
        );
        let (older, recent) = messages.split_at(boundary);
        if older.len() < self.config.min_messages {
            return Err(AgoraError::NothingToDistill {
                available: older.len(),
                minimum: self.config.min_messages,
            });
        }

        let tokens_before: u64 = messages.iter().map(|m| m.token_estimate).sum();
        let verdict = self
            .hooks
            .before_distill(DistillPayload {
                agent_id: agent.id.clone(),
                session_id: session_id.to_string(),
                messages_before: messages.len(),
                tokens_before,
                messages_after: None,
                tokens_after: None,
                summary: None,
            })
            .await;
        if verdict.abort {
            return Err(AgoraError::Other(anyhow::anyhow!(
                "distillation blocked by hook: {}",
                verdict.reason.unwrap_or_default()
            )));
        }

        info!(
            session_id,
            trigger = trigger.as_str(),
            distilling = older.len(),
            preserved = recent.len(),
            "[Distill] Starting"
        );

        let model = self.config.model.clone().unwrap_or_else(|| agent.model.clone());
        let chunks = chunk_transcript(older, self.config.chunk_token_ceiling);
        let mut extraction = Extraction::default();
        for chunk in &chunks {
            let raw = self.ask(&model, EXTRACTION_PROMPT, chunk).await?;
            extraction.merge(parse_extraction(&raw));
        }

        let summary_input = if extraction.is_empty() {
            chunks.last().cloned().unwrap_or_default()
        } else {
            extraction.render()
        };
        let summary = self.ask(&model, SUMMARY_PROMPT, &summary_input).await?;
        let summary = summary.trim().to_string();

        let mut content = format!("{}\n{}", SUMMARY_MARKER, summary);
        if !extraction.is_empty() {
            content.push_str("\n\n");
            content.push_str(&extraction.render());
        }
        let summary_message = NewMessage::user(content);
        let summary_tokens = summary_message.token_estimate;

        let record = DistillationRecord {
            session_id: session_id.to_string(),
            messages_before: messages.len() as u64,
            messages_after: recent.len() as u64 + 1,
            tokens_before,
            tokens_after: recent.iter().map(|m| m.token_estimate).sum::<u64>() + summary_tokens,
            facts_extracted: extraction.facts.len() as u64,
            model,
            created_at: Utc::now(),
        };
        let ids: Vec<i64> = older.iter().map(|m| m.id).collect();
        let updated = self
            .store
            .apply_distillation(session_id, &ids, summary_message, &record)
            .await?;

        if let Some(thread_id) = &session.thread_id {
            if let Err(e) = self.store.set_thread_summary(thread_id, &agent.id, &summary).await {
                warn!(thread_id, error = %e, "[Distill] Thread summary not saved");
            }
        }
        if self.config.push_to_memory && !extraction.facts.is_empty() {
            if let Some(memory) = &self.memory {
                if let Err(e) = memory.remember(&agent.id, session_id, &extraction.facts).await {
                    warn!(session_id, error = %e, "[Distill] Memory push failed");
                }
            }
        }
        if self.config.workspace_log {
            if let Some(workspace) = &agent.workspace {
                if let Err(e) = append_log(workspace, &record, &summary).await {
                    warn!(session_id, error = %e, "[Distill] Workspace log not written");
                }
            }
        }

        info!(
            session_id,
            messages_before = record.messages_before,
            messages_after = updated.message_count,
            tokens_before = record.tokens_before,
            tokens_after = record.tokens_after,
            facts = record.facts_extracted,
            "[Distill] Completed"
        );
        self.events.emit(
            RuntimeEvent::new(
                &agent.id,
                EventKind::DistillationCompleted,
                json!({
                    "trigger": trigger.as_str(),
                    "messagesBefore": record.messages_before,
                    "messagesAfter": record.messages_after,
                    "tokensBefore": record.tokens_before,
                    "tokensAfter": record.tokens_after,
                    "factsExtracted": record.facts_extracted,
                }),
            )
            .in_session(session_id),
        );
        self.hooks.after_distill(DistillPayload {
            agent_id: agent.id.clone(),
            session_id: session_id.to_string(),
            messages_before: messages.len(),
            tokens_before,
            messages_after: Some(record.messages_after as usize),
            tokens_after: Some(record.tokens_after),
            summary: Some(summary),
        });
        Ok(record)
    }

    async fn ask(&self, model: &str, system: &str, input: &str) -> Result<String, AgoraError> {
        let request = CompletionRequest {
            model: model.to_string(),
            system: vec![SystemBlock::cached(system)],
            messages: vec![ConversationMessage::user_text(input)],
            tools: Vec::new(),
            max_tokens: self.config.max_output_tokens,
        };
        let response = self
            .backend
            .complete(&request)
            .await
            .map_err(|e| AgoraError::Model(e.to_string()))?;
        Ok(response.text())
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Index where the preserved tail starts.
///
/// The tail is the longest suffix within both limits. It never opens on a
/// tool result, so a tool use and its results land on the same side.
pub fn split_point(messages: &[StoredMessage], keep_messages: usize, keep_tokens: u64) -> usize {
    let mut boundary = messages.len();
    let mut tokens = 0u64;
    while boundary > 0 {
        let candidate = &messages[boundary - 1];
        if messages.len() - boundary >= keep_messages
            || tokens + candidate.token_estimate > keep_tokens
        {
            break;
        }
        tokens += candidate.token_estimate;
        boundary -= 1;
    }
    while boundary < messages.len() && messages[boundary].role == StoredRole::ToolResult {
        boundary += 1;
    }
    boundary
}

fn render_message(message: &StoredMessage) -> String {
    match message.role {
        StoredRole::User => format!("User: {}", message.content),
        StoredRole::Assistant => {
            let parts: Vec<String> = parse_assistant(&message.content)
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text),
                    ContentBlock::ToolUse { name, input, .. } => {
                        Some(format!("[called {} with {}]", name, input))
                    }
                    _ => None,
                })
                .collect();
            format!("Assistant: {}", parts.join("\n"))
        }
        StoredRole::ToolResult => {
            let name = message.tool_name.as_deref().unwrap_or("tool");
            let excerpt: String = message.content.chars().take(TOOL_RESULT_EXCERPT).collect();
            let status = if message.is_error { " (error)" } else { "" };
            format!("Tool result from {}{}: {}", name, status, excerpt)
        }
    }
}

/// Render `messages` as transcript text split under `ceiling` tokens each.
/// A single oversized message still gets a chunk of its own.
pub fn chunk_transcript(messages: &[StoredMessage], ceiling: u64) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0u64;
    for message in messages {
        let line = render_message(message);
        let tokens = estimate_tokens(&line);
        if !current.is_empty() && current_tokens + tokens > ceiling {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&line);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn append_log(workspace: &Path, record: &DistillationRecord, summary: &str) -> anyhow::Result<()> {
    let path = workspace.join(DISTILLATION_LOG);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let entry = format!(
        "\n## {} ({})\n\n{} messages -> {}, {} tokens -> {}\n\n{}\n",
        record.created_at.format("%Y-%m-%d %H:%M UTC"),
        record.session_id,
        record.messages_before,
        record.messages_after,
        record.tokens_before,
        record.tokens_after,
        summary
    );
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(entry.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBackend, system_text, text_response};
    use agora_core::SessionSeed;
    use agora_store::SqliteStore;
    use std::time::Duration;

    const EXTRACTED: &str = r#"Here you go: {"facts": ["User lives in Oslo"], "decisions": ["Use SQLite"], "openItems": [], "entities": ["Oslo"], "contradictions": []}"#;

    fn backend() -> TestBackend {
        TestBackend::new(|req| {
            if system_text(req).starts_with("You extract") {
                Ok(text_response(EXTRACTED))
            } else {
                Ok(text_response("The user planned a trip and chose SQLite."))
            }
        })
    }

    fn agent() -> NousConfig {
        NousConfig {
            id: "syn".into(),
            model: "test-model".into(),
            ..Default::default()
        }
    }

    fn config() -> DistillationConfig {
        DistillationConfig {
            workspace_log: false,
            ..Default::default()
        }
    }

    async fn seeded(count: usize) -> (Arc<SqliteStore>, String) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let seed = SessionSeed {
            thread_id: Some("signal:+1555".into()),
            ..Default::default()
        };
        let session = store.open_session("syn", "main", seed).await.unwrap();
        for i in 0..count {
            let msg = if i % 2 == 0 {
                NewMessage::user(format!("question {i}"))
            } else {
                NewMessage::assistant(format!("answer {i}"))
            };
            store.append_message(&session.id, msg).await.unwrap();
        }
        (store, session.id)
    }

    fn stored(role: StoredRole, tokens: u64) -> StoredMessage {
        StoredMessage {
            id: 0,
            session_id: "s".into(),
            seq: 0,
            role,
            content: String::new(),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            token_estimate: tokens,
            is_distilled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_split_point_respects_both_limits() {
        let msgs: Vec<_> = (0..10).map(|_| stored(StoredRole::User, 100)).collect();
        assert_eq!(split_point(&msgs, 4, 10_000), 6);
        assert_eq!(split_point(&msgs, 4, 250), 8);
        assert_eq!(split_point(&msgs, 0, 10_000), 10);
    }

    #[test]
    fn test_split_point_skips_leading_tool_results() {
        let msgs = vec![
            stored(StoredRole::User, 10),
            stored(StoredRole::Assistant, 10),
            stored(StoredRole::ToolResult, 10),
            stored(StoredRole::ToolResult, 10),
            stored(StoredRole::Assistant, 10),
        ];
        assert_eq!(split_point(&msgs, 3, 1_000), 4);
    }

    #[test]
    fn test_chunking_splits_under_ceiling() {
        let mut msgs = Vec::new();
        for _ in 0..6 {
            let mut m = stored(StoredRole::User, 0);
            m.content = "x".repeat(400);
            msgs.push(m);
        }
        let chunks = chunk_transcript(&msgs, 250);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.starts_with("User: ")));
        assert_eq!(chunk_transcript(&msgs, 1_000_000).len(), 1);
    }

    #[tokio::test]
    async fn test_distill_replaces_older_messages() {
        let (store, session_id) = seeded(10).await;
        let backend = Arc::new(backend());
        let pipeline = DistillationPipeline::new(store.clone(), backend.clone(), config());

        let record = pipeline.distill(&agent(), &session_id, DistillTrigger::Manual).await.unwrap();
        assert_eq!(record.messages_before, 10);
        assert_eq!(record.messages_after, 5);
        assert_eq!(record.facts_extracted, 1);
        assert_eq!(backend.calls(), 2);

        let remaining = store.messages(&session_id, false).await.unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(remaining[0].content.starts_with(SUMMARY_MARKER));
        assert!(remaining[0].content.contains("- User lives in Oslo"));
        assert_eq!(remaining[1].content, "question 6");

        let thread = store.thread_summary("signal:+1555").await.unwrap();
        assert_eq!(thread.as_deref(), Some("The user planned a trip and chose SQLite."));
        assert_eq!(store.distillations(&session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_has_nothing_to_distill() {
        let (store, session_id) = seeded(10).await;
        let pipeline = DistillationPipeline::new(store.clone(), Arc::new(backend()), config());
        pipeline.distill(&agent(), &session_id, DistillTrigger::Manual).await.unwrap();
        let err = pipeline
            .distill(&agent(), &session_id, DistillTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, AgoraError::NothingToDistill { .. }));
        assert_eq!(store.distillations(&session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let (store, session_id) = seeded(10).await;
        let slow = backend().with_delay(Duration::from_millis(50));
        let pipeline = DistillationPipeline::new(store, Arc::new(slow), config());
        let a = agent();
        let (first, second) = tokio::join!(
            pipeline.distill(&a, &session_id, DistillTrigger::Auto),
            pipeline.distill(&a, &session_id, DistillTrigger::Preflight),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(AgoraError::DistillationInProgress(_))));
        assert!(!pipeline.is_running(&session_id));
    }

    #[tokio::test]
    async fn test_malformed_extraction_still_summarizes() {
        let (store, session_id) = seeded(10).await;
        let backend = TestBackend::new(|req| {
            if system_text(req).starts_with("You extract") {
                Ok(text_response("sorry, no JSON today"))
            } else {
                Ok(text_response("Short summary."))
            }
        });
        let pipeline = DistillationPipeline::new(store.clone(), Arc::new(backend), config());
        let record = pipeline.distill(&agent(), &session_id, DistillTrigger::Manual).await.unwrap();
        assert_eq!(record.facts_extracted, 0);
        let first = &store.messages(&session_id, false).await.unwrap()[0];
        assert_eq!(first.content, format!("{}\nShort summary.", SUMMARY_MARKER));
    }

    #[tokio::test]
    async fn test_model_failure_leaves_history_untouched() {
        let (store, session_id) = seeded(10).await;
        let backend = TestBackend::new(|_| Err(anyhow::anyhow!("overloaded")));
        let pipeline = DistillationPipeline::new(store.clone(), Arc::new(backend), config());
        let err = pipeline
            .distill(&agent(), &session_id, DistillTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, AgoraError::Model(_)));
        assert_eq!(store.messages(&session_id, false).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_workspace_log_appends() {
        let (store, session_id) = seeded(10).await;
        let dir = std::env::temp_dir().join(format!("agora-distill-{}", uuid::Uuid::new_v4()));
        let mut a = agent();
        a.workspace = Some(dir.clone());
        let cfg = DistillationConfig {
            workspace_log: true,
            ..Default::default()
        };
        let pipeline = DistillationPipeline::new(store, Arc::new(backend()), cfg);
        pipeline.distill(&a, &session_id, DistillTrigger::Manual).await.unwrap();
        let log = std::fs::read_to_string(dir.join(DISTILLATION_LOG)).unwrap();
        assert!(log.contains("10 messages -> 5"));
        assert!(log.contains("chose SQLite"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
