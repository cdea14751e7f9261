//! System prompt assembly and history budgeting.
//!
//! The prompt is split into cacheable blocks (identity, workspace files)
//! and one dynamic block rebuilt every turn. Before anything is assembled
//! the pre-flight guard distills a session that is about to overflow.

use std::sync::Arc;
use std::time::Duration;

use agora_config::{ContextConfig, NousConfig};
use agora_core::tokens::estimate_tool_definitions;
use agora_core::{
    AgoraError, HealthMonitor, LongTermMemory, MEMORY_DEPENDENCY, Session, SessionStore,
    SystemBlock, ToolDefinition, ToolFilter, ToolRegistry, estimate_tokens,
};
use agora_tools::BROADCAST_PREFIX;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapCache;
use crate::distill::{DistillTrigger, DistillationPipeline};

/// Everything the history builder and the tool loop need from assembly.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
    /// Tokens left for the conversation array.
    pub history_budget: u64,
    pub bootstrap_tokens: u64,
    pub tool_tokens: u64,
    pub recall_tokens: u64,
    /// Session as seen after the pre-flight guard.
    pub session: Session,
    pub preflight_distilled: bool,
}

pub struct ContextAssembler {
    config: ContextConfig,
    store: Arc<dyn SessionStore>,
    bootstrap: BootstrapCache,
    health: Arc<dyn HealthMonitor>,
    memory: Option<Arc<dyn LongTermMemory>>,
    distiller: Arc<DistillationPipeline>,
}

impl ContextAssembler {
    pub fn new(
        config: ContextConfig,
        store: Arc<dyn SessionStore>,
        health: Arc<dyn HealthMonitor>,
        memory: Option<Arc<dyn LongTermMemory>>,
        distiller: Arc<DistillationPipeline>,
    ) -> Self {
        let bootstrap = BootstrapCache::new(Duration::from_secs(config.bootstrap_cache_ttl_secs));
        Self {
            config,
            store,
            bootstrap,
            health,
            memory,
            distiller,
        }
    }

    pub fn bootstrap(&self) -> &BootstrapCache {
        &self.bootstrap
    }

    /// True when the last model call came close enough to the window that
    /// the next one could overflow.
    pub fn needs_preflight(&self, session: &Session) -> bool {
        let threshold = self.config.overflow_ratio * self.config.context_window as f64;
        session.last_input_tokens as f64 >= threshold
            && session.message_count >= self.config.overflow_min_messages
    }

    pub async fn assemble(
        &self,
        agent: &NousConfig,
        session: Session,
        query: &str,
        registry: &ToolRegistry,
    ) -> Result<AssembledContext, AgoraError> {
        let (session, preflight_distilled) = self.preflight(agent, session).await?;

        let boot = self.bootstrap.get(agent).await;
        let mut system = vec![SystemBlock::cached(boot.static_text.clone())];
        if !boot.semi_static_text.is_empty() {
            system.push(SystemBlock::cached(boot.semi_static_text.clone()));
        }

        let mut sections = Vec::new();
        if let Some(notice) = self.degraded_notice() {
            sections.push(notice);
        }
        if let Some(thread) = self.thread_memory(&session).await {
            sections.push(thread);
        }
        let recall = self.recall(agent, query).await;
        let recall_tokens = recall.as_deref().map(estimate_tokens).unwrap_or(0);
        if let Some(recall) = recall {
            sections.push(recall);
        }
        if let Some(broadcasts) = self.broadcasts(agent).await {
            sections.push(broadcasts);
        }
        if let Some(state) = session.working_state.as_ref().filter(|s| !s.is_empty()) {
            sections.push(state.render());
        }
        if let Some(notes) = self.notes(&session).await {
            sections.push(notes);
        }
        if let Some(metrics) = self.metrics(&session) {
            sections.push(metrics);
        }
        let dynamic = sections.join("\n\n");
        let dynamic_tokens = estimate_tokens(&dynamic);
        if !dynamic.is_empty() {
            system.push(SystemBlock::dynamic(dynamic));
        }

        let filter = ToolFilter {
            allow: agent.tools.allow.clone(),
            deny: agent.tools.deny.clone(),
        };
        let tools = registry.definitions(&filter);
        let tool_tokens = estimate_tool_definitions(&tools);
        let bootstrap_tokens = boot.tokens() + dynamic_tokens.saturating_sub(recall_tokens);
        let max_output = agent.max_output_tokens.unwrap_or(self.config.max_output_tokens) as u64;

        let history_budget = self
            .config
            .context_window
            .saturating_sub(bootstrap_tokens)
            .saturating_sub(tool_tokens)
            .saturating_sub(max_output)
            .saturating_sub(recall_tokens);

        debug!(
            agent_id = %agent.id,
            session_id = %session.id,
            bootstrap_tokens,
            tool_tokens,
            recall_tokens,
            history_budget,
            "[Context] Assembled"
        );
        Ok(AssembledContext {
            system,
            tools,
            history_budget,
            bootstrap_tokens,
            tool_tokens,
            recall_tokens,
            session,
            preflight_distilled,
        })
    }

    async fn preflight(
        &self,
        agent: &NousConfig,
        session: Session,
    ) -> Result<(Session, bool), AgoraError> {
        if !self.needs_preflight(&session) {
            return Ok((session, false));
        }
        info!(
            session_id = %session.id,
            last_input_tokens = session.last_input_tokens,
            messages = session.message_count,
            "[Context] Pre-flight overflow guard triggered"
        );
        match self
            .distiller
            .distill(agent, &session.id, DistillTrigger::Preflight)
            .await
        {
            Ok(_) => {
                let refreshed = self.store.get_session(&session.id).await?.unwrap_or(session);
                Ok((refreshed, true))
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "[Context] Pre-flight distillation skipped");
                Ok((session, false))
            }
        }
    }

    fn degraded_notice(&self) -> Option<String> {
        let down = self.health.unhealthy();
        if down.is_empty() {
            return None;
        }
        let mut out = String::from(
            "## Degraded Services\nThese dependencies are currently unavailable; avoid relying on them:\n",
        );
        for dep in down {
            match dep.detail {
                Some(detail) => out.push_str(&format!("- {}: {}\n", dep.name, detail)),
                None => out.push_str(&format!("- {}\n", dep.name)),
            }
        }
        Some(out.trim_end().to_string())
    }

    async fn thread_memory(&self, session: &Session) -> Option<String> {
        let thread_id = session.thread_id.as_deref()?;
        match self.store.thread_summary(thread_id).await {
            Ok(Some(summary)) if !summary.trim().is_empty() => {
                Some(format!("## Thread Memory\n{}", summary.trim()))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(thread_id, error = %e, "[Context] Thread memory unavailable");
                None
            }
        }
    }

    async fn recall(&self, agent: &NousConfig, query: &str) -> Option<String> {
        let memory = self.memory.as_ref()?;
        if self.config.recall_limit == 0 || query.trim().is_empty() {
            return None;
        }
        if !self.health.is_healthy(MEMORY_DEPENDENCY) {
            debug!(agent_id = %agent.id, "[Context] Memory unhealthy, recall skipped");
            return None;
        }
        let timeout = Duration::from_millis(self.config.recall_timeout_ms);
        let found = match tokio::time::timeout(
            timeout,
            memory.recall(&agent.id, query, self.config.recall_limit),
        )
        .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(agent_id = %agent.id, error = %e, "[Context] Recall failed");
                return None;
            }
            Err(_) => {
                warn!(agent_id = %agent.id, timeout_ms = self.config.recall_timeout_ms, "[Context] Recall timed out");
                return None;
            }
        };
        if found.is_empty() {
            return None;
        }
        let mut out = String::from("## Recalled Memories\n");
        for m in found {
            out.push_str(&format!("- {} ({:.2})\n", m.text, m.score));
        }
        Some(out.trim_end().to_string())
    }

    async fn broadcasts(&self, agent: &NousConfig) -> Option<String> {
        let entries = match self.store.blackboard_list(BROADCAST_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "[Context] Blackboard unavailable");
                return None;
            }
        };
        let lines: Vec<String> = entries
            .into_iter()
            .filter(|e| e.author_agent_id != agent.id)
            .map(|e| format!("- [{}] {}", e.author_agent_id, e.value))
            .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!("## Broadcasts\n{}", lines.join("\n")))
    }

    /// Newest notes first until the budget runs out, shown oldest first.
    async fn notes(&self, session: &Session) -> Option<String> {
        let notes = match self.store.notes(&session.id).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "[Context] Notes unavailable");
                return None;
            }
        };
        let mut used = 0u64;
        let mut kept = Vec::new();
        for note in notes.iter().rev() {
            let line = format!("- {}", note.content);
            let cost = estimate_tokens(&line);
            if used + cost > self.config.notes_token_budget {
                break;
            }
            used += cost;
            kept.push(line);
        }
        if kept.is_empty() {
            return None;
        }
        if kept.len() < notes.len() {
            debug!(session_id = %session.id, dropped = notes.len() - kept.len(), "[Context] Oldest notes truncated");
        }
        kept.reverse();
        Some(format!("## Notes\n{}", kept.join("\n")))
    }

    fn metrics(&self, session: &Session) -> Option<String> {
        let every = self.config.metrics_every_turns;
        if every == 0 || session.turn_count == 0 || session.turn_count % every != 0 {
            return None;
        }
        let usage = if self.config.context_window == 0 {
            0.0
        } else {
            session.last_input_tokens as f64 * 100.0 / self.config.context_window as f64
        };
        Some(format!(
            "## Session Metrics\nTurns: {}\nMessages: {}\nEstimated history tokens: {}\nLast prompt: {} tokens ({:.0}% of window)\nDistillations: {}",
            session.turn_count,
            session.message_count,
            session.token_count_estimate,
            session.last_input_tokens,
            usage,
            session.distillation_count
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBackend, text_response};
    use agora_config::DistillationConfig;
    use agora_core::{HealthBoard, NewMessage, RecalledMemory, SessionSeed};
    use agora_store::SqliteStore;
    use async_trait::async_trait;

    struct StaticMemory(Duration);

    #[async_trait]
    impl LongTermMemory for StaticMemory {
        async fn recall(&self, _agent: &str, _query: &str, _limit: usize) -> anyhow::Result<Vec<RecalledMemory>> {
            tokio::time::sleep(self.0).await;
            Ok(vec![RecalledMemory {
                text: "Prefers window seats".into(),
                score: 0.91,
            }])
        }

        async fn remember(&self, _agent: &str, _session: &str, _facts: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn agent() -> NousConfig {
        NousConfig {
            id: "syn".into(),
            model: "test-model".into(),
            identity: Some("You are Syn.".into()),
            ..Default::default()
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        health: Arc<HealthBoard>,
        assembler: ContextAssembler,
    }

    fn fixture(config: ContextConfig, memory: Option<Arc<dyn LongTermMemory>>) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let health = Arc::new(HealthBoard::new());
        let distiller = Arc::new(DistillationPipeline::new(
            store.clone(),
            Arc::new(TestBackend::new(|_| Ok(text_response("summary")))),
            DistillationConfig {
                workspace_log: false,
                ..Default::default()
            },
        ));
        let assembler = ContextAssembler::new(config, store.clone(), health.clone(), memory, distiller);
        Fixture {
            store,
            health,
            assembler,
        }
    }

    fn dynamic_text(ctx: &AssembledContext) -> String {
        ctx.system
            .iter()
            .filter(|b| !b.cache)
            .map(|b| b.text.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_dynamic_sections_in_order() {
        let memory: Arc<dyn LongTermMemory> = Arc::new(StaticMemory(Duration::ZERO));
        let f = fixture(ContextConfig::default(), Some(memory));
        let seed = SessionSeed {
            thread_id: Some("signal:+1".into()),
            ..Default::default()
        };
        let session = f.store.open_session("syn", "main", seed).await.unwrap();
        f.store.set_thread_summary("signal:+1", "syn", "Long-time user.").await.unwrap();
        f.store.add_note(&session.id, "syn", "check flights").await.unwrap();
        f.store
            .blackboard_put("broadcast:arbor:1", "deploy at noon", "arbor", Some(60))
            .await
            .unwrap();
        f.store
            .blackboard_put("broadcast:syn:1", "my own broadcast", "syn", Some(60))
            .await
            .unwrap();
        f.health.set("search", false, Some("rate limited".into()));

        let ctx = f
            .assembler
            .assemble(&agent(), session, "where to sit?", &ToolRegistry::new())
            .await
            .unwrap();
        let text = dynamic_text(&ctx);
        let order = [
            "## Degraded Services",
            "## Thread Memory",
            "## Recalled Memories",
            "## Broadcasts",
            "## Notes",
        ];
        let positions: Vec<usize> = order.iter().map(|h| text.find(h).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("- [arbor] deploy at noon"));
        assert!(!text.contains("my own broadcast"));
        assert!(text.contains("Prefers window seats (0.91)"));
        assert!(ctx.recall_tokens > 0);
        assert_eq!(ctx.system[0].text, "You are Syn.");
        assert!(ctx.system[0].cache);
    }

    #[tokio::test]
    async fn test_recall_skipped_when_memory_unhealthy() {
        let memory: Arc<dyn LongTermMemory> = Arc::new(StaticMemory(Duration::ZERO));
        let f = fixture(ContextConfig::default(), Some(memory));
        f.health.set(MEMORY_DEPENDENCY, false, None);
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        let ctx = f
            .assembler
            .assemble(&agent(), session, "hello", &ToolRegistry::new())
            .await
            .unwrap();
        assert!(!dynamic_text(&ctx).contains("Recalled"));
        assert_eq!(ctx.recall_tokens, 0);
    }

    #[tokio::test]
    async fn test_recall_is_time_boxed() {
        let memory: Arc<dyn LongTermMemory> = Arc::new(StaticMemory(Duration::from_secs(5)));
        let config = ContextConfig {
            recall_timeout_ms: 20,
            ..Default::default()
        };
        let f = fixture(config, Some(memory));
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        let started = std::time::Instant::now();
        let ctx = f
            .assembler
            .assemble(&agent(), session, "hello", &ToolRegistry::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ctx.recall_tokens, 0);
    }

    #[tokio::test]
    async fn test_notes_drop_oldest_over_budget() {
        let config = ContextConfig {
            notes_token_budget: 12,
            ..Default::default()
        };
        let f = fixture(config, None);
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        for note in ["first note here", "second note here", "third note here"] {
            f.store.add_note(&session.id, "syn", note).await.unwrap();
        }
        let ctx = f
            .assembler
            .assemble(&agent(), session, "", &ToolRegistry::new())
            .await
            .unwrap();
        let text = dynamic_text(&ctx);
        assert!(!text.contains("first note"));
        assert!(text.find("second note").unwrap() < text.find("third note").unwrap());
    }

    #[tokio::test]
    async fn test_history_budget_floors_at_zero() {
        let config = ContextConfig {
            context_window: 100,
            ..Default::default()
        };
        let f = fixture(config, None);
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        let ctx = f
            .assembler
            .assemble(&agent(), session, "", &ToolRegistry::new())
            .await
            .unwrap();
        assert_eq!(ctx.history_budget, 0);
    }

    #[tokio::test]
    async fn test_history_budget_subtracts_output_reserve() {
        let f = fixture(ContextConfig::default(), None);
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        let ctx = f
            .assembler
            .assemble(&agent(), session, "", &ToolRegistry::new())
            .await
            .unwrap();
        let expected = 200_000 - ctx.bootstrap_tokens - 16_384;
        assert_eq!(ctx.history_budget, expected);
    }

    #[tokio::test]
    async fn test_preflight_distills_near_overflow() {
        let f = fixture(ContextConfig::default(), None);
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        for i in 0..10 {
            f.store
                .append_message(&session.id, NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        f.store.record_turn(&session.id, 182_000).await.unwrap();
        let session = f.store.get_session(&session.id).await.unwrap().unwrap();
        assert!(f.assembler.needs_preflight(&session));

        let ctx = f
            .assembler
            .assemble(&agent(), session, "next", &ToolRegistry::new())
            .await
            .unwrap();
        assert!(ctx.preflight_distilled);
        assert_eq!(ctx.session.message_count, 5);
        assert_eq!(ctx.session.distillation_count, 1);
    }

    #[tokio::test]
    async fn test_metrics_every_nth_turn() {
        let config = ContextConfig {
            metrics_every_turns: 2,
            ..Default::default()
        };
        let f = fixture(config, None);
        let session = f.store.open_session("syn", "main", SessionSeed::default()).await.unwrap();
        f.store.record_turn(&session.id, 1_000).await.unwrap();
        let once = f.store.get_session(&session.id).await.unwrap().unwrap();
        let ctx = f.assembler.assemble(&agent(), once, "", &ToolRegistry::new()).await.unwrap();
        assert!(!dynamic_text(&ctx).contains("Session Metrics"));

        f.store.record_turn(&session.id, 1_000).await.unwrap();
        let twice = f.store.get_session(&session.id).await.unwrap().unwrap();
        let ctx = f.assembler.assemble(&agent(), twice, "", &ToolRegistry::new()).await.unwrap();
        assert!(dynamic_text(&ctx).contains("Turns: 2"));
    }
}
