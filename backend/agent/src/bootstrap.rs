//! Cached identity block for the system prompt.
//!
//! Static files (persona, user profile, agent roster) change rarely;
//! semi-static ones (tool notes, curated memory) change between sessions.
//! Both are cached per agent with a TTL so a busy agent does not re-read
//! its workspace every turn.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agora_config::NousConfig;
use agora_core::estimate_tokens;
use moka::sync::Cache;
use tracing::debug;

pub const STATIC_FILES: &[&str] = &["SOUL.md", "USER.md", "AGENTS.md"];
pub const SEMI_STATIC_FILES: &[&str] = &["TOOLS.md", "MEMORY.md"];

#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap {
    pub static_text: String,
    pub semi_static_text: String,
}

impl Bootstrap {
    pub fn tokens(&self) -> u64 {
        estimate_tokens(&self.static_text) + estimate_tokens(&self.semi_static_text)
    }
}

pub struct BootstrapCache {
    cache: Cache<String, Arc<Bootstrap>>,
}

impl BootstrapCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).max_capacity(256).build(),
        }
    }

    pub async fn get(&self, agent: &NousConfig) -> Arc<Bootstrap> {
        if let Some(hit) = self.cache.get(&agent.id) {
            return hit;
        }
        let loaded = Arc::new(load(agent).await);
        self.cache.insert(agent.id.clone(), loaded.clone());
        loaded
    }

    pub fn invalidate(&self, agent_id: &str) {
        self.cache.invalidate(agent_id);
    }
}

async fn load(agent: &NousConfig) -> Bootstrap {
    let identity = agent.identity.clone().unwrap_or_else(|| {
        format!(
            "You are {}, one of several cooperating agents. Be direct and accurate, \
             use tools when they help, and say so when you are unsure.",
            agent.display_name()
        )
    });

    let mut static_text = identity;
    let mut semi_static_text = String::new();
    if let Some(workspace) = &agent.workspace {
        append_files(&mut static_text, workspace, STATIC_FILES).await;
        append_files(&mut semi_static_text, workspace, SEMI_STATIC_FILES).await;
    }
    debug!(agent_id = %agent.id, "[Bootstrap] Loaded identity block");
    Bootstrap {
        static_text,
        semi_static_text,
    }
}

async fn append_files(out: &mut String, workspace: &Path, files: &[&str]) {
    for name in files {
        let Ok(content) = tokio::fs::read_to_string(workspace.join(name)).await else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("# {}\n{}", name, content));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn agent(workspace: Option<PathBuf>) -> NousConfig {
        NousConfig {
            id: "syn".into(),
            name: Some("Syn".into()),
            model: "m".into(),
            workspace,
            identity: None,
            tools: Default::default(),
            max_output_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_reads_workspace_files_and_caches() {
        let dir = std::env::temp_dir().join(format!("agora-boot-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SOUL.md"), "Calm and precise.").unwrap();
        std::fs::write(dir.join("MEMORY.md"), "User is in Oslo.").unwrap();

        let cache = BootstrapCache::new(Duration::from_secs(60));
        let a = agent(Some(dir.clone()));
        let boot = cache.get(&a).await;
        assert!(boot.static_text.starts_with("You are Syn"));
        assert!(boot.static_text.contains("# SOUL.md\nCalm and precise."));
        assert_eq!(boot.semi_static_text, "# MEMORY.md\nUser is in Oslo.");

        std::fs::write(dir.join("SOUL.md"), "Changed.").unwrap();
        assert_eq!(cache.get(&a).await, boot);
        cache.invalidate("syn");
        assert!(cache.get(&a).await.static_text.contains("Changed."));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_workspace_uses_identity_only() {
        let cache = BootstrapCache::new(Duration::from_secs(60));
        let mut a = agent(None);
        a.identity = Some("You are a test double.".into());
        let boot = cache.get(&a).await;
        assert_eq!(boot.static_text, "You are a test double.");
        assert!(boot.semi_static_text.is_empty());
    }
}
