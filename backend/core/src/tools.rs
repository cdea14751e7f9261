use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::traits::{Reversibility, Tool, ToolContext, ToolDefinition};

/// Per-agent allow/deny list. Deny wins; an empty allow list allows everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFilter {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolFilter {
    pub fn permits(&self, name: &str) -> bool {
        if self.deny.iter().any(|d| d == name) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| a == name)
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas of the tools `filter` permits, sorted by name so the
    /// cacheable prompt prefix stays stable.
    pub fn definitions(&self, filter: &ToolFilter) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| filter.permits(t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Unknown tools are treated as irreversible.
    pub fn reversibility(&self, name: &str) -> Reversibility {
        self.tools
            .get(name)
            .map(|t| t.reversibility())
            .unwrap_or(Reversibility::Irreversible)
    }

    pub async fn execute(&self, name: &str, input: serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow!("unknown tool: {}", name))?;
        tool.execute(input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Fixed(&'static str, Reversibility);

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "fixed"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn reversibility(&self) -> Reversibility {
            self.1
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> Result<String> {
            Ok(format!("{} ran", self.0))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "a".into(),
            session_id: "s".into(),
            session_key: "main".into(),
            turn_id: "t".into(),
            depth: 0,
            workspace: std::env::temp_dir(),
            cancel: CancellationToken::new(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Fixed("read", Reversibility::ReadOnly)));
        reg.register(Arc::new(Fixed("exec", Reversibility::Irreversible)));
        reg.register(Arc::new(Fixed("write", Reversibility::Reversible)));
        reg
    }

    #[test]
    fn test_definitions_filtered_and_sorted() {
        let reg = registry();
        let all = reg.definitions(&ToolFilter::default());
        let names: Vec<_> = all.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["exec", "read", "write"]);

        let filter = ToolFilter {
            allow: vec!["read".into(), "exec".into()],
            deny: vec!["exec".into()],
        };
        let some = reg.definitions(&filter);
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].name, "read");
    }

    #[test]
    fn test_unknown_tool_is_irreversible() {
        let reg = registry();
        assert_eq!(reg.reversibility("read"), Reversibility::ReadOnly);
        assert_eq!(reg.reversibility("nope"), Reversibility::Irreversible);
    }

    #[tokio::test]
    async fn test_execute() {
        let reg = registry();
        assert_eq!(reg.execute("read", serde_json::json!({}), &ctx()).await.unwrap(), "read ran");
        assert!(reg.execute("missing", serde_json::json!({}), &ctx()).await.is_err());
    }
}
