//! `agora-config` : Agora runtime configuration.
//!
//! Provides:
//! - Typed config schema (agents, routing, engine knobs)
//! - YAML loading
//! - `${ENV_VAR}` substitution
//! - Default value application
//! - Schema validation

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_config, parse_yaml};
pub use schema::{
    ApprovalConfig, ApprovalMode, ContextConfig, CrossAgentConfig, DistillationConfig,
    LoggingConfig, NousConfig, RouteBindingConfig, RuntimeConfig, StorageConfig, ToolLoopConfig,
    ToolPolicyConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Load, substitute env vars, apply defaults, and validate a config file.
///
/// This is the main entry point for loading a config at runtime.
pub async fn load_and_prepare(path: &Path) -> Result<RuntimeConfig> {
    let raw = io::load_raw(path).await?;
    let value = resolve_env_vars(&raw).context("Failed to resolve env vars in config")?;
    prepare(value)
}

/// Same pipeline over in-memory YAML with an explicit environment.
pub fn prepare_yaml(yaml: &str, env: &HashMap<String, String>) -> Result<RuntimeConfig> {
    let raw = parse_yaml(yaml)?;
    let value = resolve_env_vars_with(&raw, env).context("Failed to resolve env vars in config")?;
    prepare(value)
}

fn prepare(value: Value) -> Result<RuntimeConfig> {
    let config: RuntimeConfig =
        serde_json::from_value(value).context("Failed to deserialize config after processing")?;

    let config = apply_all_defaults(config);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if let Some(first) = report.errors.into_iter().next() {
        bail!(first);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
agents:
  - id: syn
    model: ${PRIMARY_MODEL}
    tools:
      deny: [exec]
  - id: arbor
    model: claude-haiku
bindings:
  - channel: signal
    peer: "+15550001"
    agent: arbor
approval:
  mode: supervised
crossAgent:
  maxDepth: 2
"#;

    #[test]
    fn prepares_full_pipeline() {
        let env: HashMap<String, String> =
            [("PRIMARY_MODEL".to_string(), "claude-opus".to_string())].into();
        let cfg = prepare_yaml(YAML, &env).unwrap();
        assert_eq!(cfg.agents[0].model, "claude-opus");
        assert_eq!(cfg.agents[0].tools.deny, vec!["exec".to_string()]);
        assert_eq!(cfg.default_agent.as_deref(), Some("syn"));
        assert_eq!(cfg.approval.mode, ApprovalMode::Supervised);
        assert_eq!(cfg.cross_agent.max_depth, 2);
        assert_eq!(cfg.cross_agent.ask_timeout_secs, 120);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let yaml = "agents:\n  - id: syn\n    model: m\ndefaultAgent: ghost\n";
        let err = prepare_yaml(yaml, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("defaultAgent"));
    }
}
