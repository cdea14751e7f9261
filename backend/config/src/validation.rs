//! Config validation: deep schema checks with user-friendly error messages.

use std::collections::HashSet;

use crate::schema::RuntimeConfig;
use thiserror::Error;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &RuntimeConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_agents(config, &mut report);
    validate_bindings(config, &mut report);
    validate_context(config, &mut report);
    validate_tool_loop(config, &mut report);
    validate_distillation(config, &mut report);
    validate_cross_agent(config, &mut report);
    report
}

fn validate_agents(config: &RuntimeConfig, report: &mut ValidationReport) {
    if config.agents.is_empty() {
        report.warn("agents", "No agents configured; every message will be rejected");
    }
    let mut seen = HashSet::new();
    for (i, agent) in config.agents.iter().enumerate() {
        let path = format!("agents[{i}]");
        if agent.id.trim().is_empty() {
            report.error(format!("{path}.id"), "Agent id cannot be empty");
        } else if !seen.insert(agent.id.as_str()) {
            report.error(format!("{path}.id"), format!("Duplicate agent id '{}'", agent.id));
        }
        if agent.model.trim().is_empty() {
            report.error(format!("{path}.model"), "Model cannot be empty");
        }
    }
    if let Some(default) = &config.default_agent {
        if config.agent(default).is_none() {
            report.error("defaultAgent", format!("Unknown agent '{default}'"));
        }
    }
}

fn validate_bindings(config: &RuntimeConfig, report: &mut ValidationReport) {
    for (i, binding) in config.bindings.iter().enumerate() {
        if config.agent(&binding.agent).is_none() {
            report.error(
                format!("bindings[{i}].agent"),
                format!("Binding targets unknown agent '{}'", binding.agent),
            );
        }
        if binding.channel.trim().is_empty() {
            report.error(format!("bindings[{i}].channel"), "Channel cannot be empty");
        }
    }
}

fn validate_context(config: &RuntimeConfig, report: &mut ValidationReport) {
    let ctx = &config.context;
    if ctx.context_window == 0 {
        report.error("context.contextWindow", "contextWindow must be > 0");
    }
    if u64::from(ctx.max_output_tokens) >= ctx.context_window {
        report.error("context.maxOutputTokens", "maxOutputTokens must be smaller than contextWindow");
    }
    if !(ctx.overflow_ratio > 0.0 && ctx.overflow_ratio <= 1.0) {
        report.error("context.overflowRatio", "overflowRatio must be in (0, 1]");
    }
}

fn validate_tool_loop(config: &RuntimeConfig, report: &mut ValidationReport) {
    let tl = &config.tool_loop;
    if tl.max_rounds == 0 {
        report.error("toolLoop.maxRounds", "maxRounds must be >= 1");
    }
    if tl.loop_warn_threshold == 0 || tl.loop_warn_threshold >= tl.loop_halt_threshold {
        report.error(
            "toolLoop.loopWarnThreshold",
            "loopWarnThreshold must be >= 1 and below loopHaltThreshold",
        );
    }
    if tl.loop_window < tl.loop_halt_threshold {
        report.warn(
            "toolLoop.loopWindow",
            "loopWindow is smaller than loopHaltThreshold; repeated calls can never halt",
        );
    }
}

fn validate_distillation(config: &RuntimeConfig, report: &mut ValidationReport) {
    let d = &config.distillation;
    if !(d.auto_threshold > 0.0 && d.auto_threshold <= 1.0) {
        report.error("distillation.autoThreshold", "autoThreshold must be in (0, 1]");
    }
    if d.min_messages == 0 {
        report.error("distillation.minMessages", "minMessages must be >= 1");
    }
    if d.auto_threshold >= config.context.overflow_ratio {
        report.warn(
            "distillation.autoThreshold",
            "autoThreshold at or above overflowRatio; background distillation will never run first",
        );
    }
}

fn validate_cross_agent(config: &RuntimeConfig, report: &mut ValidationReport) {
    let ca = &config.cross_agent;
    if ca.max_depth == 0 {
        report.error("crossAgent.maxDepth", "maxDepth must be >= 1");
    }
    if ca.max_dispatch_tasks == 0 {
        report.error("crossAgent.maxDispatchTasks", "maxDispatchTasks must be >= 1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NousConfig, RouteBindingConfig};

    fn agent(id: &str) -> NousConfig {
        NousConfig {
            id: id.into(),
            model: "m".into(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_config_only_warns() {
        let report = validate(&RuntimeConfig::default());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn duplicate_agent_is_error() {
        let cfg = RuntimeConfig {
            agents: vec![agent("syn"), agent("syn")],
            ..Default::default()
        };
        let report = validate(&cfg);
        assert!(!report.is_valid());
        assert!(report.errors[0].message.contains("Duplicate"));
    }

    #[test]
    fn binding_to_unknown_agent_is_error() {
        let cfg = RuntimeConfig {
            agents: vec![agent("syn")],
            bindings: vec![RouteBindingConfig {
                channel: "signal".into(),
                peer: None,
                agent: "ghost".into(),
            }],
            ..Default::default()
        };
        let report = validate(&cfg);
        assert!(report.errors.iter().any(|e| e.path == "bindings[0].agent"));
    }

    #[test]
    fn warn_must_be_below_halt() {
        let mut cfg = RuntimeConfig::default();
        cfg.tool_loop.loop_warn_threshold = 5;
        let report = validate(&cfg);
        assert!(report.errors.iter().any(|e| e.path == "toolLoop.loopWarnThreshold"));
    }
}
