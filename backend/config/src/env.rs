//! `${VAR}` substitution in config string values.
//!
//! Names are uppercase `[A-Z_][A-Z0-9_]*`. `${VAR:-fallback}` uses the
//! fallback when the variable is unset or empty, and `$${VAR}` is a
//! literal `${VAR}`.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$?)\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap());

#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute against the process environment.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    resolve_env_vars_with(value, &std::env::vars().collect())
}

pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    let mut out = value.clone();
    let mut path = Vec::new();
    walk(&mut out, env, &mut path)?;
    Ok(out)
}

fn render_path(path: &[String]) -> String {
    let mut out = String::new();
    for segment in path {
        if !segment.starts_with('[') && !out.is_empty() {
            out.push('.');
        }
        out.push_str(segment);
    }
    out
}

fn walk(value: &mut Value, env: &HashMap<String, String>, path: &mut Vec<String>) -> Result<()> {
    match value {
        Value::String(s) if s.contains("${") => {
            *s = substitute(s, env, path)?;
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                path.push(format!("[{i}]"));
                walk(item, env, path)?;
                path.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                path.push(key.clone());
                walk(item, env, path)?;
                path.pop();
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute(s: &str, env: &HashMap<String, String>, path: &[String]) -> Result<String> {
    let mut missing: Option<MissingEnvVarError> = None;
    let replaced = ENV_REF.replace_all(s, |caps: &Captures| {
        let name = &caps[2];
        if !caps[1].is_empty() {
            return caps[0][1..].to_string();
        }
        match (env.get(name).filter(|v| !v.is_empty()), caps.get(3)) {
            (Some(v), _) => v.clone(),
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: name.to_string(),
                    config_path: render_path(path),
                });
                String::new()
            }
        }
    });
    match missing {
        Some(err) => Err(err.into()),
        None => Ok(replaced.into_owned()),
    }
}
