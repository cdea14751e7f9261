use agora_core::{Tool, ToolContext};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

/// Name checked by the approval policy's destructive-command patterns.
pub const EXEC_TOOL: &str = "exec";

const MAX_OUTPUT_CHARS: usize = 20_000;

pub struct ExecTool;

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        EXEC_TOOL
    }

    fn description(&self) -> &str {
        "Execute a shell command in the agent workspace. Use this to run scripts, inspect files, or interact with the system."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow!("Missing 'command' argument"))?;
        debug!(agent_id = %ctx.agent_id, command, "[Exec] Running");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            out = child => out?,
            _ = ctx.cancel.cancelled() => bail!("command cancelled"),
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
        let code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            bail!("exit code {}\nStdout:\n{}\nStderr:\n{}", code, stdout, stderr);
        }
        Ok(format!("Stdout:\n{}\nStderr:\n{}", stdout, stderr))
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_OUTPUT_CHARS {
        return s.to_string();
    }
    let head: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{}\n[... output truncated]", head)
}
