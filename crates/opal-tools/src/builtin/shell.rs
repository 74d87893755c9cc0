// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCall, ToolContext, ToolResult};

/// Runs a shell command in the session working directory.
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its combined \
         stdout/stderr output. Non-zero exit codes are reported as errors."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to run with `sh -c`"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(command) = call.arguments.get("command").and_then(Value::as_str) else {
            return ToolResult::err(&call.call_id, "missing 'command'");
        };

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .output()
            .await;

        match output {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                if out.status.success() {
                    ToolResult::ok(&call.call_id, text)
                } else {
                    let code = out.status.code().unwrap_or(-1);
                    ToolResult::err(
                        &call.call_id,
                        format!("exit code {code}\n{text}"),
                    )
                }
            }
            Err(e) => ToolResult::err(&call.call_id, format!("failed to spawn: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::new(PathBuf::from("."), "s")
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            call_id: "c".into(),
            name: "shell".into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn echo_returns_stdout() {
        let r = ShellTool.execute(&call(json!({"command": "echo hi"})), &ctx()).await;
        assert!(!r.is_error);
        assert_eq!(r.content.trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_with_code() {
        let r = ShellTool.execute(&call(json!({"command": "exit 3"})), &ctx()).await;
        assert!(r.is_error);
        assert!(r.content.contains("exit code 3"));
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let r = ShellTool.execute(&call(json!({})), &ctx()).await;
        assert!(r.is_error);
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf(), "s");
        let r = ShellTool.execute(&call(json!({"command": "ls"})), &ctx).await;
        assert!(r.content.contains("marker.txt"));
    }
}
