// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCall, ToolContext, ToolResult};

/// Writes a file, creating parent directories as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write `content` to a file, overwriting it. Parent directories are created."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(path) = call.arguments.get("path").and_then(Value::as_str) else {
            return ToolResult::err(&call.call_id, "missing 'path'");
        };
        let Some(content) = call.arguments.get("content").and_then(Value::as_str) else {
            return ToolResult::err(&call.call_id, "missing 'content'");
        };
        let resolved = ctx.resolve(path);

        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::err(&call.call_id, format!("mkdir failed: {e}"));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => ToolResult::ok(
                &call.call_id,
                format!("wrote {} bytes to {}", content.len(), resolved.display()),
            ),
            Err(e) => ToolResult::err(
                &call.call_id,
                format!("cannot write {}: {e}", resolved.display()),
            ),
        }
    }
}
