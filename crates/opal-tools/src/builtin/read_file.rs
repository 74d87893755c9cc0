// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCall, ToolContext, ToolResult};

/// Reads a file, optionally windowed by line offset and limit.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Optional 1-based `offset` and `limit` select a line window."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "offset": { "type": "integer", "description": "First line to read (1-based)" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(path) = call.arguments.get("path").and_then(Value::as_str) else {
            return ToolResult::err(&call.call_id, "missing 'path'");
        };
        let resolved = ctx.resolve(path);

        let text = match tokio::fs::read_to_string(&resolved).await {
            Ok(t) => t,
            Err(e) => {
                return ToolResult::err(
                    &call.call_id,
                    format!("cannot read {}: {e}", resolved.display()),
                )
            }
        };

        let offset = call
            .arguments
            .get("offset")
            .and_then(Value::as_u64)
            .map(|o| (o as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = call
            .arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(usize::MAX);

        let window: Vec<&str> = text.lines().skip(offset).take(limit).collect();
        ToolResult::ok(&call.call_id, window.join("\n"))
    }
}
