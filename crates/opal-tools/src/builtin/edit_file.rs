// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCall, ToolContext, ToolResult};

/// Exact-match string replacement in a file.  `old_string` must occur exactly
/// once so the edit cannot land in the wrong place.
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace one exact occurrence of `old_string` with `new_string` in a file. \
         Fails when the match is absent or ambiguous."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_string": { "type": "string" },
                "new_string": { "type": "string" }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let args = &call.arguments;
        let (Some(path), Some(old), Some(new)) = (
            args.get("path").and_then(Value::as_str),
            args.get("old_string").and_then(Value::as_str),
            args.get("new_string").and_then(Value::as_str),
        ) else {
            return ToolResult::err(&call.call_id, "missing 'path', 'old_string' or 'new_string'");
        };
        if old.is_empty() {
            return ToolResult::err(&call.call_id, "'old_string' must not be empty");
        }
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

        let matches = text.matches(old).count();
        if matches == 0 {
            return ToolResult::err(&call.call_id, "old_string not found in file");
        }
        if matches > 1 {
            return ToolResult::err(
                &call.call_id,
                format!("old_string matches {matches} times; provide more context"),
            );
        }

        let updated = text.replacen(old, new, 1);
        match tokio::fs::write(&resolved, updated).await {
            Ok(()) => ToolResult::ok(&call.call_id, format!("edited {}", resolved.display())),
            Err(e) => ToolResult::err(
                &call.call_id,
                format!("cannot write {}: {e}", resolved.display()),
            ),
        }
    }
}
