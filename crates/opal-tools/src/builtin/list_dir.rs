// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCall, ToolContext, ToolResult};

/// Lists a directory, one entry per line, directories suffixed with `/`.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory entries. Defaults to the working directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: .)" }
            }
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let path = call
            .arguments
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".");
        let resolved = ctx.resolve(path);

        let mut rd = match tokio::fs::read_dir(&resolved).await {
            Ok(rd) => rd,
            Err(e) => {
                return ToolResult::err(
                    &call.call_id,
                    format!("cannot list {}: {e}", resolved.display()),
                )
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        ToolResult::ok(&call.call_id, entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_sorted_with_dir_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf(), "s");
        let call = ToolCall {
            call_id: "c".into(),
            name: "list_dir".into(),
            arguments: json!({}),
        };
        let r = ListDirTool.execute(&call, &ctx).await;
        assert_eq!(r.content, "a/\nb.txt");
    }
}
