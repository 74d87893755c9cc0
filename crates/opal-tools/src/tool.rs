// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub call_id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

/// The result of executing one tool call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    /// True when the tool failed; the message goes back to the model as data.
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Callback for tools that need free-text input from the user mid-execution.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    async fn ask(&self, prompt: &str, sensitive: bool) -> opal_model::Result<String>;
}

/// Execution environment handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: String,
    pub config: Arc<opal_config::Config>,
    pub question_handler: Option<Arc<dyn QuestionHandler>>,
}

impl ToolContext {
    pub fn new(working_dir: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            working_dir,
            session_id: session_id.into(),
            config: Arc::new(opal_config::Config::default()),
            question_handler: None,
        }
    }

    /// Resolve a tool-supplied path against the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.working_dir.join(p)
        }
    }
}

/// Trait every built-in and externally-registered tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Whether the runner must obtain user confirmation before executing.
    fn requires_confirmation(&self) -> bool {
        false
    }
    /// Execute the call.  Failures are wrapped in [`ToolResult::err`], never
    /// raised: tool errors are data for the model.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_path_joins_working_dir() {
        let ctx = ToolContext::new(PathBuf::from("/work"), "s");
        assert_eq!(ctx.resolve("a/b.txt"), PathBuf::from("/work/a/b.txt"));
    }

    #[test]
    fn resolve_absolute_path_is_kept() {
        let ctx = ToolContext::new(PathBuf::from("/work"), "s");
        assert_eq!(ctx.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn tool_result_constructors_set_flag() {
        assert!(!ToolResult::ok("c", "fine").is_error);
        assert!(ToolResult::err("c", "bad").is_error);
    }
}
