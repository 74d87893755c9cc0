// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Tool, ToolCall, ToolContext, ToolResult};

/// Asks the user a free-text question through the session's question
/// handler (`client/input` over RPC, the terminal in one-shot mode).
pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their text answer. Use when a \
         decision genuinely requires user input."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string" },
                "sensitive": {
                    "type": "boolean",
                    "description": "Hide the user's input while typing (passwords, tokens)"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(question) = call.arguments.get("question").and_then(Value::as_str) else {
            return ToolResult::err(&call.call_id, "missing 'question'");
        };
        let sensitive = call
            .arguments
            .get("sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let Some(handler) = &ctx.question_handler else {
            return ToolResult::err(
                &call.call_id,
                "no question handler is attached to this session",
            );
        };
        match handler.ask(question, sensitive).await {
            Ok(answer) => ToolResult::ok(&call.call_id, answer),
            Err(e) => ToolResult::err(&call.call_id, format!("question failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::QuestionHandler;

    struct CannedHandler;

    #[async_trait]
    impl QuestionHandler for CannedHandler {
        async fn ask(&self, prompt: &str, _sensitive: bool) -> opal_model::Result<String> {
            Ok(format!("answer to: {prompt}"))
        }
    }

    fn call() -> ToolCall {
        ToolCall {
            call_id: "c".into(),
            name: "ask_user".into(),
            arguments: json!({"question": "which port?"}),
        }
    }

    #[tokio::test]
    async fn forwards_question_to_handler() {
        let mut ctx = ToolContext::new(PathBuf::from("."), "s");
        ctx.question_handler = Some(Arc::new(CannedHandler));
        let r = AskUserTool.execute(&call(), &ctx).await;
        assert!(!r.is_error);
        assert_eq!(r.content, "answer to: which port?");
    }

    #[tokio::test]
    async fn missing_handler_is_error() {
        let ctx = ToolContext::new(PathBuf::from("."), "s");
        let r = AskUserTool.execute(&call(), &ctx).await;
        assert!(r.is_error);
    }
}
