// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{Provider, ProviderStream, StreamOptions},
    retry::{classify_status, ErrorClass},
    Error, Message, Result, Role, StopReason, StreamEvent, ToolSchema, Usage,
};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            client: reqwest::Client::new(),
        }
    }

    fn thinking_budget(level: &str) -> Option<u32> {
        match level {
            "low" => Some(2_048),
            "medium" => Some(8_192),
            "high" => Some(16_384),
            _ => None,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        opts: &StreamOptions,
    ) -> Result<ProviderStream> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::ProviderPermanent("no anthropic api key configured".into()))?;

        // System text: explicit option first, then any system-role messages
        // on the path, joined in order.
        let mut system_parts: Vec<&str> = Vec::new();
        if let Some(s) = opts.system.as_deref() {
            system_parts.push(s);
        }
        for m in messages.iter().filter(|m| m.role == Role::System) {
            system_parts.push(m.text());
        }

        let mut body = json!({
            "model": self.model,
            "messages": self.convert_messages(messages),
            "max_tokens": opts.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if !tools.is_empty() {
            body["tools"] = self.convert_tools(tools);
        }
        if let Some(budget) = opts
            .thinking_level
            .as_deref()
            .and_then(Self::thinking_budget)
        {
            if self.supports_reasoning() {
                body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            }
        }

        debug!(model = %self.model, messages = messages.len(), "anthropic stream request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ProviderTransient(format!("anthropic request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let payload = format!("anthropic error {status}: {text}");
            return Err(match classify_status(status, &text) {
                ErrorClass::Transient => Error::ProviderTransient(payload),
                ErrorClass::Permanent => Error::ProviderPermanent(payload),
            });
        }

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let byte_stream = resp.bytes_stream();
        let events = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(Error::ProviderTransient(
                            format!("anthropic stream read: {e}"),
                        ))]));
                    }
                };
                buf.push_str(&text);
                let mut out: Vec<Result<StreamEvent>> = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        for ev in parse_event(data.trim()) {
                            out.push(Ok(ev));
                        }
                    }
                }
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(ProviderStream::new(events))
    }

    fn parse_stream_event(&self, data: &str) -> Vec<StreamEvent> {
        parse_event(data)
    }

    fn convert_messages(&self, messages: &[Message]) -> Value {
        let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
        for m in messages {
            match m.role {
                // System text is routed through the top-level `system` field.
                Role::System => {}
                Role::User => wire.push(json!({
                    "role": "user",
                    "content": [{ "type": "text", "text": m.text() }],
                })),
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if let Some(text) = m.content.as_deref() {
                        if !text.is_empty() {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    for tc in m.tool_call_specs() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.call_id,
                            "name": tc.name,
                            "input": normalize_input(&tc.arguments),
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({ "type": "text", "text": "" }));
                    }
                    wire.push(json!({ "role": "assistant", "content": blocks }));
                }
                Role::ToolCall => {
                    // A standalone tool_call node renders as an assistant
                    // message with a single tool_use block.
                    let (id, name, input) = match m.tool_call_specs().first() {
                        Some(tc) => (
                            tc.call_id.clone(),
                            tc.name.clone(),
                            normalize_input(&tc.arguments),
                        ),
                        None => (
                            m.call_id.clone().unwrap_or_default(),
                            String::new(),
                            json!({}),
                        ),
                    };
                    wire.push(json!({
                        "role": "assistant",
                        "content": [{ "type": "tool_use", "id": id, "name": name, "input": input }],
                    }));
                }
                Role::ToolResult => wire.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.call_id.clone().unwrap_or_default(),
                        "content": m.text(),
                        "is_error": m.is_error,
                    }],
                })),
            }
        }
        Value::Array(wire)
    }

    fn convert_tools(&self, tools: &[ToolSchema]) -> Value {
        Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect(),
        )
    }
}

/// Tool-use input must be an object; the API rejects `null` on replay.
fn normalize_input(v: &Value) -> Value {
    match v {
        Value::Object(_) => v.clone(),
        Value::Null => json!({}),
        other => json!({ "raw": other }),
    }
}

fn parse_event(data: &str) -> Vec<StreamEvent> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return vec![],
    };
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let usage = &v["message"]["usage"];
            vec![StreamEvent::Usage {
                usage: Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                    cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                    cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                },
            }]
        }
        "content_block_start" => {
            let index = v["index"].as_u64().map(|i| i as u32);
            let block = &v["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "text" => vec![StreamEvent::TextStart { info: None }],
                "thinking" => vec![StreamEvent::ThinkingStart { info: None }],
                "tool_use" => vec![StreamEvent::ToolCallStart {
                    call_id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    call_index: index,
                }],
                _ => vec![],
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().map(|i| i as u32);
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => vec![StreamEvent::TextDelta {
                    text: delta["text"].as_str().unwrap_or("").to_string(),
                }],
                "thinking_delta" => vec![StreamEvent::ThinkingDelta {
                    text: delta["thinking"].as_str().unwrap_or("").to_string(),
                }],
                "input_json_delta" => vec![StreamEvent::ToolCallDelta {
                    call_id: None,
                    call_index: index,
                    delta: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                _ => vec![],
            }
        }
        "message_delta" => {
            let stop = v["delta"]["stop_reason"].as_str();
            let usage = Usage {
                input_tokens: 0,
                output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
                ..Default::default()
            };
            match stop {
                Some("tool_use") => vec![StreamEvent::ResponseDone {
                    usage,
                    stop_reason: StopReason::ToolCalls,
                }],
                Some(_) => vec![StreamEvent::ResponseDone {
                    usage,
                    stop_reason: StopReason::Stop,
                }],
                None => vec![StreamEvent::Usage { usage }],
            }
        }
        "error" => vec![StreamEvent::Error {
            payload: v["error"].to_string(),
        }],
        // message_stop / ping / content_block_stop carry nothing we track.
        _ => vec![],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCallSpec;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("claude-sonnet-4-5".into(), Some("k".into()), None, None)
    }

    #[test]
    fn parse_text_delta() {
        let ev = parse_event(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#);
        assert_eq!(ev, vec![StreamEvent::TextDelta { text: "hi".into() }]);
    }

    #[test]
    fn parse_tool_use_start() {
        let ev = parse_event(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"shell"}}"#);
        assert_eq!(
            ev,
            vec![StreamEvent::ToolCallStart {
                call_id: "toolu_1".into(),
                name: "shell".into(),
                call_index: Some(1),
            }]
        );
    }

    #[test]
    fn parse_stop_reason_tool_use() {
        let ev = parse_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#,
        );
        match &ev[0] {
            StreamEvent::ResponseDone { usage, stop_reason } => {
                assert_eq!(*stop_reason, StopReason::ToolCalls);
                assert_eq!(usage.output_tokens, 42);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_unrecognized_input_is_empty() {
        assert!(parse_event("not json").is_empty());
        assert!(parse_event(r#"{"type":"ping"}"#).is_empty());
    }

    #[test]
    fn convert_messages_routes_tool_result_to_user() {
        let p = provider();
        let msgs = vec![
            Message::user("run ls"),
            Message::tool_result("toolu_1", "files", false),
        ];
        let wire = p.convert_messages(&msgs);
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"][0]["type"], "tool_result");
        assert_eq!(wire[1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn convert_messages_skips_system_role() {
        let p = provider();
        let msgs = vec![Message::system("sys"), Message::user("hi")];
        let wire = p.convert_messages(&msgs);
        assert_eq!(wire.as_array().unwrap().len(), 1);
    }

    #[test]
    fn convert_assistant_with_tool_calls() {
        let p = provider();
        let msgs = vec![Message::assistant_turn(
            Some("let me check".into()),
            None,
            vec![ToolCallSpec {
                call_id: "c1".into(),
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "x"}),
            }],
        )];
        let wire = p.convert_messages(&msgs);
        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["input"]["path"], "x");
    }

    #[test]
    fn malformed_arguments_become_wrapped_object() {
        let raw = Value::String("{not json".into());
        let input = normalize_input(&raw);
        assert!(input.is_object());
        assert_eq!(input["raw"], "{not json");
    }

    #[test]
    fn convert_tools_uses_input_schema_key() {
        let p = provider();
        let wire = p.convert_tools(&[ToolSchema {
            name: "shell".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);
        assert_eq!(wire[0]["input_schema"]["type"], "object");
    }
}
