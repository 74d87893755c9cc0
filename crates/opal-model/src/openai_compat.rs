// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat-completions adapter.
//!
//! Also covers local gateways (Ollama, llama.cpp server, LiteLLM) via the
//! `base_url` override.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{Provider, ProviderStream, StreamOptions},
    retry::{classify_status, ErrorClass},
    Error, Message, Result, Role, StopReason, StreamEvent, ToolSchema, Usage,
};

pub struct OpenAiCompatProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
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
        let mut wire = Vec::new();
        if let Some(system) = opts.system.as_deref() {
            wire.push(json!({ "role": "system", "content": system }));
        }
        if let Value::Array(rest) = self.convert_messages(messages) {
            wire.extend(rest);
        }

        let mut body = json!({
            "model": self.model,
            "messages": wire,
            "max_tokens": opts.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = self.convert_tools(tools);
        }

        debug!(model = %self.model, messages = messages.len(), "openai stream request");

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::ProviderTransient(format!("openai request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let payload = format!("openai error {status}: {text}");
            return Err(match classify_status(status, &text) {
                ErrorClass::Transient => Error::ProviderTransient(payload),
                ErrorClass::Permanent => Error::ProviderPermanent(payload),
            });
        }

        let byte_stream = resp.bytes_stream();
        let events = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(Error::ProviderTransient(
                            format!("openai stream read: {e}"),
                        ))]));
                    }
                };
                buf.push_str(&text);
                let mut out: Vec<Result<StreamEvent>> = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        for ev in parse_chunk(data.trim()) {
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
        parse_chunk(data)
    }

    fn convert_messages(&self, messages: &[Message]) -> Value {
        let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
        for m in messages {
            match m.role {
                Role::System => wire.push(json!({ "role": "system", "content": m.text() })),
                Role::User => wire.push(json!({ "role": "user", "content": m.text() })),
                Role::Assistant | Role::ToolCall => {
                    let mut msg = json!({ "role": "assistant" });
                    if let Some(text) = m.content.as_deref() {
                        if !text.is_empty() {
                            msg["content"] = json!(text);
                        }
                    }
                    let calls: Vec<Value> = m
                        .tool_call_specs()
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.call_id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    if !calls.is_empty() {
                        msg["tool_calls"] = Value::Array(calls);
                    }
                    wire.push(msg);
                }
                Role::ToolResult => wire.push(json!({
                    "role": "tool",
                    "tool_call_id": m.call_id.clone().unwrap_or_default(),
                    "content": m.text(),
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
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect(),
        )
    }
}

fn parse_chunk(data: &str) -> Vec<StreamEvent> {
    if data == "[DONE]" {
        return vec![];
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return vec![],
    };
    let mut out = Vec::new();

    // Usage-only chunks arrive after the last choice when stream_options
    // requests them.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        out.push(StreamEvent::Usage {
            usage: Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                ..Default::default()
            },
        });
    }

    let Some(choice) = v["choices"].get(0) else {
        return out;
    };
    let delta = &choice["delta"];

    if let Some(text) = delta["reasoning_content"].as_str() {
        if !text.is_empty() {
            out.push(StreamEvent::ThinkingDelta { text: text.into() });
        }
    }
    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            out.push(StreamEvent::TextDelta { text: text.into() });
        }
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for tc in calls {
            let index = tc["index"].as_u64().map(|i| i as u32);
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc["function"]["name"].as_str().unwrap_or("");
            let args = tc["function"]["arguments"].as_str().unwrap_or("");
            if !id.is_empty() || !name.is_empty() {
                out.push(StreamEvent::ToolCallStart {
                    call_id: id.to_string(),
                    name: name.to_string(),
                    call_index: index,
                });
            }
            if !args.is_empty() {
                out.push(StreamEvent::ToolCallDelta {
                    call_id: if id.is_empty() {
                        None
                    } else {
                        Some(id.to_string())
                    },
                    call_index: index,
                    delta: args.to_string(),
                });
            }
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        let stop_reason = if reason == "tool_calls" {
            StopReason::ToolCalls
        } else {
            StopReason::Stop
        };
        out.push(StreamEvent::ResponseDone {
            usage: Usage::default(),
            stop_reason,
        });
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
