// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};

use crate::{
    provider::{Provider, ProviderStream, StreamOptions},
    Message, Result, Role, StopReason, StreamEvent, ToolSchema, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
        _opts: &StreamOptions,
    ) -> Result<ProviderStream> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text().to_string())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextStart { info: None }),
            Ok(StreamEvent::TextDelta {
                text: format!("MOCK: {reply}"),
            }),
            Ok(StreamEvent::ResponseDone {
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                    ..Default::default()
                },
                stop_reason: StopReason::Stop,
            }),
        ];
        Ok(ProviderStream::new(stream::iter(events)))
    }

    fn parse_stream_event(&self, _data: &str) -> Vec<StreamEvent> {
        vec![]
    }

    fn convert_messages(&self, messages: &[Message]) -> Value {
        json!(messages.len())
    }

    fn convert_tools(&self, tools: &[ToolSchema]) -> Value {
        json!(tools.len())
    }
}

/// A pre-scripted provider.  Each `stream()` call pops the next event script
/// from the front of the queue, so tests can specify exact sequences —
/// including tool calls and mid-stream errors — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// Errors returned instead of a stream, keyed by call number.  A `Some`
    /// at the front is taken before any script.
    failures: Arc<Mutex<Vec<crate::Error>>>,
    /// The message path seen by the most recent `stream()` call.
    pub last_messages: Arc<Mutex<Vec<Message>>>,
    /// Total number of `stream()` calls made.
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            failures: Arc::new(Mutex::new(Vec::new())),
            last_messages: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue an error to be returned by the next `stream()` call, before any
    /// remaining scripts are consumed.
    pub fn fail_next(self, err: crate::Error) -> Self {
        self.failures.lock().unwrap().push(err);
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_script(reply)])
    }

    /// Convenience: one tool call, then a text reply on the next segment.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            tool_calls_script(vec![(call_id.into(), name.into(), arguments)]),
            text_script(final_text),
        ])
    }
}

/// Script fragment: a complete text-only segment.
pub fn text_script(text: impl Into<String>) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextStart { info: None },
        StreamEvent::TextDelta { text: text.into() },
        StreamEvent::ResponseDone {
            usage: Usage {
                input_tokens: 5,
                output_tokens: 5,
                ..Default::default()
            },
            stop_reason: StopReason::Stop,
        },
    ]
}

/// Script fragment: a segment that finishes with the given tool calls.
pub fn tool_calls_script(calls: Vec<(String, String, Value)>) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = calls
        .into_iter()
        .map(|(call_id, name, arguments)| StreamEvent::ToolCallDone {
            call_id,
            name,
            arguments,
        })
        .collect();
    events.push(StreamEvent::ResponseDone {
        usage: Usage {
            input_tokens: 5,
            output_tokens: 5,
            ..Default::default()
        },
        stop_reason: StopReason::ToolCalls,
    });
    events
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
        _opts: &StreamOptions,
    ) -> Result<ProviderStream> {
        *self.last_messages.lock().unwrap() = messages.to_vec();
        *self.calls.lock().unwrap() += 1;

        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(ProviderStream::new(stream::iter(wrapped)))
    }

    fn parse_stream_event(&self, _data: &str) -> Vec<StreamEvent> {
        vec![]
    }

    fn convert_messages(&self, messages: &[Message]) -> Value {
        json!(messages.len())
    }

    fn convert_tools(&self, tools: &[ToolSchema]) -> Value {
        json!(tools.len())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn drain(mut ps: ProviderStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = ps.events.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let msgs = vec![Message::user("ping")];
        let events = drain(p.stream(&msgs, &[], &StreamOptions::default()).await.unwrap()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { text } if text.contains("MOCK: ping"))));
    }

    #[tokio::test]
    async fn mock_ends_with_response_done() {
        let p = MockProvider;
        let msgs = vec![Message::user("x")];
        let events = drain(p.stream(&msgs, &[], &StreamOptions::default()).await.unwrap()).await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::ResponseDone { .. })
        ));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedProvider::new(vec![text_script("one"), text_script("two")]);
        let msgs = vec![Message::user("x")];
        let a = drain(p.stream(&msgs, &[], &StreamOptions::default()).await.unwrap()).await;
        let b = drain(p.stream(&msgs, &[], &StreamOptions::default()).await.unwrap()).await;
        assert!(a.iter().any(|e| matches!(e, StreamEvent::TextDelta { text } if text == "one")));
        assert!(b.iter().any(|e| matches!(e, StreamEvent::TextDelta { text } if text == "two")));
    }

    #[tokio::test]
    async fn scripted_fail_next_returns_error_before_scripts() {
        let p = ScriptedProvider::always_text("later")
            .fail_next(crate::Error::ProviderTransient("overloaded".into()));
        let msgs = vec![Message::user("x")];
        assert!(p.stream(&msgs, &[], &StreamOptions::default()).await.is_err());
        assert!(p.stream(&msgs, &[], &StreamOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_records_last_messages() {
        let p = ScriptedProvider::always_text("ok");
        let msgs = vec![Message::user("inspect me")];
        let _ = p.stream(&msgs, &[], &StreamOptions::default()).await.unwrap();
        assert_eq!(p.last_messages.lock().unwrap()[0].text(), "inspect me");
    }

    #[tokio::test]
    async fn tool_then_text_emits_tool_call_first_round() {
        let p = ScriptedProvider::tool_then_text("c1", "shell", json!({"command":"ls"}), "done");
        let msgs = vec![Message::user("x")];
        let events = drain(p.stream(&msgs, &[], &StreamOptions::default()).await.unwrap()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallDone { name, .. } if name == "shell")));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::ResponseDone {
                stop_reason: StopReason::ToolCalls,
                ..
            })
        ));
    }
}
