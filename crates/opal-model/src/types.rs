// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-message token overhead added on top of the 4-bytes/token heuristic.
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

fn is_false(b: &bool) -> bool {
    !*b
}

/// A single tool invocation recorded on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallSpec {
    pub call_id: String,
    pub name: String,
    /// Parsed JSON arguments.  When the model emitted malformed JSON the raw
    /// text is kept as a string value rather than dropped.
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    ToolCall,
    ToolResult,
}

/// One immutable node of the conversation tree.
///
/// `parent_id` always points at the message that was `current` when this one
/// was appended, so cycles cannot form.  Mutation happens only through the
/// store's segment replacement during compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning text, kept separate from `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallSpec>>,
    /// Required for `tool_result` and `tool_call` roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn blank(role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            role,
            content: None,
            thinking: None,
            tool_calls: None,
            call_id: None,
            is_error: false,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::blank(Role::User)
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::blank(Role::System)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::blank(Role::Assistant)
        }
    }

    /// Full assistant turn: streamed text, thinking, and any tool calls.
    pub fn assistant_turn(
        content: Option<String>,
        thinking: Option<String>,
        tool_calls: Vec<ToolCallSpec>,
    ) -> Self {
        Self {
            content,
            thinking,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            ..Self::blank(Role::Assistant)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            call_id: Some(call_id.into()),
            content: Some(content.into()),
            is_error,
            ..Self::blank(Role::ToolResult)
        }
    }

    /// Tool calls carried by this message, assistant list or standalone.
    pub fn tool_call_specs(&self) -> &[ToolCallSpec] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Approximate token count: 4 bytes per token for all text plus a fixed
    /// per-message overhead.  Tool-call framing counts name and JSON-encoded
    /// arguments.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.as_deref().map(str::len).unwrap_or(0);
        chars += self.thinking.as_deref().map(str::len).unwrap_or(0);
        for tc in self.tool_call_specs() {
            chars += tc.name.len() + tc.arguments.to_string().len();
        }
        chars / 4 + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Why a provider stream segment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

impl Usage {
    /// Fold another report into this one.  Input counts replace (each report
    /// is the full prompt size); output counts accumulate.
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        self.output_tokens += other.output_tokens;
        if other.cache_read_tokens > 0 {
            self.cache_read_tokens = other.cache_read_tokens;
        }
        if other.cache_write_tokens > 0 {
            self.cache_write_tokens = other.cache_write_tokens;
        }
    }
}

/// A single parsed event from a provider stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<Value>,
    },
    TextDelta {
        text: String,
    },
    TextDone {
        text: String,
    },
    ThinkingStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<Value>,
    },
    ThinkingDelta {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_index: Option<u32>,
    },
    ToolCallDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_index: Option<u32>,
        delta: String,
    },
    ToolCallDone {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ResponseDone {
        usage: Usage,
        stop_reason: StopReason,
    },
    Usage {
        usage: Usage,
    },
    Error {
        payload: String,
    },
}

/// A tool schema handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(Message::user("a").id, Message::user("a").id);
    }

    #[test]
    fn user_message_has_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert!(!m.is_error);
    }

    #[test]
    fn tool_result_carries_call_id_and_error_flag() {
        let m = Message::tool_result("call_1", "boom", true);
        assert_eq!(m.role, Role::ToolResult);
        assert_eq!(m.call_id.as_deref(), Some("call_1"));
        assert!(m.is_error);
    }

    #[test]
    fn assistant_turn_with_no_calls_has_none() {
        let m = Message::assistant_turn(Some("hi".into()), None, vec![]);
        assert!(m.tool_calls.is_none());
        assert!(m.tool_call_specs().is_empty());
    }

    #[test]
    fn approx_tokens_counts_content_and_overhead() {
        // 40 bytes of content → 10 tokens + 10 overhead
        let m = Message::user("a".repeat(40));
        assert_eq!(m.approx_tokens(), 20);
    }

    #[test]
    fn approx_tokens_counts_tool_call_framing() {
        let m = Message::assistant_turn(
            None,
            None,
            vec![ToolCallSpec {
                call_id: "c1".into(),
                name: "shell".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        // name (5) + json args bytes, all / 4, plus overhead
        assert!(m.approx_tokens() > MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::assistant_turn(
            Some("text".into()),
            Some("thought".into()),
            vec![ToolCallSpec {
                call_id: "c".into(),
                name: "read_file".into(),
                arguments: json!({"path": "x.txt"}),
            }],
        );
        let line = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, m.id);
        assert_eq!(back.thinking.as_deref(), Some("thought"));
        assert_eq!(back.tool_call_specs().len(), 1);
    }

    #[test]
    fn roles_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&Role::ToolResult).unwrap(),
            "\"tool_result\""
        );
    }

    #[test]
    fn stream_event_tagging() {
        let ev = StreamEvent::ToolCallDone {
            call_id: "a".into(),
            name: "shell".into(),
            arguments: json!({"cmd": "ls"}),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_call_done");
        assert_eq!(v["call_id"], "a");
    }

    #[test]
    fn usage_merge_replaces_input_accumulates_output() {
        let mut u = Usage {
            input_tokens: 100,
            output_tokens: 5,
            ..Default::default()
        };
        u.merge(&Usage {
            input_tokens: 120,
            output_tokens: 7,
            ..Default::default()
        });
        assert_eq!(u.input_tokens, 120);
        assert_eq!(u.output_tokens, 12);
    }
}
