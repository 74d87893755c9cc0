// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use opal_model::Usage;

/// Events published on a session's bus during a turn.
///
/// The RPC transport forwards these verbatim as `agent/event` notifications;
/// the serialized `type` tag is the wire-level event name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        usage: Usage,
    },
    AgentAbort,
    AgentRecovered,
    /// First text of a new streaming assistant message.
    MessageStart,
    MessageDelta {
        text: String,
    },
    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    ToolExecutionStart {
        call_id: String,
        name: String,
    },
    ToolExecutionEnd {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// One provider segment (and its tool phase) finished.
    TurnEnd,
    ContextDiscovered {
        path: String,
    },
    SkillLoaded {
        name: String,
    },
    /// Event from a nested session re-published on the parent's bus.
    SubAgentEvent {
        session_id: String,
        call_id: String,
        event: Box<AgentEvent>,
    },
    UsageUpdate {
        usage: Usage,
        /// Hybrid context-pressure estimate for the current path.
        context_tokens: u64,
    },
    StatusUpdate {
        status: String,
    },
    Error {
        reason: String,
    },
}

impl AgentEvent {
    /// Terminal events close a turn and are never coalesced or dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::AgentEnd { .. } | AgentEvent::AgentAbort | AgentEvent::Error { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(AgentEvent::AgentEnd {
            usage: Usage::default()
        }
        .is_terminal());
        assert!(AgentEvent::AgentAbort.is_terminal());
        assert!(AgentEvent::Error {
            reason: "x".into()
        }
        .is_terminal());
        assert!(!AgentEvent::AgentStart.is_terminal());
        assert!(!AgentEvent::MessageDelta { text: "t".into() }.is_terminal());
    }

    #[test]
    fn wire_type_tags_are_snake_case() {
        let v = serde_json::to_value(AgentEvent::ToolExecutionStart {
            call_id: "c".into(),
            name: "shell".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "tool_execution_start");
        let v = serde_json::to_value(AgentEvent::AgentRecovered).unwrap();
        assert_eq!(v["type"], "agent_recovered");
    }

    #[test]
    fn sub_agent_event_nests() {
        let ev = AgentEvent::SubAgentEvent {
            session_id: "sub".into(),
            call_id: "c1".into(),
            event: Box::new(AgentEvent::MessageDelta { text: "hi".into() }),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "sub_agent_event");
        assert_eq!(v["event"]["type"], "message_delta");
    }
}
