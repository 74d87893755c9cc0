// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use opal_model::{ToolSchema, Usage};

/// Lifecycle status of one session's agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Streaming,
    WaitingTools,
    Aborting,
    Retrying,
    Recovered,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Streaming => "streaming",
            AgentStatus::WaitingTools => "waiting_tools",
            AgentStatus::Aborting => "aborting",
            AgentStatus::Retrying => "retrying",
            AgentStatus::Recovered => "recovered",
            AgentStatus::Error => "error",
        }
    }
}

/// In-memory runtime state of one session, owned and mutated exclusively by
/// its agent loop.
#[derive(Debug)]
pub struct AgentState {
    pub session_id: String,
    pub status: AgentStatus,
    pub model: String,
    pub provider: String,
    pub tools: Vec<ToolSchema>,
    pub disabled_tools: Vec<String>,
    /// User messages that arrived mid-turn, delivered before the next
    /// provider call.
    pub pending_steers: VecDeque<String>,
    /// Cumulative usage across the session.
    pub token_usage: Usage,
    pub working_dir: PathBuf,
    /// Reason the session entered `Error`, if it did.
    pub last_error: Option<String>,
}

impl AgentState {
    pub fn new(
        session_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        tools: Vec<ToolSchema>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status: AgentStatus::Idle,
            model: model.into(),
            provider: provider.into(),
            tools,
            disabled_tools: Vec::new(),
            pending_steers: VecDeque::new(),
            token_usage: Usage::default(),
            working_dir,
            last_error: None,
        }
    }
}

/// Serializable answer to `agent/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub status: AgentStatus,
    pub model: String,
    pub message_count: usize,
    pub tools: Vec<String>,
    pub token_usage: Usage,
    /// Hybrid context-pressure estimate for the current path.
    pub context_tokens: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::WaitingTools).unwrap(),
            "\"waiting_tools\""
        );
        assert_eq!(AgentStatus::WaitingTools.as_str(), "waiting_tools");
    }

    #[test]
    fn new_state_is_idle_with_empty_queues() {
        let s = AgentState::new("s", "mock", "mock-model", vec![], PathBuf::from("."));
        assert_eq!(s.status, AgentStatus::Idle);
        assert!(s.pending_steers.is_empty());
        assert!(s.last_error.is_none());
    }
}
