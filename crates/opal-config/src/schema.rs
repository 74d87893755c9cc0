// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints or additional accounts here and reference them
    /// by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   local:
    ///     provider: openai
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override for local proxies or gateways
    pub base_url: Option<String>,
    /// Max output tokens per turn
    pub max_tokens: Option<u32>,
    /// Context window override; defaults to the catalog value
    pub context_window: Option<u32>,
    /// Thinking level requested from reasoning-capable models:
    /// "off" | "low" | "medium" | "high"
    pub thinking_level: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            context_window: None,
            thinking_level: None,
        }
    }
}

impl ModelConfig {
    /// Parse a `provider/model` CLI spec, falling back to this config's
    /// provider when the spec has no slash.
    pub fn with_spec(&self, spec: &str) -> Self {
        let mut out = self.clone();
        match spec.split_once('/') {
            Some((provider, model)) => {
                out.provider = provider.to_string();
                out.name = model.to_string();
            }
            None => out.name = spec.to_string(),
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum provider round-trips in one user turn before the loop stops.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Maximum retry attempts for transient provider errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubled per attempt).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Persist the session after every completed turn.
    #[serde(default = "default_true")]
    pub persist_sessions: bool,
    /// Derive a session title from the first user message.
    #[serde(default = "default_true")]
    pub auto_title: bool,
    /// Default token budget kept verbatim by `session/compact`.
    #[serde(default = "default_keep_recent_tokens")]
    pub compact_keep_recent_tokens: usize,
    /// Optional system prompt override.
    pub system_prompt: Option<String>,
}

fn default_max_turns() -> u32 {
    50
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    2_000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_keep_recent_tokens() -> usize {
    20_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            persist_sessions: true,
            auto_title: true,
            compact_keep_recent_tokens: default_keep_recent_tokens(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per-call execution timeout in seconds.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Skip all confirmation prompts (CI / --auto-confirm).
    #[serde(default)]
    pub auto_confirm: bool,
    /// Tool names removed from the registry at session start.
    #[serde(default)]
    pub disabled: Vec<String>,
}

fn default_tool_timeout() -> u64 {
    120
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            auto_confirm: false,
            disabled: Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.agent.max_turns, 50);
    }

    #[test]
    fn model_spec_with_slash_overrides_provider() {
        let cfg = ModelConfig::default().with_spec("openai/gpt-4o");
        assert_eq!(cfg.provider, "openai");
        assert_eq!(cfg.name, "gpt-4o");
    }

    #[test]
    fn model_spec_without_slash_keeps_provider() {
        let cfg = ModelConfig::default().with_spec("claude-haiku-4-5");
        assert_eq!(cfg.provider, "anthropic");
        assert_eq!(cfg.name, "claude-haiku-4-5");
    }

    #[test]
    fn agent_defaults_survive_partial_yaml() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_turns: 7").unwrap();
        assert_eq!(cfg.agent.max_turns, 7);
        assert_eq!(cfg.agent.max_retries, 5);
        assert!(cfg.agent.persist_sessions);
    }

    #[test]
    fn tools_config_disabled_list() {
        let cfg: Config = serde_yaml::from_str("tools:\n  disabled: [shell]").unwrap();
        assert_eq!(cfg.tools.disabled, vec!["shell"]);
    }
}
