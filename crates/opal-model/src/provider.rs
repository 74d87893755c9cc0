// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use opal_config::ModelConfig;

use crate::{
    catalog, AnthropicProvider, Error, Message, MockProvider, OpenAiCompatProvider, Result,
    StreamEvent, ToolSchema,
};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Handle for cancelling an in-flight provider stream.
///
/// Idempotent and safe to call from any task.  Cancellation is explicit, not
/// drop-based, because some backends need an outbound cancel to stop billing.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// A lazy, finite, cancellable sequence of stream events.
pub struct ProviderStream {
    pub events: EventStream,
    pub cancel: CancelHandle,
}

impl ProviderStream {
    /// Wrap a raw event stream so that `cancel()` terminates it promptly.
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = Result<StreamEvent>> + Send + 'static,
    {
        let cancel = CancelHandle::new();
        let guarded = events.take_until(cancel.token().cancelled_owned());
        Self {
            events: Box::pin(guarded),
            cancel,
        }
    }
}

/// Per-request options orthogonal to messages and tools.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// System prompt routed per the model's capabilities.
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    /// "off" | "low" | "medium" | "high"
    pub thinking_level: Option<String>,
}

/// The streaming contract every model backend implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier ("anthropic", "openai", "mock").
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Open a streaming completion over the given conversation path.
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        opts: &StreamOptions,
    ) -> Result<ProviderStream>;

    /// Parse one wire payload into zero or more stream events.  Pure; returns
    /// an empty vec on unrecognized input.
    fn parse_stream_event(&self, data: &str) -> Vec<StreamEvent>;

    /// Convert a conversation path to this provider's wire format.
    fn convert_messages(&self, messages: &[Message]) -> Value;

    /// Convert tool schemas to this provider's wire format.
    fn convert_tools(&self, tools: &[ToolSchema]) -> Value;

    /// Context window from the static catalog; `None` for unknown models.
    fn context_window(&self) -> Option<u32> {
        catalog::lookup(self.name(), self.model()).map(|e| e.context_window)
    }

    fn max_output_tokens(&self) -> Option<u32> {
        catalog::lookup(self.name(), self.model()).map(|e| e.max_output_tokens)
    }

    /// Whether the model exposes a reasoning/thinking channel.  Affects
    /// system-role routing in `convert_messages` for some providers.
    fn supports_reasoning(&self) -> bool {
        catalog::lookup(self.name(), self.model())
            .map(|e| e.reasoning)
            .unwrap_or(false)
    }
}

/// Build a provider from config, reading the API key from the config field,
/// the configured env var, or the supplied fallback (auth store).
pub fn build_provider(
    cfg: &ModelConfig,
    fallback_key: Option<String>,
) -> Result<Arc<dyn Provider>> {
    let key = cfg
        .api_key
        .clone()
        .or_else(|| {
            cfg.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
        .or(fallback_key);

    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            cfg.name.clone(),
            key,
            cfg.base_url.clone(),
            cfg.max_tokens,
        ))),
        "openai" => Ok(Arc::new(OpenAiCompatProvider::new(
            cfg.name.clone(),
            key,
            cfg.base_url.clone(),
            cfg.max_tokens,
        ))),
        "mock" => Ok(Arc::new(MockProvider::default())),
        other => Err(Error::InvalidParams(format!("unknown provider: {other}"))),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
