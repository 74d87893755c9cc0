// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod catalog;
mod error;
mod mock;
mod openai_compat;
mod provider;
mod retry;
mod types;

pub use anthropic::AnthropicProvider;
pub use catalog::{lookup, static_catalog, ModelCatalogEntry};
pub use error::{Error, Result};
pub use mock::{text_script, tool_calls_script, MockProvider, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{
    build_provider, CancelHandle, EventStream, Provider, ProviderStream, StreamOptions,
};
pub use retry::{backoff_delay, classify, classify_status, ErrorClass};
pub use types::{
    Message, Role, StopReason, StreamEvent, ToolCallSpec, ToolSchema, Usage,
};
