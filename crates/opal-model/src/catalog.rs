// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// One known provider/model combination with its context metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub provider: String,
    pub id: String,
    pub display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// Whether the model exposes a reasoning/thinking channel.
    pub reasoning: bool,
}

fn entry(
    provider: &str,
    id: &str,
    display_name: &str,
    context_window: u32,
    max_output_tokens: u32,
    reasoning: bool,
) -> ModelCatalogEntry {
    ModelCatalogEntry {
        provider: provider.into(),
        id: id.into(),
        display_name: display_name.into(),
        context_window,
        max_output_tokens,
        reasoning,
    }
}

/// The static model catalog.  Live provider listings are merged on top of
/// this by the `models/list` handler when available.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        entry("anthropic", "claude-opus-4-5", "Claude Opus 4.5", 200_000, 32_000, true),
        entry("anthropic", "claude-sonnet-4-5", "Claude Sonnet 4.5", 200_000, 64_000, true),
        entry("anthropic", "claude-haiku-4-5", "Claude Haiku 4.5", 200_000, 64_000, true),
        entry("openai", "gpt-4o", "GPT-4o", 128_000, 16_384, false),
        entry("openai", "gpt-4o-mini", "GPT-4o mini", 128_000, 16_384, false),
        entry("openai", "gpt-4.1", "GPT-4.1", 1_000_000, 32_768, false),
        entry("mock", "mock-model", "Mock", 128_000, 4_096, false),
    ]
}

/// Look up a catalog entry by provider and model id.
pub fn lookup(provider: &str, model: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && e.id == model)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_model() {
        let e = lookup("anthropic", "claude-sonnet-4-5").unwrap();
        assert_eq!(e.context_window, 200_000);
        assert!(e.reasoning);
    }

    #[test]
    fn lookup_unknown_model_is_none() {
        assert!(lookup("anthropic", "claude-0").is_none());
    }

    #[test]
    fn catalog_ids_are_unique_per_provider() {
        let cat = static_catalog();
        for (i, a) in cat.iter().enumerate() {
            for b in &cat[i + 1..] {
                assert!(!(a.provider == b.provider && a.id == b.id));
            }
        }
    }
}
