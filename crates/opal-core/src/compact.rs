// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction: replace the old portion of the path with one summary
//! message, produced either deterministically (`truncate`) or by the model
//! (`summarize`, falling back to `truncate` on any provider failure).

use std::collections::BTreeSet;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use opal_model::{Message, Provider, Result, Role, StreamEvent, StreamOptions};

const SUMMARIZE_PROMPT: &str = "You are a context compaction assistant. Summarise the \
conversation between the <conversation> tags in a concise, information-dense way. \
Preserve technical details, decisions, file names and tool outputs that matter for \
future work. Do NOT continue the conversation, answer questions from it, or call \
tools; output only the summary text.";

const UPDATE_PROMPT: &str = "You are a context compaction assistant. An earlier summary \
of this session is given first, followed by the conversation that happened since, \
between <conversation> tags. Produce one updated summary that folds the new events \
into the earlier one. Do NOT continue the conversation; output only the summary text.";

const SPLIT_TURN_NOTE: &str = "The conversation ends inside an unfinished turn. Add a \
second section titled 'In-progress turn' describing what that turn is doing so the \
work can continue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactStrategy {
    Truncate,
    Summarize,
}

#[derive(Debug, Clone)]
pub struct CompactOptions {
    pub strategy: CompactStrategy,
    pub keep_recent_tokens: usize,
    pub force: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            strategy: CompactStrategy::Truncate,
            keep_recent_tokens: 20_000,
            force: false,
        }
    }
}

/// Where the path splits into removed prefix and kept suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutPlan {
    /// Messages `path[..cut_idx]` are removed.
    pub cut_idx: usize,
    /// True when the cut falls inside a turn rather than at a user boundary.
    pub split_turn: bool,
}

/// Compute the cut point for the given keep budget.
///
/// The suffix that fits within `keep_recent_tokens` is extended backward to
/// the nearest preceding user message so kept messages form a coherent turn
/// suffix.  Fewer than 2 removable messages is a no-op unless `force` is
/// set; a forced cut with no usable boundary falls mid-turn.
pub fn plan_cut(path: &[Message], keep_recent_tokens: usize, force: bool) -> Option<CutPlan> {
    if path.len() < 2 {
        return None;
    }

    // Smallest index whose suffix fits in the budget.
    let mut budget = keep_recent_tokens as i64;
    let mut fit_idx = path.len();
    for (i, m) in path.iter().enumerate().rev() {
        budget -= m.approx_tokens() as i64;
        if budget < 0 {
            break;
        }
        fit_idx = i;
    }
    if fit_idx == 0 {
        // Everything fits; nothing to remove.
        return None;
    }

    // Snap back to a turn boundary at or before the fit point.
    let boundary = path[..=fit_idx.min(path.len() - 1)]
        .iter()
        .rposition(|m| m.role == Role::User);

    match boundary {
        Some(b) if b > 0 => {
            if b >= 2 || force {
                Some(CutPlan {
                    cut_idx: b,
                    split_turn: false,
                })
            } else {
                None
            }
        }
        _ => {
            // The whole fit region sits inside the first turn.  Only a forced
            // compaction cuts here, mid-turn.
            if force && fit_idx >= 2 {
                Some(CutPlan {
                    cut_idx: fit_idx,
                    split_turn: true,
                })
            } else {
                None
            }
        }
    }
}

/// File paths touched by tool calls in a removed segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileOps {
    pub read: BTreeSet<String>,
    pub modified: BTreeSet<String>,
}

impl FileOps {
    /// Scan a segment for file operations, folding in the cumulative
    /// metadata of a prior summary when present.  A path that was both read
    /// and written counts as modified only.
    pub fn collect(removed: &[Message]) -> Self {
        let mut ops = Self::default();

        for m in removed {
            // A prior summary's cumulative metadata is carried forward.
            if let Some(meta) = &m.metadata {
                if meta.get("type").and_then(Value::as_str) == Some("compaction_summary") {
                    for p in string_list(meta, "read_files") {
                        ops.read.insert(p);
                    }
                    for p in string_list(meta, "modified_files") {
                        ops.modified.insert(p);
                    }
                }
            }
            for tc in m.tool_call_specs() {
                let Some(path) = tc.arguments.get("path").and_then(Value::as_str) else {
                    continue;
                };
                match tc.name.as_str() {
                    "read_file" => {
                        ops.read.insert(path.to_string());
                    }
                    "write_file" | "edit_file" => {
                        ops.modified.insert(path.to_string());
                    }
                    _ => {}
                }
            }
        }

        // read ∩ modified reclassifies as modified.
        ops.read = &ops.read - &ops.modified;
        ops
    }
}

fn string_list(meta: &Value, key: &str) -> Vec<String> {
    meta.get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Deterministic summary: compacted turn counts, role frequencies, and the
/// collected file-operation lists.
pub fn truncate_summary(removed: &[Message], ops: &FileOps, split_turn: bool) -> String {
    let users = removed.iter().filter(|m| m.role == Role::User).count();
    let assistants = removed.iter().filter(|m| m.role == Role::Assistant).count();
    let tool_results = removed
        .iter()
        .filter(|m| m.role == Role::ToolResult)
        .count();
    let tool_calls: usize = removed.iter().map(|m| m.tool_call_specs().len()).sum();

    let mut out = format!(
        "[Conversation summary]\nCompacted {users} turns ({} messages: {users} user, \
         {assistants} assistant, {tool_calls} tool calls, {tool_results} tool results).",
        removed.len()
    );
    if !ops.read.is_empty() {
        out.push_str(&format!(
            "\nFiles read: {}",
            ops.read.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !ops.modified.is_empty() {
        out.push_str(&format!(
            "\nFiles modified: {}",
            ops.modified.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if split_turn {
        out.push_str("\n\n[In-progress turn]\n");
        out.push_str(&describe_in_progress(removed));
    }
    out
}

/// Short factual description of the unfinished turn's tail for mid-turn cuts.
fn describe_in_progress(removed: &[Message]) -> String {
    let last_user = removed.iter().rposition(|m| m.role == Role::User);
    let tail = match last_user {
        Some(i) => &removed[i..],
        None => removed,
    };
    let tools: Vec<String> = tail
        .iter()
        .flat_map(|m| m.tool_call_specs())
        .map(|tc| tc.name.clone())
        .collect();
    let request = tail
        .first()
        .filter(|m| m.role == Role::User)
        .map(|m| m.text().chars().take(200).collect::<String>());
    match (request, tools.is_empty()) {
        (Some(req), false) => format!(
            "Working on: {req}\nTools used so far: {}",
            tools.join(", ")
        ),
        (Some(req), true) => format!("Working on: {req}"),
        (None, false) => format!("Tools used so far: {}", tools.join(", ")),
        (None, true) => "The turn had produced no tool activity yet.".into(),
    }
}

/// Plain-text rendering of a segment for the summarization prompt.
pub fn serialize_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
                Role::ToolCall => "Assistant",
                Role::ToolResult => "Tool",
            };
            let mut text = m.text().to_string();
            for tc in m.tool_call_specs() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&format!("[tool_call: {}({})]", tc.name, tc.arguments));
            }
            if m.role == Role::ToolResult {
                text = format!("[tool_result: {text}]");
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the full anti-continuation prompt for the summarize strategy.
pub fn build_summarize_prompt(
    removed: &[Message],
    prior_summary: Option<&str>,
    split_turn: bool,
) -> String {
    let serialized = serialize_conversation(removed);
    let base = match prior_summary {
        Some(prior) => format!("{UPDATE_PROMPT}\n\nEarlier summary:\n{prior}"),
        None => SUMMARIZE_PROMPT.to_string(),
    };
    let note = if split_turn {
        format!("\n{SPLIT_TURN_NOTE}")
    } else {
        String::new()
    };
    format!("{base}{note}\n\n<conversation>\n{serialized}\n</conversation>")
}

/// Collect the provider's full streamed text for a summarization request.
async fn summarize_with_provider(
    provider: &dyn Provider,
    removed: &[Message],
    prior_summary: Option<&str>,
    split_turn: bool,
) -> Result<String> {
    let prompt = build_summarize_prompt(removed, prior_summary, split_turn);
    let mut ps = provider
        .stream(&[Message::user(prompt)], &[], &StreamOptions::default())
        .await?;

    let mut text = String::new();
    while let Some(ev) = ps.events.next().await {
        match ev? {
            StreamEvent::TextDelta { text: t } => text.push_str(&t),
            StreamEvent::Error { payload } => {
                return Err(opal_model::Error::ProviderTransient(payload))
            }
            _ => {}
        }
    }
    if text.trim().is_empty() {
        return Err(opal_model::Error::ProviderTransient(
            "empty summary from provider".into(),
        ));
    }
    Ok(text)
}

/// Compute the replacement for a path under the given options.
///
/// Returns `None` when compaction is a no-op.  Otherwise the ids to remove
/// and the summary message (with cumulative file-op metadata attached),
/// ready for `MessageStore::replace_path_segment`.
pub async fn compact_path(
    path: &[Message],
    provider: Option<&dyn Provider>,
    opts: &CompactOptions,
) -> Option<(Vec<String>, Message)> {
    let plan = plan_cut(path, opts.keep_recent_tokens, opts.force)?;
    let removed = &path[..plan.cut_idx];

    let ops = FileOps::collect(removed);
    let prior_summary = removed.first().and_then(|m| {
        m.metadata
            .as_ref()
            .filter(|meta| meta.get("type").and_then(Value::as_str) == Some("compaction_summary"))
            .map(|_| m.text().to_string())
    });

    let content = match (opts.strategy, provider) {
        (CompactStrategy::Summarize, Some(p)) => {
            match summarize_with_provider(p, removed, prior_summary.as_deref(), plan.split_turn)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!("summarize compaction failed, falling back to truncate: {e}");
                    truncate_summary(removed, &ops, plan.split_turn)
                }
            }
        }
        _ => truncate_summary(removed, &ops, plan.split_turn),
    };

    let mut summary = Message::user(content);
    summary.metadata = Some(json!({
        "type": "compaction_summary",
        "read_files": ops.read.iter().collect::<Vec<_>>(),
        "modified_files": ops.modified.iter().collect::<Vec<_>>(),
    }));

    let ids = removed.iter().map(|m| m.id.clone()).collect();
    Some((ids, summary))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
