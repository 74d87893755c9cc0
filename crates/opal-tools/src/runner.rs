// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parallel tool-batch execution with per-call supervision.
//!
//! One batch corresponds to the tool calls of a single assistant turn.  Calls
//! run as independent tasks; a panic or timeout in one call never fails the
//! batch.  Results come back in input order regardless of completion order.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ToolCall, ToolContext, ToolRegistry, ToolResult};

/// Reply to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAction {
    Allow,
    Deny,
    /// Allow and cache the authorization for the rest of the session.
    AllowSession,
}

impl ConfirmAction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "allow_session" => Some(Self::AllowSession),
            _ => None,
        }
    }
}

/// A confirmation request forwarded to the client.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub session_id: String,
    pub title: String,
    pub message: String,
    pub actions: Vec<String>,
}

/// Obtains user authorization for a tool call.  The RPC transport implements
/// this by issuing a `client/confirm` request; only the asking call blocks on
/// the reply.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, req: ConfirmRequest) -> opal_model::Result<ConfirmAction>;
}

/// Confirmer that allows everything (`--auto-confirm`, CI).
pub struct AutoConfirmer;

#[async_trait]
impl Confirmer for AutoConfirmer {
    async fn confirm(&self, _req: ConfirmRequest) -> opal_model::Result<ConfirmAction> {
        Ok(ConfirmAction::Allow)
    }
}

/// Execution events published by the runner.  The agent loop forwards them to
/// the session bus; the per-call start/end pairing is guaranteed here.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    ExecutionStart {
        call_id: String,
        name: String,
    },
    ExecutionEnd {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
}

pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    confirmer: Arc<dyn Confirmer>,
    call_timeout: Duration,
    auto_confirm: bool,
    /// `allow_session` cache: tool name + argument-key fingerprint.
    session_allows: Mutex<HashSet<String>>,
    /// Cancel token for the batch currently in flight, if any.
    active_batch: Mutex<Option<CancellationToken>>,
}

impl ToolRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        confirmer: Arc<dyn Confirmer>,
        call_timeout: Duration,
        auto_confirm: bool,
    ) -> Self {
        Self {
            registry,
            confirmer,
            call_timeout,
            auto_confirm,
            session_allows: Mutex::new(HashSet::new()),
            active_batch: Mutex::new(None),
        }
    }

    /// Cooperatively cancel every in-flight call of the active batch.
    /// Idempotent; a no-op when no batch is running.
    pub fn cancel_all(&self) {
        if let Some(token) = self.active_batch.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Execute a batch of tool calls in parallel.
    ///
    /// The returned list matches `calls` in order.  Every call publishes an
    /// `ExecutionStart` before it runs and exactly one `ExecutionEnd` with its
    /// result, even when it is unknown, denied, times out, panics, or is
    /// cancelled.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        ctx: Arc<ToolContext>,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Vec<ToolResult> {
        let token = CancellationToken::new();
        *self.active_batch.lock().unwrap() = Some(token.clone());

        let mut tasks = Vec::with_capacity(calls.len());
        for call in calls {
            let call = call.clone();
            let ctx = Arc::clone(&ctx);
            let events = events.clone();
            let token = token.clone();
            let registry = Arc::clone(&self.registry);
            let confirmer = Arc::clone(&self.confirmer);
            let timeout = self.call_timeout;
            let auto_confirm = self.auto_confirm;
            let allowed = self.is_session_allowed(&call);

            tasks.push(tokio::spawn(async move {
                let _ = events
                    .send(RunnerEvent::ExecutionStart {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                    })
                    .await;

                let (result, allow_session) = tokio::select! {
                    _ = token.cancelled() => {
                        (ToolResult::err(&call.call_id, "Aborted"), false)
                    }
                    out = run_one(&registry, &confirmer, &call, &ctx, timeout, auto_confirm, allowed) => out,
                };

                let _ = events
                    .send(RunnerEvent::ExecutionEnd {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        output: result.content.clone(),
                        is_error: result.is_error,
                    })
                    .await;
                (result, allow_session)
            }));
        }

        let mut results = Vec::with_capacity(calls.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let result = match task.await {
                Ok((result, allow_session)) => {
                    if allow_session {
                        self.remember_session_allow(&calls[i]);
                    }
                    result
                }
                Err(e) => {
                    // Panics are already caught inside the task; reaching
                    // this means the task itself died (e.g. cancelled).
                    warn!(call_id = %calls[i].call_id, "tool task failed: {e}");
                    ToolResult::err(&calls[i].call_id, format!("tool task failed: {e}"))
                }
            };
            results.push(result);
        }

        *self.active_batch.lock().unwrap() = None;
        results
    }

    fn is_session_allowed(&self, call: &ToolCall) -> bool {
        self.session_allows
            .lock()
            .unwrap()
            .contains(&fingerprint(call))
    }

    fn remember_session_allow(&self, call: &ToolCall) {
        self.session_allows.lock().unwrap().insert(fingerprint(call));
    }
}

/// Authorization cache key: tool name plus the sorted top-level argument key
/// set.  Keys, not values, so "always allow shell" does not require
/// byte-identical commands.
fn fingerprint(call: &ToolCall) -> String {
    let mut keys: Vec<&str> = call
        .arguments
        .as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default();
    keys.sort_unstable();
    format!("{}({})", call.name, keys.join(","))
}

async fn run_one(
    registry: &ToolRegistry,
    confirmer: &Arc<dyn Confirmer>,
    call: &ToolCall,
    ctx: &ToolContext,
    timeout: Duration,
    auto_confirm: bool,
    already_allowed: bool,
) -> (ToolResult, bool) {
    let Some(tool) = registry.get(&call.name) else {
        return (
            ToolResult::err(&call.call_id, format!("ToolNotFound: {}", call.name)),
            false,
        );
    };

    let mut allow_session = false;
    if tool.requires_confirmation() && !auto_confirm && !already_allowed {
        let req = ConfirmRequest {
            session_id: ctx.session_id.clone(),
            title: format!("Run {}?", call.name),
            message: serde_json::to_string_pretty(&call.arguments).unwrap_or_default(),
            actions: vec!["allow".into(), "deny".into(), "allow_session".into()],
        };
        match confirmer.confirm(req).await {
            Ok(ConfirmAction::Allow) => {}
            Ok(ConfirmAction::AllowSession) => allow_session = true,
            Ok(ConfirmAction::Deny) => {
                return (
                    ToolResult::err(&call.call_id, "denied by user"),
                    false,
                );
            }
            Err(e) => {
                return (
                    ToolResult::err(&call.call_id, format!("confirmation failed: {e}")),
                    false,
                );
            }
        }
    }

    debug!(call_id = %call.call_id, tool = %call.name, "executing tool");
    // Panics are caught at the tool boundary, so the caller always reaches
    // its paired ExecutionEnd send.
    let exec = AssertUnwindSafe(tool.execute(call, ctx)).catch_unwind();
    let result = match tokio::time::timeout(timeout, exec).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            warn!(call_id = %call.call_id, tool = %call.name, "tool panicked");
            ToolResult::err(
                &call.call_id,
                format!("tool execution panicked: {}", panic_text(panic.as_ref())),
            )
        }
        Err(_) => ToolResult::err(
            &call.call_id,
            format!("timed out after {}s", timeout.as_secs()),
        ),
    };
    (result, allow_session)
}

/// Best-effort rendering of a caught panic payload.
fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
