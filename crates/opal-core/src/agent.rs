// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-session agent loop.
//!
//! A single task owns the [`Agent`] and serializes every mutation of the
//! conversation tree and runtime state.  The loop drives provider stream
//! segments, dispatches tool batches, honors steer/abort mid-turn, retries
//! transient provider failures with backoff, and repairs orphaned tool calls
//! before every new user message.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use opal_config::Config;
use opal_model::{
    backoff_delay, Message, Provider, Result, Role, StopReason, StreamEvent, StreamOptions,
    ToolCallSpec, Usage,
};
use opal_store::MessageStore;
use opal_tools::{RunnerEvent, ToolCall, ToolContext, ToolRegistry, ToolRunner};

use crate::{
    compact::{compact_path, CompactOptions},
    default_system_prompt, AgentEvent, AgentState, AgentStatus, EventBus, StateSnapshot,
    TokenEstimator,
};

/// Commands accepted by a session's agent task.
pub enum AgentCommand {
    Prompt(String),
    /// Queued when a turn is running; identical to `Prompt` when idle.
    Steer(String),
    Abort,
    Compact {
        options: CompactOptions,
        reply: oneshot::Sender<Result<CompactReport>>,
    },
    Branch {
        entry_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetProvider {
        provider: Arc<dyn Provider>,
        reply: oneshot::Sender<()>,
    },
    SetThinking {
        level: String,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<StateSnapshot>,
    },
    Save {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CompactReport {
    pub removed: usize,
    pub summary_id: Option<String>,
}

/// Outcome of one provider stream segment.
enum SegmentEnd {
    Completed {
        content: Option<String>,
        thinking: Option<String>,
        calls: Vec<ToolCallSpec>,
        stop: StopReason,
    },
    Aborted,
    Failed(opal_model::Error),
}

pub struct Agent {
    state: AgentState,
    store: Arc<Mutex<MessageStore>>,
    provider: Arc<dyn Provider>,
    runner: Arc<ToolRunner>,
    bus: EventBus,
    config: Arc<Config>,
    estimator: TokenEstimator,
    tool_ctx: Arc<ToolContext>,
    /// Sessions persist here after each turn; `None` disables persistence
    /// (sub-agents).
    persist_dir: Option<PathBuf>,
    thinking_level: Option<String>,
    /// Set when the store survived a restart; triggers eager orphan repair
    /// and an `agent_recovered` event before the first command.
    recovered: bool,
    /// Set by a `Shutdown` that arrived mid-turn; ends the command loop once
    /// the abort completes.
    shutdown_requested: bool,
    context_files: Vec<String>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Mutex<MessageStore>>,
        provider: Arc<dyn Provider>,
        tools: &ToolRegistry,
        runner: Arc<ToolRunner>,
        bus: EventBus,
        config: Arc<Config>,
        tool_ctx: Arc<ToolContext>,
        persist_dir: Option<PathBuf>,
    ) -> Self {
        let (session_id, recovered) = {
            let s = store.lock().unwrap();
            (s.session_id().to_string(), !s.is_empty())
        };
        let mut state = AgentState::new(
            session_id,
            provider.name(),
            provider.model(),
            tools.schemas(),
            tool_ctx.working_dir.clone(),
        );
        state.disabled_tools = config.tools.disabled.clone();
        let thinking_level = config.model.thinking_level.clone();
        Self {
            state,
            store,
            provider,
            runner,
            bus,
            config,
            estimator: TokenEstimator::new(),
            tool_ctx,
            persist_dir,
            thinking_level,
            recovered,
            shutdown_requested: false,
            context_files: Vec::new(),
        }
    }

    /// Context files reported to the model in the system prompt.
    pub fn set_context_files(&mut self, files: Vec<String>) {
        self.context_files = files;
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Run the command loop until `Shutdown` or channel close.
    pub async fn run(mut self, mut rx: mpsc::Receiver<AgentCommand>) {
        if self.recovered {
            let repaired = self.repair_orphans();
            if repaired > 0 {
                info!(repaired, session = %self.state.session_id, "repaired orphaned tool calls");
            }
            self.bus.publish(AgentEvent::AgentRecovered);
            self.state.status = AgentStatus::Idle;
        }

        while let Some(cmd) = rx.recv().await {
            match cmd {
                AgentCommand::Prompt(text) | AgentCommand::Steer(text) => {
                    if self.state.status == AgentStatus::Error {
                        self.bus.publish(AgentEvent::Error {
                            reason: format!(
                                "session is in error state ({}); compact the session or \
                                 switch models before prompting again",
                                self.state.last_error.as_deref().unwrap_or("unknown")
                            ),
                        });
                        continue;
                    }
                    self.run_turn(text, &mut rx).await;
                    // Steers that arrived too late for the finished turn open
                    // a fresh one, so no user message is silently parked.
                    while self.state.status == AgentStatus::Idle
                        && !self.shutdown_requested
                    {
                        let Some(queued) = self.state.pending_steers.pop_front() else {
                            break;
                        };
                        self.run_turn(queued, &mut rx).await;
                    }
                    if self.shutdown_requested {
                        break;
                    }
                }
                AgentCommand::Abort => {
                    // Nothing in flight; abort is idempotent.
                }
                AgentCommand::Compact { options, reply } => {
                    let result = self.compact(&options).await;
                    if result.is_ok() && self.state.status == AgentStatus::Error {
                        self.state.status = AgentStatus::Idle;
                        self.state.last_error = None;
                    }
                    let _ = reply.send(result);
                }
                AgentCommand::Branch { entry_id, reply } => {
                    let result = self.store.lock().unwrap().branch(&entry_id);
                    let _ = reply.send(result);
                }
                AgentCommand::SetProvider { provider, reply } => {
                    self.state.provider = provider.name().to_string();
                    self.state.model = provider.model().to_string();
                    self.provider = provider;
                    if self.state.status == AgentStatus::Error {
                        self.state.status = AgentStatus::Idle;
                        self.state.last_error = None;
                    }
                    let _ = reply.send(());
                }
                AgentCommand::SetThinking { level, reply } => {
                    self.thinking_level = Some(level);
                    let _ = reply.send(());
                }
                AgentCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                AgentCommand::Save { reply } => {
                    let _ = reply.send(self.save());
                }
                AgentCommand::Shutdown => break,
            }
        }
        debug!(session = %self.state.session_id, "agent loop stopped");
    }

    fn snapshot(&self) -> StateSnapshot {
        let (message_count, path) = {
            let s = self.store.lock().unwrap();
            (s.len(), s.path())
        };
        StateSnapshot {
            session_id: self.state.session_id.clone(),
            status: self.state.status,
            model: format!("{}/{}", self.state.provider, self.state.model),
            message_count,
            tools: self.state.tools.iter().map(|t| t.name.clone()).collect(),
            token_usage: self.state.token_usage,
            context_tokens: self.estimator.hybrid_estimate(&path) as u64,
        }
    }

    fn save(&self) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        self.store.lock().unwrap().save(dir)?;
        Ok(())
    }

    // ── Turn procedure ────────────────────────────────────────────────────────

    async fn run_turn(&mut self, text: String, rx: &mut mpsc::Receiver<AgentCommand>) {
        self.bus.publish(AgentEvent::AgentStart);
        self.state.status = AgentStatus::Streaming;

        // Synthetic results for any dangling tool calls go in before the new
        // user message so the path is well-formed for the provider.
        self.repair_orphans();

        // Steers queued from an earlier turn precede the new prompt.
        self.append_pending_steers();
        self.append(Message::user(text));

        let mut attempt: u32 = 0;
        let turn_usage = loop {
            // Steers received mid-turn land immediately before the next call.
            self.append_pending_steers();

            match self.stream_segment(rx).await {
                SegmentEnd::Aborted => {
                    self.finish_abort();
                    return;
                }
                SegmentEnd::Failed(err) => {
                    attempt += 1;
                    if err.is_transient() && attempt < self.config.agent.max_retries {
                        self.state.status = AgentStatus::Retrying;
                        self.bus.publish(AgentEvent::StatusUpdate {
                            status: format!("retrying (attempt {attempt}): {err}"),
                        });
                        let delay = backoff_delay(
                            attempt,
                            self.config.agent.retry_base_ms,
                            self.config.agent.retry_max_ms,
                        );
                        if !self.interruptible_sleep(delay, rx).await {
                            self.finish_abort();
                            return;
                        }
                        self.state.status = AgentStatus::Streaming;
                        continue;
                    }
                    self.fail_turn(err.to_string());
                    return;
                }
                SegmentEnd::Completed {
                    content,
                    thinking,
                    calls,
                    stop,
                } => {
                    // A delivered segment resets the retry counter.
                    attempt = 0;

                    let has_calls = !calls.is_empty() && stop == StopReason::ToolCalls;
                    if content.is_some() || thinking.is_some() || !calls.is_empty() {
                        self.append(Message::assistant_turn(content, thinking, calls.clone()));
                    }

                    if !has_calls {
                        self.bus.publish(AgentEvent::TurnEnd);
                        break self.state.token_usage;
                    }

                    self.state.status = AgentStatus::WaitingTools;
                    let aborted = self.run_tool_phase(&calls, rx).await;
                    if aborted {
                        self.finish_abort();
                        return;
                    }
                    self.bus.publish(AgentEvent::TurnEnd);
                    self.state.status = AgentStatus::Streaming;
                }
            }
        };

        // Persist before the terminal event so a client reacting to
        // agent_end always observes the saved state.
        if self.config.agent.persist_sessions {
            self.auto_title();
            if let Err(e) = self.save() {
                warn!(session = %self.state.session_id, "auto-save failed: {e}");
            }
        }

        self.bus.publish(AgentEvent::AgentEnd { usage: turn_usage });
        self.state.status = AgentStatus::Idle;
    }

    /// One provider stream segment: open the stream and interleave its events
    /// with incoming commands until `response_done`, abort, or failure.
    async fn stream_segment(&mut self, rx: &mut mpsc::Receiver<AgentCommand>) -> SegmentEnd {
        let path = self.store.lock().unwrap().path();
        let path_len = path.len();
        let opts = StreamOptions {
            system: Some(self.system_prompt()),
            max_tokens: None,
            thinking_level: self.thinking_level.clone(),
        };
        let schemas = self.state.tools.clone();

        let mut ps = match self.provider.stream(&path, &schemas, &opts).await {
            Ok(ps) => ps,
            Err(e) => return SegmentEnd::Failed(e),
        };

        let mut content = String::new();
        let mut thinking = String::new();
        let mut message_started = false;
        let mut thinking_started = false;
        let mut assembly = CallAssembly::default();
        let mut stop: Option<StopReason> = None;

        loop {
            tokio::select! {
                ev = ps.events.next() => match ev {
                    None => break,
                    Some(Err(e)) => {
                        ps.cancel.cancel();
                        return SegmentEnd::Failed(e);
                    }
                    Some(Ok(event)) => match event {
                        StreamEvent::TextStart { .. } => {
                            if !message_started {
                                message_started = true;
                                self.bus.publish(AgentEvent::MessageStart);
                            }
                        }
                        StreamEvent::TextDelta { text } if !text.is_empty() => {
                            if !message_started {
                                message_started = true;
                                self.bus.publish(AgentEvent::MessageStart);
                            }
                            content.push_str(&text);
                            self.bus.publish(AgentEvent::MessageDelta { text });
                        }
                        StreamEvent::TextDelta { .. } => {}
                        StreamEvent::TextDone { text } => {
                            if content.is_empty() {
                                content = text;
                            }
                        }
                        StreamEvent::ThinkingStart { .. } => {
                            if !thinking_started {
                                thinking_started = true;
                                self.bus.publish(AgentEvent::ThinkingStart);
                            }
                        }
                        StreamEvent::ThinkingDelta { text } if !text.is_empty() => {
                            if !thinking_started {
                                thinking_started = true;
                                self.bus.publish(AgentEvent::ThinkingStart);
                            }
                            thinking.push_str(&text);
                            self.bus.publish(AgentEvent::ThinkingDelta { text });
                        }
                        StreamEvent::ThinkingDelta { .. } => {}
                        StreamEvent::ToolCallStart { call_id, name, call_index } => {
                            assembly.start(call_id, name, call_index);
                        }
                        StreamEvent::ToolCallDelta { call_id, call_index, delta } => {
                            assembly.delta(call_id, call_index, &delta);
                        }
                        StreamEvent::ToolCallDone { call_id, name, arguments } => {
                            assembly.done(call_id, name, arguments);
                        }
                        StreamEvent::Usage { usage } => {
                            self.record_usage(&usage, path_len);
                        }
                        StreamEvent::ResponseDone { usage, stop_reason } => {
                            self.record_usage(&usage, path_len);
                            stop = Some(stop_reason);
                            break;
                        }
                        StreamEvent::Error { payload } => {
                            ps.cancel.cancel();
                            let err = match opal_model::classify(&payload) {
                                opal_model::ErrorClass::Transient =>
                                    opal_model::Error::ProviderTransient(payload),
                                opal_model::ErrorClass::Permanent =>
                                    opal_model::Error::ProviderPermanent(payload),
                            };
                            return SegmentEnd::Failed(err);
                        }
                    }
                },
                Some(cmd) = rx.recv() => {
                    if self.handle_mid_turn_command(cmd) {
                        ps.cancel.cancel();
                        return SegmentEnd::Aborted;
                    }
                }
            }
        }

        let calls = assembly.finish();
        // Streams that end without response_done (connection close after the
        // last event) infer the stop reason from what was collected.
        let stop = stop.unwrap_or(if calls.is_empty() {
            StopReason::Stop
        } else {
            StopReason::ToolCalls
        });

        SegmentEnd::Completed {
            content: (!content.is_empty()).then_some(content),
            thinking: (!thinking.is_empty()).then_some(thinking),
            calls,
            stop,
        }
    }

    /// Dispatch the segment's tool calls and pump runner events to the bus
    /// while staying responsive to abort/steer.  Returns true when aborted.
    async fn run_tool_phase(
        &mut self,
        specs: &[ToolCallSpec],
        rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> bool {
        let calls: Vec<ToolCall> = specs
            .iter()
            .map(|tc| ToolCall {
                call_id: tc.call_id.clone(),
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            })
            .collect();

        let (ev_tx, mut ev_rx) = mpsc::channel::<RunnerEvent>(64);
        let runner = Arc::clone(&self.runner);
        let ctx = Arc::clone(&self.tool_ctx);
        let batch_calls = calls.clone();
        let mut batch =
            tokio::spawn(async move { runner.execute_batch(&batch_calls, ctx, ev_tx).await });

        let mut aborted = false;
        let results = loop {
            tokio::select! {
                res = &mut batch => {
                    break match res {
                        Ok(results) => results,
                        Err(e) => {
                            warn!("tool batch task failed: {e}");
                            calls
                                .iter()
                                .map(|c| opal_tools::ToolResult::err(&c.call_id, "Aborted"))
                                .collect()
                        }
                    };
                }
                Some(ev) = ev_rx.recv() => {
                    self.forward_runner_event(ev);
                }
                Some(cmd) = rx.recv() => {
                    if self.handle_mid_turn_command(cmd) {
                        self.state.status = AgentStatus::Aborting;
                        self.runner.cancel_all();
                        aborted = true;
                        // Keep looping: the batch still returns its (now
                        // aborted) results and the end events still pair up.
                    }
                }
            }
        };

        // Flush any execution events still buffered.
        while let Ok(ev) = ev_rx.try_recv() {
            self.forward_runner_event(ev);
        }

        // Results append in call order whether or not they were aborted, so
        // every tool_call has its tool_result on the path.
        for r in &results {
            self.append(Message::tool_result(&r.call_id, &r.content, r.is_error));
        }

        aborted
    }

    fn forward_runner_event(&self, ev: RunnerEvent) {
        match ev {
            RunnerEvent::ExecutionStart { call_id, name } => {
                self.bus
                    .publish(AgentEvent::ToolExecutionStart { call_id, name });
            }
            RunnerEvent::ExecutionEnd {
                call_id,
                name,
                output,
                is_error,
            } => {
                self.bus.publish(AgentEvent::ToolExecutionEnd {
                    call_id,
                    name,
                    output,
                    is_error,
                });
            }
        }
    }

    /// Handle a command that arrived while a turn is running.  Returns true
    /// when the turn must abort.
    fn handle_mid_turn_command(&mut self, cmd: AgentCommand) -> bool {
        match cmd {
            AgentCommand::Abort => true,
            AgentCommand::Shutdown => {
                self.shutdown_requested = true;
                true
            }
            AgentCommand::Prompt(text) | AgentCommand::Steer(text) => {
                self.state.pending_steers.push_back(text);
                false
            }
            AgentCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                false
            }
            AgentCommand::Save { reply } => {
                let _ = reply.send(self.save());
                false
            }
            AgentCommand::Compact { reply, .. } => {
                let _ = reply.send(Err(opal_model::Error::InvalidParams(
                    "session is mid-turn; retry when idle".into(),
                )));
                false
            }
            AgentCommand::Branch { reply, .. } => {
                let _ = reply.send(Err(opal_model::Error::InvalidParams(
                    "session is mid-turn; retry when idle".into(),
                )));
                false
            }
            AgentCommand::SetProvider { reply, .. } => {
                let _ = reply.send(());
                false
            }
            AgentCommand::SetThinking { level, reply } => {
                self.thinking_level = Some(level);
                let _ = reply.send(());
                false
            }
        }
    }

    /// Sleep that honors abort/steer.  Returns false when aborted.
    async fn interruptible_sleep(
        &mut self,
        delay: std::time::Duration,
        rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                Some(cmd) = rx.recv() => {
                    if self.handle_mid_turn_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    fn finish_abort(&mut self) {
        // Orphans left by the aborted segment get their synthetic results on
        // the next turn; partial assistant content is dropped here.
        self.bus.publish(AgentEvent::AgentAbort);
        self.state.status = AgentStatus::Idle;
    }

    fn fail_turn(&mut self, reason: String) {
        warn!(session = %self.state.session_id, "turn failed: {reason}");
        self.bus.publish(AgentEvent::Error {
            reason: reason.clone(),
        });
        self.state.last_error = Some(reason);
        self.state.status = AgentStatus::Error;
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn append(&self, msg: Message) -> Message {
        self.store.lock().unwrap().append(msg)
    }

    fn append_pending_steers(&mut self) {
        while let Some(steer) = self.state.pending_steers.pop_front() {
            self.append(Message::user(steer));
        }
    }

    /// Append a synthetic `"Aborted"` result for every tool call on the path
    /// that has none.  Idempotent: repaired paths scan clean.
    fn repair_orphans(&mut self) -> usize {
        let path = self.store.lock().unwrap().path();
        let mut have_results: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for m in &path {
            if m.role == Role::ToolResult {
                if let Some(id) = m.call_id.as_deref() {
                    have_results.insert(id);
                }
            }
        }
        let orphans: Vec<String> = path
            .iter()
            .flat_map(|m| m.tool_call_specs())
            .filter(|tc| !have_results.contains(tc.call_id.as_str()))
            .map(|tc| tc.call_id.clone())
            .collect();
        for call_id in &orphans {
            self.append(Message::tool_result(call_id, "Aborted", true));
        }
        orphans.len()
    }

    fn record_usage(&mut self, usage: &Usage, path_len: usize) {
        if usage.input_tokens > 0 {
            self.estimator.record_report(usage.input_tokens, path_len);
        }
        self.state.token_usage.merge(usage);
        let context_tokens = {
            let path = self.store.lock().unwrap().path();
            self.estimator.hybrid_estimate(&path) as u64
        };
        self.bus.publish(AgentEvent::UsageUpdate {
            usage: *usage,
            context_tokens,
        });
    }

    fn system_prompt(&self) -> String {
        self.config.agent.system_prompt.clone().unwrap_or_else(|| {
            default_system_prompt(
                &self.state.working_dir.display().to_string(),
                &self.context_files,
            )
        })
    }

    async fn compact(&mut self, options: &CompactOptions) -> Result<CompactReport> {
        let path = self.store.lock().unwrap().path();
        let provider: Option<&dyn Provider> = Some(self.provider.as_ref());
        match compact_path(&path, provider, options).await {
            Some((ids, summary)) => {
                let removed = ids.len();
                let summary = self
                    .store
                    .lock()
                    .unwrap()
                    .replace_path_segment(&ids, summary)?;
                // The old prompt-token report no longer describes the path.
                self.estimator.reset();
                self.bus.publish(AgentEvent::StatusUpdate {
                    status: format!("compacted {removed} messages"),
                });
                if let Err(e) = self.save() {
                    warn!("save after compaction failed: {e}");
                }
                Ok(CompactReport {
                    removed,
                    summary_id: Some(summary.id),
                })
            }
            None => Ok(CompactReport {
                removed: 0,
                summary_id: None,
            }),
        }
    }

    fn auto_title(&self) {
        if !self.config.agent.auto_title {
            return;
        }
        let mut store = self.store.lock().unwrap();
        if store.title().is_some() {
            return;
        }
        let title = store
            .path()
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text().chars().take(60).collect::<String>());
        if let Some(title) = title {
            store.set_metadata_field("title", Value::String(title));
        }
    }
}

// ── Streaming tool-call assembly ──────────────────────────────────────────────

#[derive(Default)]
struct PendingCall {
    call_id: String,
    name: String,
    args_buf: String,
    parsed: Option<Value>,
}

/// Assembles interleaved tool-call stream events into ordered specs.  Calls
/// are keyed by provider index when present (OpenAI interleaves by index),
/// by call id otherwise.
#[derive(Default)]
struct CallAssembly {
    order: Vec<String>,
    calls: HashMap<String, PendingCall>,
}

impl CallAssembly {
    fn key(call_id: &Option<String>, call_index: Option<u32>) -> Option<String> {
        match (call_index, call_id) {
            (Some(i), _) => Some(format!("#{i}")),
            (None, Some(id)) if !id.is_empty() => Some(id.clone()),
            _ => None,
        }
    }

    fn entry(&mut self, key: String) -> &mut PendingCall {
        if !self.calls.contains_key(&key) {
            self.order.push(key.clone());
            self.calls.insert(key.clone(), PendingCall::default());
        }
        self.calls.get_mut(&key).unwrap()
    }

    fn start(&mut self, call_id: String, name: String, call_index: Option<u32>) {
        let key = Self::key(&Some(call_id.clone()), call_index)
            .unwrap_or_else(|| format!("@{}", self.order.len()));
        let pc = self.entry(key);
        if !call_id.is_empty() {
            pc.call_id = call_id;
        }
        if !name.is_empty() {
            pc.name = name;
        }
    }

    fn delta(&mut self, call_id: Option<String>, call_index: Option<u32>, delta: &str) {
        let key = match Self::key(&call_id, call_index) {
            Some(k) => k,
            // Untagged deltas extend the most recently started call.
            None => match self.order.last() {
                Some(k) => k.clone(),
                None => return,
            },
        };
        self.entry(key).args_buf.push_str(delta);
    }

    fn done(&mut self, call_id: String, name: String, arguments: Value) {
        let key = Self::key(&Some(call_id.clone()), None)
            .filter(|k| self.calls.contains_key(k))
            .or_else(|| self.order.last().cloned().filter(|k| {
                let pc = &self.calls[k];
                pc.parsed.is_none() && (pc.call_id.is_empty() || pc.call_id == call_id)
            }))
            .unwrap_or_else(|| format!("@{}", self.order.len()));
        let pc = self.entry(key);
        pc.call_id = call_id;
        pc.name = name;
        pc.parsed = Some(arguments);
    }

    fn finish(self) -> Vec<ToolCallSpec> {
        let mut specs = Vec::new();
        for (i, key) in self.order.iter().enumerate() {
            let pc = &self.calls[key];
            if pc.name.is_empty() {
                warn!(call_id = %pc.call_id, "dropping tool call with no name");
                continue;
            }
            let arguments = match &pc.parsed {
                Some(v) => v.clone(),
                None if pc.args_buf.is_empty() => Value::Object(Default::default()),
                // Malformed JSON keeps the raw text rather than being dropped.
                None => serde_json::from_str(&pc.args_buf)
                    .unwrap_or_else(|_| Value::String(pc.args_buf.clone())),
            };
            let call_id = if pc.call_id.is_empty() {
                warn!(tool = %pc.name, "tool call had no id; generating one");
                format!("call_synthetic_{i}")
            } else {
                pc.call_id.clone()
            };
            specs.push(ToolCallSpec {
                call_id,
                name: pc.name.clone(),
                arguments,
            });
        }
        specs
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
