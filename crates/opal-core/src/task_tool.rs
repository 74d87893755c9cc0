// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent spawning.
//!
//! The `task` tool runs a nested session with its own store, registry and
//! bus.  Every event the sub-agent publishes is re-published on the parent
//! session's bus as `sub_agent_event`, tagged with the sub-session id and
//! the parent `call_id`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use opal_config::Config;
use opal_model::Provider;
use opal_store::MessageStore;
use opal_tools::{
    builtin_registry, Confirmer, Tool, ToolCall, ToolContext, ToolResult, ToolRunner,
};

use crate::{Agent, AgentCommand, AgentEvent, EventBus};

const MAX_DEPTH: usize = 3;

pub struct TaskTool {
    provider: Arc<dyn Provider>,
    config: Arc<Config>,
    parent_bus: EventBus,
    confirmer: Arc<dyn Confirmer>,
    depth: Arc<AtomicUsize>,
}

impl TaskTool {
    pub fn new(
        provider: Arc<dyn Provider>,
        config: Arc<Config>,
        parent_bus: EventBus,
        confirmer: Arc<dyn Confirmer>,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            provider,
            config,
            parent_bus,
            confirmer,
            depth,
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text \
         output. The sub-agent gets the standard tool set but cannot spawn \
         further tasks beyond a bounded depth."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(prompt) = call.arguments.get("prompt").and_then(Value::as_str) else {
            return ToolResult::err(&call.call_id, "missing 'prompt'");
        };

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolResult::err(
                &call.call_id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }
        self.depth.fetch_add(1, Ordering::Relaxed);

        let sub_id = uuid::Uuid::new_v4().to_string();
        debug!(sub_session = %sub_id, call_id = %call.call_id, "spawning sub-agent");

        let store = Arc::new(Mutex::new(MessageStore::new(sub_id.clone())));
        let registry = Arc::new(builtin_registry(&self.config.tools.disabled));
        let runner = Arc::new(ToolRunner::new(
            Arc::clone(&registry),
            Arc::clone(&self.confirmer),
            std::time::Duration::from_secs(self.config.tools.timeout_secs),
            self.config.tools.auto_confirm,
        ));
        let bus = EventBus::new();
        let sub_ctx = Arc::new(ToolContext {
            working_dir: ctx.working_dir.clone(),
            session_id: sub_id.clone(),
            config: ctx.config.clone(),
            question_handler: ctx.question_handler.clone(),
        });

        // Forward every sub-agent event onto the parent bus.
        let mut forward_sub = bus.subscribe();
        let parent_bus = self.parent_bus.clone();
        let fwd_session = sub_id.clone();
        let fwd_call = call.call_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(rec) = forward_sub.next().await {
                let terminal = rec.event.is_terminal();
                parent_bus.publish(AgentEvent::SubAgentEvent {
                    session_id: fwd_session.clone(),
                    call_id: fwd_call.clone(),
                    event: Box::new(rec.event),
                });
                if terminal {
                    break;
                }
            }
        });

        // Collect the sub-agent's streamed text for the tool result.
        let mut collect_sub = bus.subscribe();
        let agent = Agent::new(
            store,
            Arc::clone(&self.provider),
            registry.as_ref(),
            runner,
            bus,
            Arc::clone(&self.config),
            sub_ctx,
            None,
        );
        let (tx, rx) = mpsc::channel(16);
        let loop_task = tokio::spawn(agent.run(rx));
        let _ = tx.send(AgentCommand::Prompt(prompt.to_string())).await;

        let mut output = String::new();
        let mut failed: Option<String> = None;
        while let Some(rec) = collect_sub.next().await {
            match rec.event {
                AgentEvent::MessageDelta { text } => output.push_str(&text),
                AgentEvent::Error { reason } => {
                    failed = Some(reason);
                    break;
                }
                ev if ev.is_terminal() => break,
                _ => {}
            }
        }

        let _ = tx.send(AgentCommand::Shutdown).await;
        let _ = loop_task.await;
        let _ = forwarder.await;
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match failed {
            Some(reason) => ToolResult::err(&call.call_id, format!("sub-agent error: {reason}")),
            None if output.is_empty() => {
                ToolResult::ok(&call.call_id, "(sub-agent produced no text output)")
            }
            None => ToolResult::ok(&call.call_id, output),
        }
    }
}
