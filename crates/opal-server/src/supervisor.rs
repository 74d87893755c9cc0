// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session supervision.
//!
//! One task per session owns the agent loop; this module owns the registry
//! mapping session ids to command-channel senders.  Restart policy is
//! rest_for_one: when an agent task panics, its tool runner and registry are
//! rebuilt from scratch while the message store (the leaf) survives, so the
//! replacement agent recovers the conversation and repairs orphans.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use opal_config::{Config, ModelConfig};
use opal_core::{Agent, AgentCommand, EventBus, TaskTool};
use opal_model::{build_provider, Error, Result};
use opal_store::MessageStore;
use opal_tools::{builtin_registry, Confirmer, QuestionHandler, ToolContext, ToolRunner};

use crate::{discover, AuthStore, Discovered};

#[derive(Debug, Default, Clone)]
pub struct StartParams {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Restrict the registry to these tool names when present.
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub title: Option<String>,
    pub modified: DateTime<Utc>,
}

/// Everything needed to (re)build one session's agent incarnation.
struct SessionBuilder {
    session_id: String,
    config: Arc<Config>,
    sessions_dir: PathBuf,
    store: Arc<Mutex<MessageStore>>,
    bus: EventBus,
    working_dir: PathBuf,
    confirmer: Arc<dyn Confirmer>,
    question_handler: Option<Arc<dyn QuestionHandler>>,
    model_cfg: Arc<Mutex<ModelConfig>>,
    auth: Arc<AuthStore>,
    tools_filter: Option<Vec<String>>,
    system_prompt: Option<String>,
    context_files: Vec<String>,
    sub_agent_depth: Arc<AtomicUsize>,
}

impl SessionBuilder {
    fn build(&self) -> Result<Agent> {
        let model_cfg = self.model_cfg.lock().unwrap().clone();
        let provider = build_provider(&model_cfg, self.auth.key_for(&model_cfg.provider))?;

        let mut registry = builtin_registry(&self.config.tools.disabled);
        registry.register(TaskTool::new(
            Arc::clone(&provider),
            Arc::clone(&self.config),
            self.bus.clone(),
            Arc::clone(&self.confirmer),
            Arc::clone(&self.sub_agent_depth),
        ));
        if let Some(allowed) = &self.tools_filter {
            for name in registry.names() {
                if !allowed.contains(&name) {
                    registry.remove(&name);
                }
            }
        }
        let registry = Arc::new(registry);

        let runner = Arc::new(ToolRunner::new(
            Arc::clone(&registry),
            Arc::clone(&self.confirmer),
            std::time::Duration::from_secs(self.config.tools.timeout_secs),
            self.config.tools.auto_confirm,
        ));
        let tool_ctx = Arc::new(ToolContext {
            working_dir: self.working_dir.clone(),
            session_id: self.session_id.clone(),
            config: Arc::clone(&self.config),
            question_handler: self.question_handler.clone(),
        });

        // Session-level overrides layered onto the shared config.
        let mut session_config = (*self.config).clone();
        session_config.model = model_cfg;
        if self.system_prompt.is_some() {
            session_config.agent.system_prompt = self.system_prompt.clone();
        }

        let mut agent = Agent::new(
            Arc::clone(&self.store),
            provider,
            registry.as_ref(),
            runner,
            self.bus.clone(),
            Arc::new(session_config),
            tool_ctx,
            Some(self.sessions_dir.clone()),
        );
        agent.set_context_files(self.context_files.clone());
        Ok(agent)
    }
}

pub struct SessionHandle {
    pub session_id: String,
    pub bus: EventBus,
    pub store: Arc<Mutex<MessageStore>>,
    pub working_dir: PathBuf,
    pub discovered: Discovered,
    pub model_cfg: Arc<Mutex<ModelConfig>>,
    /// Per-session runtime config overrides (`opal/config/set`).
    pub runtime_overrides: Mutex<serde_json::Value>,
    cmd_tx: RwLock<mpsc::Sender<AgentCommand>>,
}

impl SessionHandle {
    /// Send a command to the current agent incarnation.
    pub async fn send(&self, cmd: AgentCommand) -> Result<()> {
        let tx = self.cmd_tx.read().unwrap().clone();
        tx.send(cmd).await.map_err(|_| Error::ClientClosed)
    }

    pub fn model_spec(&self) -> String {
        let cfg = self.model_cfg.lock().unwrap();
        format!("{}/{}", cfg.provider, cfg.name)
    }
}

pub struct SessionSupervisor {
    config: Arc<Config>,
    data_dir: PathBuf,
    auth: Arc<AuthStore>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionSupervisor {
    pub fn new(config: Arc<Config>, data_dir: PathBuf, auth: Arc<AuthStore>) -> Self {
        Self {
            config,
            data_dir,
            auth,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Start (or resume) a session and spawn its supervised agent task.
    ///
    /// Returns the handle and whether it was newly created; an already-live
    /// session id returns the existing handle.
    pub fn start_session(
        &self,
        mut params: StartParams,
        confirmer: Arc<dyn Confirmer>,
        question_handler: Option<Arc<dyn QuestionHandler>>,
    ) -> Result<(Arc<SessionHandle>, bool)> {
        let session_id = params
            .session_id
            .take()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Ok(existing) = self.get(&session_id) {
            return Ok((existing, false));
        }

        let sessions_dir = self.sessions_dir();
        let session_file = sessions_dir.join(format!("{session_id}.jsonl"));
        let store = if session_file.is_file() {
            let store = MessageStore::load(&session_file)?;
            info!(session = %session_id, messages = store.len(), "resumed session from disk");
            store
        } else {
            MessageStore::new(session_id.clone())
        };

        let working_dir = resolve_working_dir(params.working_dir.take());
        let discovered = discover(&working_dir);

        let mut model_cfg = self.config.model.clone();
        if let Some(spec) = &params.model {
            model_cfg = model_cfg.with_spec(spec);
        }
        let model_cfg = Arc::new(Mutex::new(model_cfg));

        let bus = EventBus::new();
        let store = Arc::new(Mutex::new(store));
        let builder = SessionBuilder {
            session_id: session_id.clone(),
            config: Arc::clone(&self.config),
            sessions_dir,
            store: Arc::clone(&store),
            bus: bus.clone(),
            working_dir: working_dir.clone(),
            confirmer,
            question_handler,
            model_cfg: Arc::clone(&model_cfg),
            auth: Arc::clone(&self.auth),
            tools_filter: params.tools.take(),
            system_prompt: params.system_prompt.take(),
            context_files: discovered.context_files.clone(),
            sub_agent_depth: Arc::new(AtomicUsize::new(0)),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handle = Arc::new(SessionHandle {
            session_id: session_id.clone(),
            bus,
            store,
            working_dir,
            discovered,
            model_cfg,
            runtime_overrides: Mutex::new(serde_json::json!({})),
            cmd_tx: RwLock::new(cmd_tx),
        });

        supervise(builder, Arc::clone(&handle), cmd_rx);
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, Arc::clone(&handle));
        Ok((handle, true))
    }

    /// Sessions known on disk plus any live ones not yet persisted.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: HashMap<String, SessionInfo> = HashMap::new();

        if let Ok(entries) = std::fs::read_dir(self.sessions_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let title = peek_header(&path)
                    .ok()
                    .and_then(|h| h.metadata["title"].as_str().map(str::to_string));
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                infos.insert(
                    id.to_string(),
                    SessionInfo {
                        id: id.to_string(),
                        title,
                        modified,
                    },
                );
            }
        }

        for (id, handle) in self.sessions.lock().unwrap().iter() {
            infos.entry(id.clone()).or_insert_with(|| SessionInfo {
                id: id.clone(),
                title: handle.store.lock().unwrap().title().map(str::to_string),
                modified: Utc::now(),
            });
        }

        let mut list: Vec<SessionInfo> = infos.into_values().collect();
        list.sort_by(|a, b| b.modified.cmp(&a.modified));
        list
    }

    /// Delete a session's persisted file and stop its agent if live.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        if let Some(handle) = self.sessions.lock().unwrap().remove(session_id) {
            let _ = handle.send(AgentCommand::Shutdown).await;
        }
        let file = self.sessions_dir().join(format!("{session_id}.jsonl"));
        if file.is_file() {
            std::fs::remove_file(&file)?;
            Ok(())
        } else {
            Err(Error::NotFound(format!("session {session_id}")))
        }
    }

    pub async fn shutdown_all(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for handle in handles {
            let _ = handle.send(AgentCommand::Shutdown).await;
        }
    }
}

/// Run the session's agent, rebuilding it after a panic.  The store lives in
/// the builder and survives every incarnation.
fn supervise(builder: SessionBuilder, handle: Arc<SessionHandle>, first_rx: mpsc::Receiver<AgentCommand>) {
    tokio::spawn(async move {
        let mut rx = first_rx;
        loop {
            let agent = match builder.build() {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(session = %builder.session_id, "cannot build agent: {e}");
                    builder.bus.publish(opal_core::AgentEvent::Error {
                        reason: format!("session failed to start: {e}"),
                    });
                    break;
                }
            };
            let task = tokio::spawn(agent.run(rx));
            match task.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    warn!(
                        session = %builder.session_id,
                        "agent loop crashed; restarting with surviving store"
                    );
                    let (tx, new_rx) = mpsc::channel(64);
                    *handle.cmd_tx.write().unwrap() = tx;
                    rx = new_rx;
                }
                Err(_) => break,
            }
        }
    });
}

/// Working directory precedence: explicit param, then `OPAL_CWD`, then
/// `INIT_CWD`, then the process cwd.
pub fn resolve_working_dir(param: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = param {
        return dir;
    }
    for var in ["OPAL_CWD", "INIT_CWD"] {
        if let Ok(dir) = std::env::var(var) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Read just the header line of a persisted session file.
pub fn peek_header(path: &Path) -> Result<opal_store::SessionHeader> {
    use std::io::{BufRead, BufReader};
    let file = std::fs::File::open(path)?;
    let line = BufReader::new(file)
        .lines()
        .next()
        .ok_or_else(|| Error::CorruptHeader("empty file".into()))??;
    serde_json::from_str(&line).map_err(|e| Error::CorruptHeader(e.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
