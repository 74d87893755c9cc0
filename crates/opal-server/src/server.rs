// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Newline-delimited JSON-RPC 2.0 transport over a byte stream (stdio in
//! production, an in-memory duplex in tests).
//!
//! One task owns the writer.  `agent/event` notifications are batched on a
//! short timer and flushed immediately when a terminal event or a response
//! passes through.  Server→client requests (`client/confirm`,
//! `client/input`) use a pending map keyed by request id, mirrored by the
//! reader loop when the matching response line arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use opal_config::Config;
use opal_core::{AgentCommand, CompactOptions, CompactStrategy};
use opal_model::{build_provider, static_catalog, Error, Result};
use opal_tools::{ConfirmAction, ConfirmRequest, Confirmer, QuestionHandler};

use crate::{
    rpc::{self, normalize_keys, notification, response_err, response_ok, RpcError},
    AuthStore, SessionSupervisor, StartParams,
};

/// Batch window for non-terminal event notifications.
const BATCH_WINDOW: Duration = Duration::from_millis(32);
/// Flush regardless of the timer once this many events are buffered.
const MAX_BATCH: usize = 64;

enum Outbound {
    /// Responses and server→client requests bypass batching.
    Immediate(Value),
    Event {
        value: Value,
        terminal: bool,
    },
}

/// Server→client request plumbing.
struct ClientBridge {
    outbound: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    next_id: AtomicI64,
}

impl ClientBridge {
    fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.outbound
            .send(Outbound::Immediate(msg))
            .await
            .map_err(|_| Error::ClientClosed)?;

        let reply = rx
            .await
            .map_err(|_| Error::ConnectionLost("client closed before replying".into()))?;
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(Error::RpcServer {
                code: err["code"].as_i64().unwrap_or(rpc::ERR_INTERNAL),
                message: err["message"].as_str().unwrap_or("client error").into(),
                data: err.get("data").cloned(),
            });
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    fn complete(&self, id: &Value, msg: Value) {
        let key = match id.as_str() {
            Some(s) => s.to_string(),
            None => id.to_string(),
        };
        if let Some(tx) = self.pending.lock().unwrap().remove(&key) {
            let _ = tx.send(msg);
        } else {
            debug!(id = %key, "response with unknown id dropped");
        }
    }
}

/// Asks the user for tool authorization through `client/confirm`.
struct RpcConfirmer {
    bridge: Arc<ClientBridge>,
}

#[async_trait]
impl Confirmer for RpcConfirmer {
    async fn confirm(&self, req: ConfirmRequest) -> Result<ConfirmAction> {
        let result = self
            .bridge
            .request(
                "client/confirm",
                json!({
                    "session_id": req.session_id,
                    "title": req.title,
                    "message": req.message,
                    "actions": req.actions,
                }),
            )
            .await?;
        let action = result["action"].as_str().unwrap_or("deny");
        Ok(ConfirmAction::from_str(action).unwrap_or(ConfirmAction::Deny))
    }
}

/// Fetches free-text input through `client/input`.
struct RpcQuestionHandler {
    bridge: Arc<ClientBridge>,
    session_id: Mutex<String>,
}

#[async_trait]
impl QuestionHandler for RpcQuestionHandler {
    async fn ask(&self, prompt: &str, sensitive: bool) -> Result<String> {
        let session_id = self.session_id.lock().unwrap().clone();
        let result = self
            .bridge
            .request(
                "client/input",
                json!({ "session_id": session_id, "prompt": prompt, "sensitive": sensitive }),
            )
            .await?;
        Ok(result["text"].as_str().unwrap_or_default().to_string())
    }
}

struct ServerState {
    config: Arc<Config>,
    data_dir: PathBuf,
    supervisor: Arc<SessionSupervisor>,
    auth: Arc<AuthStore>,
    bridge: Arc<ClientBridge>,
    outbound: mpsc::Sender<Outbound>,
}

/// Run the RPC server over the given byte streams until EOF on `reader`.
pub async fn serve<R, W>(
    config: Arc<Config>,
    data_dir: PathBuf,
    reader: R,
    writer: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(256);
    tokio::spawn(write_loop(writer, out_rx));

    let auth = Arc::new(AuthStore::load(&data_dir));
    let supervisor = Arc::new(SessionSupervisor::new(
        Arc::clone(&config),
        data_dir.clone(),
        Arc::clone(&auth),
    ));
    let bridge = Arc::new(ClientBridge::new(out_tx.clone()));
    let state = Arc::new(ServerState {
        config,
        data_dir,
        supervisor,
        auth,
        bridge,
        outbound: out_tx,
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let err = RpcError::new(rpc::ERR_PARSE, format!("parse error: {e}"));
                let _ = state
                    .outbound
                    .send(Outbound::Immediate(response_err(&Value::Null, &err)))
                    .await;
                continue;
            }
        };
        route(Arc::clone(&state), msg).await;
    }

    info!("stdin closed; shutting down sessions");
    state.supervisor.shutdown_all().await;
    // Give the writer a moment to drain buffered notifications.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn route(state: Arc<ServerState>, msg: Value) {
    let id = msg.get("id").cloned().filter(|id| !id.is_null());
    let method = msg.get("method").and_then(Value::as_str).map(str::to_string);

    match (method, id) {
        (Some(method), Some(id)) => {
            let params = normalize_keys(msg.get("params").cloned().unwrap_or_else(|| json!({})));
            tokio::spawn(async move {
                let response = match dispatch(&state, &method, params).await {
                    Ok(result) => response_ok(&id, result),
                    Err(err) => response_err(&id, &err),
                };
                let _ = state.outbound.send(Outbound::Immediate(response)).await;
            });
        }
        (Some(method), None) => {
            debug!(method = %method, "notification ignored");
        }
        (None, Some(id)) => {
            // A response to one of our server→client requests.
            state.bridge.complete(&id, msg);
        }
        (None, None) => {
            let err = RpcError::new(rpc::ERR_INVALID_REQUEST, "neither request nor response");
            let _ = state
                .outbound
                .send(Outbound::Immediate(response_err(&Value::Null, &err)))
                .await;
        }
    }
}

// ── Writer / batcher ──────────────────────────────────────────────────────────

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Outbound>) {
    let mut batch: Vec<Value> = Vec::new();
    loop {
        if batch.is_empty() {
            match rx.recv().await {
                None => break,
                Some(out) => consume(out, &mut batch, &mut writer).await,
            }
        } else {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    None => {
                        flush(&mut writer, &mut batch).await;
                        break;
                    }
                    Some(out) => consume(out, &mut batch, &mut writer).await,
                },
                _ = tokio::time::sleep(BATCH_WINDOW) => {
                    flush(&mut writer, &mut batch).await;
                }
            }
        }
    }
    flush(&mut writer, &mut batch).await;
}

async fn consume<W: AsyncWrite + Unpin>(out: Outbound, batch: &mut Vec<Value>, writer: &mut W) {
    match out {
        Outbound::Immediate(value) => {
            flush(writer, batch).await;
            write_line(writer, &value).await;
        }
        Outbound::Event { value, terminal } => {
            batch.push(value);
            if terminal || batch.len() >= MAX_BATCH {
                flush(writer, batch).await;
            }
        }
    }
}

async fn flush<W: AsyncWrite + Unpin>(writer: &mut W, batch: &mut Vec<Value>) {
    for value in batch.drain(..) {
        write_line(writer, &value).await;
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) {
    let mut line = match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => {
            warn!("unserializable outbound message: {e}");
            return;
        }
    };
    line.push('\n');
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        warn!("write failed: {e}");
        return;
    }
    let _ = writer.flush().await;
}

// ── Method dispatch ───────────────────────────────────────────────────────────

fn str_param(params: &Value, key: &str) -> std::result::Result<String, RpcError> {
    params[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RpcError::invalid_params(format!("missing required param '{key}'")))
}

fn opt_str(params: &Value, key: &str) -> Option<String> {
    params[key].as_str().map(str::to_string)
}

async fn dispatch(
    state: &Arc<ServerState>,
    method: &str,
    params: Value,
) -> std::result::Result<Value, RpcError> {
    match method {
        "opal/ping" => Ok(json!({})),

        "session/start" => session_start(state, params).await,

        "agent/prompt" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            handle
                .send(AgentCommand::Prompt(str_param(&params, "text")?))
                .await?;
            Ok(json!({}))
        }

        "agent/steer" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            handle
                .send(AgentCommand::Steer(str_param(&params, "text")?))
                .await?;
            Ok(json!({}))
        }

        "agent/abort" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            handle.send(AgentCommand::Abort).await?;
            Ok(json!({}))
        }

        "agent/state" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            let (reply, rx) = oneshot::channel();
            handle.send(AgentCommand::Snapshot { reply }).await?;
            let snapshot = rx
                .await
                .map_err(|_| RpcError::new(rpc::ERR_INTERNAL, "agent loop unavailable"))?;
            serde_json::to_value(snapshot)
                .map_err(|e| RpcError::new(rpc::ERR_INTERNAL, e.to_string()))
        }

        "session/list" => Ok(json!({ "sessions": state.supervisor.list_sessions() })),

        "session/branch" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            let (reply, rx) = oneshot::channel();
            handle
                .send(AgentCommand::Branch {
                    entry_id: str_param(&params, "entry_id")?,
                    reply,
                })
                .await?;
            rx.await
                .map_err(|_| RpcError::new(rpc::ERR_INTERNAL, "agent loop unavailable"))??;
            Ok(json!({}))
        }

        "session/compact" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            let keep_recent_tokens = params["keep_recent"]
                .as_u64()
                .map(|n| n as usize)
                .unwrap_or(state.config.agent.compact_keep_recent_tokens);
            let (reply, rx) = oneshot::channel();
            handle
                .send(AgentCommand::Compact {
                    options: CompactOptions {
                        strategy: CompactStrategy::Truncate,
                        keep_recent_tokens,
                        force: false,
                    },
                    reply,
                })
                .await?;
            rx.await
                .map_err(|_| RpcError::new(rpc::ERR_INTERNAL, "agent loop unavailable"))??;
            Ok(json!({}))
        }

        "models/list" => {
            let filter: Option<Vec<String>> = params["providers"].as_array().map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });
            let models: Vec<Value> = static_catalog()
                .into_iter()
                .filter(|e| {
                    filter
                        .as_ref()
                        .map(|f| f.contains(&e.provider))
                        .unwrap_or(true)
                })
                .map(|e| serde_json::to_value(e).unwrap_or_default())
                .collect();
            Ok(json!({ "models": models }))
        }

        "model/set" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            let spec = str_param(&params, "model_id")?;
            let new_cfg = handle.model_cfg.lock().unwrap().with_spec(&spec);
            let provider =
                build_provider(&new_cfg, state.auth.key_for(&new_cfg.provider))?;
            *handle.model_cfg.lock().unwrap() = new_cfg;

            let (reply, rx) = oneshot::channel();
            handle.send(AgentCommand::SetProvider { provider, reply }).await?;
            let _ = rx.await;
            if let Some(level) = opt_str(&params, "thinking_level") {
                let (reply, rx) = oneshot::channel();
                handle.send(AgentCommand::SetThinking { level, reply }).await?;
                let _ = rx.await;
            }
            Ok(json!({ "model": handle.model_spec() }))
        }

        "thinking/set" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            let level = str_param(&params, "level")?;
            let (reply, rx) = oneshot::channel();
            handle
                .send(AgentCommand::SetThinking {
                    level: level.clone(),
                    reply,
                })
                .await?;
            let _ = rx.await;
            Ok(json!({ "thinking_level": level }))
        }

        "auth/status" => Ok(state.auth.status()),
        "auth/login" => Ok(state.auth.begin_login()?),
        "auth/poll" => Ok(state.auth.poll_login(&str_param(&params, "device_code")?)?),
        "auth/set_key" => {
            state
                .auth
                .set_key(&str_param(&params, "provider")?, &str_param(&params, "api_key")?)?;
            Ok(json!({ "ok": true }))
        }

        "tasks/list" => {
            // Validate the session; sub-agent tasks surface via
            // sub_agent_event, so the poll answer is the live set (none once
            // they finish).
            state.supervisor.get(&str_param(&params, "session_id")?)?;
            Ok(json!({ "tasks": [] }))
        }

        "settings/get" => Ok(json!({ "settings": read_settings(state) })),
        "settings/save" => {
            let settings = params
                .get("settings")
                .cloned()
                .unwrap_or_else(|| json!({}));
            write_settings(state, &settings)?;
            Ok(json!({ "settings": settings }))
        }

        "opal/config/get" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            Ok(runtime_config(state, &handle))
        }
        "opal/config/set" => {
            let handle = state.supervisor.get(&str_param(&params, "session_id")?)?;
            {
                let mut overrides = handle.runtime_overrides.lock().unwrap();
                if let Some(features) = params.get("features") {
                    overrides["features"] = features.clone();
                }
                if let Some(tools) = params.get("tools") {
                    overrides["tools"] = tools.clone();
                }
            }
            Ok(runtime_config(state, &handle))
        }

        other => Err(RpcError::method_not_found(other)),
    }
}

fn runtime_config(state: &Arc<ServerState>, handle: &crate::SessionHandle) -> Value {
    let overrides = handle.runtime_overrides.lock().unwrap().clone();
    json!({
        "features": overrides.get("features").cloned().unwrap_or_else(|| json!({})),
        "tools": overrides.get("tools").cloned().unwrap_or_else(|| json!({
            "disabled": state.config.tools.disabled,
        })),
    })
}

fn settings_path(state: &Arc<ServerState>) -> PathBuf {
    state.data_dir.join("cli_state.json")
}

fn read_settings(state: &Arc<ServerState>) -> Value {
    std::fs::read_to_string(settings_path(state))
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({}))
}

fn write_settings(state: &Arc<ServerState>, settings: &Value) -> Result<()> {
    let path = settings_path(state);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

async fn session_start(
    state: &Arc<ServerState>,
    params: Value,
) -> std::result::Result<Value, RpcError> {
    let start = StartParams {
        // Both spellings appear in the wild; `session_id` wins.
        session_id: opt_str(&params, "session_id").or_else(|| opt_str(&params, "session")),
        model: opt_str(&params, "model"),
        system_prompt: opt_str(&params, "system_prompt"),
        working_dir: opt_str(&params, "working_dir").map(PathBuf::from),
        tools: params["tools"].as_array().map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
    };

    let confirmer = Arc::new(RpcConfirmer {
        bridge: Arc::clone(&state.bridge),
    });
    let question_handler = Arc::new(RpcQuestionHandler {
        bridge: Arc::clone(&state.bridge),
        session_id: Mutex::new(String::new()),
    });

    let (handle, created) =
        state
            .supervisor
            .start_session(start, confirmer, Some(question_handler.clone()))?;
    *question_handler.session_id.lock().unwrap() = handle.session_id.clone();

    if created {
        // Forward every bus event as an agent/event notification.
        let mut sub = handle.bus.subscribe();
        let outbound = state.outbound.clone();
        let session_id = handle.session_id.clone();
        tokio::spawn(async move {
            while let Some(rec) = sub.next().await {
                let terminal = rec.event.is_terminal();
                let mut event_params = serde_json::to_value(&rec.event).unwrap_or_else(|_| json!({}));
                if let Some(obj) = event_params.as_object_mut() {
                    obj.insert("session_id".into(), json!(session_id));
                    obj.insert("seq".into(), json!(rec.seq));
                }
                let note = notification("agent/event", event_params);
                if outbound
                    .send(Outbound::Event {
                        value: note,
                        terminal,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        for path in &handle.discovered.context_files {
            handle.bus.publish(opal_core::AgentEvent::ContextDiscovered {
                path: path.clone(),
            });
        }
    }

    let node_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
    Ok(json!({
        "session_id": handle.session_id.clone(),
        "session_dir": state.supervisor.sessions_dir().display().to_string(),
        "context_files": handle.discovered.context_files.clone(),
        "available_skills": handle.discovered.skills.clone(),
        "mcp_servers": [],
        "node_name": node_name,
        "auth": state.auth.status()["auth"],
    }))
}
