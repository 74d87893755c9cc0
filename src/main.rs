// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{AuthCommands, Cli, Commands, SessionCommands};
use opal_core::{AgentCommand, AgentEvent};
use opal_model::Result as OpalResult;
use opal_server::{AuthStore, SessionSupervisor, StartParams};
use opal_store::MessageStore;
use opal_tools::{AutoConfirmer, ConfirmAction, ConfirmRequest, Confirmer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    // Pin the process-wide TLS crypto provider before any provider adapter
    // builds a client.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = opal_config::load(cli.config.as_deref())?;
    if let Some(spec) = &cli.model {
        config.model = config.model.with_spec(spec);
    }
    if cli.auto_confirm {
        config.tools.auto_confirm = true;
    }
    if let Some(dir) = &cli.dir {
        std::env::set_var("OPAL_CWD", dir);
    }
    let config = Arc::new(config);
    let data_dir = opal_config::data_dir();

    match &cli.command {
        Some(Commands::Serve) => serve(config, data_dir).await,
        Some(Commands::Session { command }) => session_command(command, config, data_dir).await,
        Some(Commands::Auth { command }) => auth_command(command, &data_dir),
        Some(Commands::Doctor) => doctor(&config, &data_dir),
        None => match cli.prompt.clone() {
            Some(prompt) => one_shot(cli, config, data_dir, prompt).await,
            None => serve(config, data_dir).await,
        },
    }
}

fn init_logging(debug: bool) {
    // stdout carries the RPC channel (or the one-shot answer); all logging
    // goes to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(config: Arc<opal_config::Config>, data_dir: std::path::PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(opal_config::sessions_dir())?;
    std::fs::create_dir_all(opal_config::logs_dir())?;
    info!(data_dir = %data_dir.display(), "starting stdio RPC server");
    opal_server::serve(config, data_dir, tokio::io::stdin(), tokio::io::stdout()).await
}

// ── One-shot mode ─────────────────────────────────────────────────────────────

/// Confirms tool calls on the controlling terminal.
struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, req: ConfirmRequest) -> OpalResult<ConfirmAction> {
        eprintln!("\n{}\n{}", req.title, req.message);
        eprint!("[a]llow / [d]eny / allow for [s]ession? ");
        let line = tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin().read_line(&mut buf).map(|_| buf)
        })
        .await
        .map_err(|e| opal_model::Error::ToolExecution(e.to_string()))?
        .map_err(opal_model::Error::Storage)?;
        Ok(match line.trim().chars().next() {
            Some('a') | Some('A') | Some('y') | Some('Y') => ConfirmAction::Allow,
            Some('s') | Some('S') => ConfirmAction::AllowSession,
            _ => ConfirmAction::Deny,
        })
    }
}

async fn one_shot(
    cli: Cli,
    config: Arc<opal_config::Config>,
    data_dir: std::path::PathBuf,
    prompt: String,
) -> anyhow::Result<()> {
    use std::io::Write;

    let auth = Arc::new(AuthStore::load(&data_dir));
    let supervisor = SessionSupervisor::new(Arc::clone(&config), data_dir, auth);
    let confirmer: Arc<dyn Confirmer> = if config.tools.auto_confirm {
        Arc::new(AutoConfirmer)
    } else {
        Arc::new(TerminalConfirmer)
    };

    let params = StartParams {
        session_id: cli.session.clone(),
        working_dir: cli.dir.clone(),
        ..Default::default()
    };
    let (handle, _) = match supervisor.start_session(params, confirmer, None) {
        Ok(started) => started,
        Err(e) => {
            eprintln!("opal: failed to start session: {e}");
            std::process::exit(1);
        }
    };

    let mut sub = handle.bus.subscribe();
    handle.send(AgentCommand::Prompt(prompt)).await?;

    while let Some(rec) = sub.next().await {
        match rec.event {
            AgentEvent::MessageDelta { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ToolExecutionStart { name, .. } => {
                eprintln!("[tool] {name} ...");
            }
            AgentEvent::ToolExecutionEnd { name, is_error, .. } => {
                eprintln!("[tool] {name} {}", if is_error { "failed" } else { "ok" });
            }
            AgentEvent::AgentEnd { .. } => {
                println!();
                return Ok(());
            }
            AgentEvent::AgentAbort => {
                eprintln!("aborted");
                std::process::exit(1);
            }
            AgentEvent::Error { reason } => {
                eprintln!("opal: {reason}");
                std::process::exit(1);
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn session_command(
    command: &SessionCommands,
    config: Arc<opal_config::Config>,
    data_dir: std::path::PathBuf,
) -> anyhow::Result<()> {
    let auth = Arc::new(AuthStore::load(&data_dir));
    let supervisor = SessionSupervisor::new(config, data_dir, auth);
    match command {
        SessionCommands::List => {
            for info in supervisor.list_sessions() {
                println!(
                    "{}  {}  {}",
                    info.id,
                    info.modified.format("%Y-%m-%d %H:%M"),
                    info.title.as_deref().unwrap_or("(untitled)")
                );
            }
            Ok(())
        }
        SessionCommands::Show { id } => {
            let path = supervisor.sessions_dir().join(format!("{id}.jsonl"));
            let store = match MessageStore::load(&path) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("opal: cannot load session {id}: {e}");
                    std::process::exit(1);
                }
            };
            for msg in store.path() {
                let role = serde_json::to_value(msg.role)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                println!("## {role}");
                if let Some(thinking) = &msg.thinking {
                    println!("(thinking) {thinking}");
                }
                println!("{}\n", msg.text());
                for tc in msg.tool_call_specs() {
                    println!("[tool_call {} {}({})]\n", tc.call_id, tc.name, tc.arguments);
                }
            }
            Ok(())
        }
        SessionCommands::Delete { id } => match supervisor.delete_session(id).await {
            Ok(()) => {
                println!("deleted {id}");
                Ok(())
            }
            Err(e) => {
                eprintln!("opal: {e}");
                std::process::exit(1);
            }
        },
    }
}

fn auth_command(command: &AuthCommands, data_dir: &std::path::Path) -> anyhow::Result<()> {
    let auth = AuthStore::load(data_dir);
    match command {
        AuthCommands::Status => {
            println!("{}", serde_json::to_string_pretty(&auth.status())?);
            Ok(())
        }
        AuthCommands::Login => match auth.begin_login() {
            Ok(info) => {
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            }
            Err(e) => {
                eprintln!("opal: {e}");
                std::process::exit(1);
            }
        },
    }
}

fn doctor(config: &opal_config::Config, data_dir: &std::path::Path) -> anyhow::Result<()> {
    println!("opal doctor");
    println!("  data dir:   {}", data_dir.display());
    println!(
        "  writable:   {}",
        std::fs::create_dir_all(data_dir).is_ok()
    );
    println!("  model:      {}/{}", config.model.provider, config.model.name);

    let sessions = opal_config::sessions_dir();
    let count = std::fs::read_dir(&sessions)
        .map(|rd| {
            rd.flatten()
                .filter(|e| {
                    e.path().extension().and_then(|x| x.to_str()) == Some("jsonl")
                })
                .count()
        })
        .unwrap_or(0);
    println!("  sessions:   {count}");

    let auth = AuthStore::load(data_dir);
    let status = auth.status();
    println!(
        "  auth:       {}",
        status["auth"]["status"].as_str().unwrap_or("unknown")
    );
    Ok(())
}
