// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Opal — a coding-agent runtime.
///
/// With a prompt argument, runs one agent turn and streams the answer to
/// stdout.  Without one, starts the JSON-RPC 2.0 server on stdin/stdout
/// (newline-delimited; logs go to stderr).
#[derive(Parser, Debug)]
#[command(name = "opal", version, about)]
pub struct Cli {
    /// One-shot prompt.  Omit to start the stdio RPC server.
    pub prompt: Option<String>,

    /// Model as `provider/id` (e.g. `anthropic/claude-sonnet-4-5`) or a bare
    /// model id for the configured provider.
    #[arg(long)]
    pub model: Option<String>,

    /// Working directory for the session.
    #[arg(short = 'C', long = "cwd")]
    pub dir: Option<PathBuf>,

    /// Resume an existing session by id.
    #[arg(short = 's', long = "session")]
    pub session: Option<String>,

    /// Skip all tool confirmation prompts.
    #[arg(long)]
    pub auto_confirm: bool,

    /// Verbose logging on stderr.
    #[arg(long)]
    pub debug: bool,

    /// Explicit config file (merged over the discovered layers).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the JSON-RPC server on stdin/stdout (same as running with no
    /// prompt).
    Serve,

    /// Inspect or delete persisted sessions.
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Authentication helpers.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Check the local installation: data dir, config, credentials.
    Doctor,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List persisted sessions, most recently modified first.
    List,
    /// Print a session's conversation.
    Show { id: String },
    /// Delete a session's persisted state.
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Device-code login (where the provider supports it).
    Login,
    /// Show which providers have credentials.
    Status,
}
