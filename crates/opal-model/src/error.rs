// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Shared error type used across all opal crates.
///
/// Variants are kinds, not transports: callers match on the kind to decide
/// whether an error is retryable, reportable to the model, or final.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Operation attempted after local shutdown.
    #[error("client closed")]
    ClientClosed,

    /// Backend process exited or stdio closed underneath us.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Scoped to a single method or tool call, never the whole session.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The server reported an application-level JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    RpcServer {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// User-requested cancellation.
    #[error("aborted")]
    Aborted,

    /// Provider failure worth retrying (rate limits, 5xx, resets).
    #[error("provider error (transient): {0}")]
    ProviderTransient(String),

    /// Provider failure that retrying cannot fix (context overflow, auth).
    #[error("provider error (permanent): {0}")]
    ProviderPermanent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Captured inside a tool_result with `is_error = true`; surfaced here
    /// only when the runner itself cannot produce a result.
    #[error("tool execution: {0}")]
    ToolExecution(String),

    /// Malformed first line of a persisted session file.
    #[error("corrupt session header: {0}")]
    CorruptHeader(String),

    /// Malformed message line in a persisted session file.
    #[error("corrupt message at line {line}: {reason}")]
    CorruptMessage { line: usize, reason: String },

    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for provider errors the retry loop may attempt again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ProviderTransient(_))
    }
}
