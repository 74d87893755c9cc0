// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod auth;
mod discovery;
mod rpc;
mod server;
mod supervisor;

pub use auth::AuthStore;
pub use discovery::{discover, Discovered, SkillInfo};
pub use rpc::{
    normalize_keys, snake_to_camel, to_snake_case, RpcError, ERR_INTERNAL, ERR_INVALID_PARAMS,
    ERR_INVALID_REQUEST, ERR_METHOD_NOT_FOUND, ERR_PARSE,
};
pub use server::serve;
pub use supervisor::{
    peek_header, resolve_working_dir, SessionHandle, SessionInfo, SessionSupervisor, StartParams,
};
