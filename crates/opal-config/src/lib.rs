// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod paths;
mod schema;

pub use loader::load;
pub use paths::{data_dir, logs_dir, sessions_dir};
pub use schema::*;
