// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod builtin;
mod registry;
mod runner;
mod tool;

pub use builtin::{
    builtin_registry, AskUserTool, EditFileTool, ListDirTool, ReadFileTool, ShellTool,
    WriteFileTool,
};
pub use registry::ToolRegistry;
pub use runner::{
    AutoConfirmer, ConfirmAction, ConfirmRequest, Confirmer, RunnerEvent, ToolRunner,
};
pub use tool::{QuestionHandler, Tool, ToolCall, ToolContext, ToolResult};
