// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System prompt assembly.

/// Default system prompt, optionally extended with discovered project
/// context files.
pub fn default_system_prompt(working_dir: &str, context_files: &[String]) -> String {
    let mut prompt = format!(
        "You are Opal, a coding agent operating in {working_dir}.\n\
         Use the available tools to inspect and modify the project; prefer \
         reading files over guessing their contents. Keep answers concise. \
         When a task needs several steps, work through them with tool calls \
         and report the outcome at the end."
    );
    if !context_files.is_empty() {
        prompt.push_str("\n\nProject context files (read them when relevant): ");
        prompt.push_str(&context_files.join(", "));
    }
    prompt
}
